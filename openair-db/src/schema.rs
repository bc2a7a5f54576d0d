diesel::table! {
    fetchlogs (fetchlogs_id) {
        fetchlogs_id -> Int4,
        key -> Text,
        file_size -> Nullable<Int8>,
        last_modified -> Nullable<Timestamptz>,
        init_datetime -> Nullable<Timestamptz>,
        loaded_datetime -> Nullable<Timestamptz>,
        completed_datetime -> Nullable<Timestamptz>,
        last_message -> Nullable<Text>,
        has_error -> Bool,
        jobs -> Int4,
        batch_uuid -> Nullable<Text>,
    }
}

// The staging tables are created at runtime from the DDL templates in sql/,
// either session-temporary or permanent depending on configuration. These
// declarations exist so the copy targets are typed.

diesel::table! {
    staging_keys (fetchlogs_id) {
        key -> Text,
        last_modified -> Nullable<Timestamptz>,
        fetchlogs_id -> Int4,
    }
}

diesel::table! {
    staging_sensornodes (ingest_id) {
        ingest_id -> Text,
        site_name -> Nullable<Text>,
        matching_method -> Nullable<Text>,
        source_name -> Nullable<Text>,
        source_id -> Nullable<Text>,
        ismobile -> Nullable<Bool>,
        geom -> Nullable<Text>,
        metadata -> Nullable<Text>,
        fetchlogs_id -> Int4,
    }
}

diesel::table! {
    staging_sensorsystems (ingest_id) {
        ingest_id -> Text,
        instrument_ingest_id -> Nullable<Text>,
        ingest_sensor_nodes_id -> Text,
        metadata -> Nullable<Text>,
        fetchlogs_id -> Int4,
    }
}

diesel::table! {
    staging_sensors (ingest_id) {
        ingest_id -> Text,
        ingest_sensor_systems_id -> Text,
        measurand -> Nullable<Text>,
        units -> Nullable<Text>,
        status -> Nullable<Text>,
        logging_interval_seconds -> Nullable<Int4>,
        averaging_interval_seconds -> Nullable<Int4>,
        metadata -> Nullable<Text>,
        fetchlogs_id -> Int4,
    }
}

diesel::table! {
    staging_flags (ingest_id) {
        ingest_id -> Text,
        sensor_ingest_id -> Text,
        datetime_from -> Nullable<Timestamptz>,
        datetime_to -> Nullable<Timestamptz>,
        note -> Nullable<Text>,
        metadata -> Nullable<Text>,
        fetchlogs_id -> Int4,
    }
}

diesel::table! {
    staging_measurements (ingest_id) {
        ingest_id -> Text,
        source_name -> Nullable<Text>,
        source_id -> Nullable<Text>,
        measurand -> Nullable<Text>,
        value -> Nullable<Float8>,
        datetime -> Nullable<Timestamptz>,
        lon -> Nullable<Float8>,
        lat -> Nullable<Float8>,
        fetchlogs_id -> Int4,
    }
}
