use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{Int4, Nullable, Text, Timestamptz};

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::fetchlogs)]
pub struct NewFetchlog<'a> {
    pub key: &'a str,
    pub file_size: Option<i64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub init_datetime: DateTime<Utc>,
}

/// One unit of work handed out by a claim.
#[derive(Debug, Clone, QueryableByName)]
pub struct ClaimedFetchlog {
    #[diesel(sql_type = Int4)]
    pub fetchlogs_id: i32,
    #[diesel(sql_type = Text)]
    pub key: String,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Queryable, Selectable, QueryableByName)]
#[diesel(table_name = crate::schema::fetchlogs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Fetchlog {
    pub fetchlogs_id: i32,
    pub key: String,
    pub file_size: Option<i64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub init_datetime: Option<DateTime<Utc>>,
    pub loaded_datetime: Option<DateTime<Utc>>,
    pub completed_datetime: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub has_error: bool,
    pub jobs: i32,
    pub batch_uuid: Option<String>,
}

// Rows accumulated in memory during one file ingest, bulk-copied into the
// staging tables by `staging::dump_locations` / `staging::dump_measurements`.
// Numeric-ish fields keep their lexical form up to the copy boundary; the
// database parses them on the way in.

#[derive(Debug, Clone)]
pub struct StagedKey {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub fetchlogs_id: i32,
}

#[derive(Debug, Clone, Default)]
pub struct StagedNode {
    pub ingest_id: String,
    pub site_name: Option<String>,
    pub matching_method: Option<String>,
    pub source_name: Option<String>,
    pub source_id: Option<String>,
    pub ismobile: Option<bool>,
    pub geom: Option<String>,
    pub metadata: String,
    pub fetchlogs_id: i32,
}

#[derive(Debug, Clone, Default)]
pub struct StagedSystem {
    pub ingest_id: String,
    pub instrument_ingest_id: Option<String>,
    pub ingest_sensor_nodes_id: String,
    pub metadata: String,
    pub fetchlogs_id: i32,
}

#[derive(Debug, Clone, Default)]
pub struct StagedSensor {
    pub ingest_id: String,
    pub ingest_sensor_systems_id: String,
    pub measurand: Option<String>,
    pub units: Option<String>,
    pub status: Option<String>,
    pub logging_interval_seconds: Option<String>,
    pub averaging_interval_seconds: Option<String>,
    pub metadata: String,
    pub fetchlogs_id: i32,
}

#[derive(Debug, Clone, Default)]
pub struct StagedFlag {
    pub ingest_id: String,
    pub sensor_ingest_id: String,
    pub datetime_from: Option<String>,
    pub datetime_to: Option<String>,
    pub note: Option<String>,
    pub metadata: String,
    pub fetchlogs_id: i32,
}

#[derive(Debug, Clone)]
pub struct StagedMeasurement {
    pub ingest_id: String,
    pub source_name: String,
    pub source_id: String,
    pub measurand: String,
    pub value: Option<String>,
    pub datetime: String,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    pub fetchlogs_id: i32,
}
