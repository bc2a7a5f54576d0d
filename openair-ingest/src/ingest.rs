use chrono::{DateTime, Utc};
use hashbrown::HashSet;
use log::{debug, error, info, warn};
use miette::Diagnostic;
use obstore::ObjectReader;
use openair_db::models::{
    ClaimedFetchlog, StagedFlag, StagedKey, StagedMeasurement, StagedNode, StagedSensor,
    StagedSystem,
};
use openair_db::staging::LocationsDump;
use openair_db::{Connection, PgConnection, QueryError, queue, staging};
use serde_json::{Map, Value};
use std::time::Instant;
use strum::{Display, EnumString};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

use crate::parse::{PayloadFormat, csv_record};
use crate::resources::Resources;

/// Errors that abort processing of one file. Whether the fetchlog row is
/// quarantined or left for the visibility timeout depends on
/// `is_retriable`.
#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("Not sure how to read file: {key}")]
    UnsupportedFormat { key: String },

    #[error(transparent)]
    Fetch(#[from] obstore::StoreError),

    #[error("error reading object body: {0}")]
    Read(std::io::Error),

    #[error("malformed document: {0}")]
    MalformedDocument(serde_json::Error),

    #[error("Missing ingest id")]
    MissingIngestId,

    #[error("Could not find source name for `{ingest_id}`")]
    MissingSourceName { ingest_id: String },
}

impl IngestError {
    pub fn is_retriable(&self) -> bool {
        match self {
            IngestError::Fetch(err) => err.is_retriable(),
            _ => false,
        }
    }
}

/// Errors that abort a whole stream iteration. The orchestrator logs these
/// and moves on to the next stream.
#[derive(Debug, Error, Diagnostic)]
pub enum IngestFatalError {
    #[error("couldn't get a database connection")]
    DbPool(#[from] openair_db::PoolError),

    #[error(transparent)]
    Db(#[from] QueryError),
}

/// How promoted nodes are matched to existing locations downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum MatchingMethod {
    IngestId,
    LocationId,
    SensorId,
}

/// One record on the measures path: a CSV tuple or a JSON document.
#[derive(Debug)]
pub enum MeasurementInput<'a> {
    CsvRow(&'a [String]),
    JsonRecord(&'a Value),
}

#[derive(Debug, Clone, Copy)]
enum Transform {
    Identity,
    Geometry,
    Timestamp,
    SensorId,
    NodeId,
}

/// One alias in a field-translation table: where the value lands and how it
/// is transformed on the way.
struct FieldRule {
    alias: &'static str,
    column: &'static str,
    transform: Transform,
}

const fn rule(alias: &'static str, column: &'static str, transform: Transform) -> FieldRule {
    FieldRule {
        alias,
        column,
        transform,
    }
}

/// Aliases accepted on location documents. Order matters: for a given
/// column the first present alias wins.
static NODE_FIELDS: &[FieldRule] = &[
    rule("fetchlogs_id", "fetchlogs_id", Transform::Identity),
    rule("ingest_id", "ingest_id", Transform::NodeId),
    rule("location", "ingest_id", Transform::NodeId),
    rule("sensor_node_id", "ingest_id", Transform::NodeId),
    rule("key", "ingest_id", Transform::NodeId),
    rule("site_name", "site_name", Transform::Identity),
    rule("label", "site_name", Transform::Identity),
    rule("source_name", "source_name", Transform::Identity),
    rule("ismobile", "ismobile", Transform::Identity),
    rule("matching_method", "matching_method", Transform::Identity),
    rule("coordinates", "geom", Transform::Geometry),
    rule("geometry", "geom", Transform::Geometry),
    rule("lat", "geom", Transform::Geometry),
    rule("lon", "geom", Transform::Geometry),
    rule("latitude", "geom", Transform::Geometry),
    rule("longitude", "geom", Transform::Geometry),
];

/// Aliases accepted on measurement documents.
static MEASUREMENT_FIELDS: &[FieldRule] = &[
    rule("ingest_id", "ingest_id", Transform::SensorId),
    rule("sensor_id", "ingest_id", Transform::SensorId),
    rule("key", "ingest_id", Transform::SensorId),
    rule("datetime", "datetime", Transform::Timestamp),
    rule("timestamp", "datetime", Transform::Timestamp),
    rule("value", "value", Transform::Identity),
    rule("measure", "value", Transform::Identity),
    rule("lat", "lat", Transform::Identity),
    rule("lon", "lon", Transform::Identity),
];

fn is_mapped(rules: &[FieldRule], key: &str) -> bool {
    rules.iter().any(|r| r.alias == key)
}

fn mapped_value<'v>(
    obj: &'v Map<String, Value>,
    rules: &[FieldRule],
    column: &str,
) -> Option<&'v Value> {
    rules
        .iter()
        .filter(|r| r.column == column)
        .find_map(|r| obj.get(r.alias))
}

/// Resolve a target column through the translation table, applying the
/// rule's transform to the first alias present in the document.
fn transformed_value(obj: &Map<String, Value>, rules: &[FieldRule], column: &str) -> Option<String> {
    rules.iter().filter(|r| r.column == column).find_map(|r| {
        let value = obj.get(r.alias)?;
        match r.transform {
            Transform::Identity => scalar_to_string(value),
            Transform::NodeId | Transform::SensorId => {
                scalar_to_string(value).map(|id| id.trim().to_string())
            }
            Transform::Timestamp => to_timestamp(value),
            Transform::Geometry => to_geometry(obj),
        }
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Canonicalize the unicode soup of microgram spellings.
pub fn fix_units(value: &str) -> &str {
    match value {
        "\u{03bc}g/m3" | "\u{00b5}g/m3" | "\u{03bc}g/m\u{00b3}" => "\u{00b5}g/m\u{00b3}",
        other => other,
    }
}

/// Parse a timestamp into ISO-8601 UTC. Numeric input is an epoch: 13
/// digits are milliseconds, anything else seconds. Non-numeric input must
/// be RFC 3339; there is no free-form date guessing and no invented
/// offsets.
pub fn to_timestamp(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => {
            warn!("passed empty value for timestamp");
            return None;
        }
    };

    if raw.chars().all(|c| c.is_ascii_digit()) {
        let parsed = raw.parse::<i64>().ok();
        let dt = if raw.len() == 13 {
            parsed.and_then(DateTime::from_timestamp_millis)
        } else {
            parsed.and_then(|secs| DateTime::from_timestamp(secs, 0))
        };
        return dt.map(|dt| dt.to_rfc3339());
    }

    match DateTime::parse_from_rfc3339(&raw) {
        Ok(dt) => Some(dt.with_timezone(&Utc).to_rfc3339()),
        Err(err) => {
            warn!("dropping malformed timestamp `{raw}`: {err}");
            None
        }
    }
}

fn coordinate(value: f64, bound: f64) -> Option<f64> {
    if value == 0.0 || !(-bound..=bound).contains(&value) {
        None
    } else {
        Some(value)
    }
}

fn coordinate_from_value(value: &Value, bound: f64) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.and_then(|v| coordinate(v, bound))
}

fn coordinate_field(obj: &Map<String, Value>, aliases: &[&str], bound: f64) -> Option<f64> {
    aliases
        .iter()
        .find_map(|alias| obj.get(*alias))
        .and_then(|v| coordinate_from_value(v, bound))
}

/// Build an EWKT point from whatever coordinate shape the document carries:
/// a nested `coordinates`/`geometry` object or document-level lat/lon.
/// A missing half, a zero coordinate, or an out-of-range value yields no
/// geometry at all.
fn to_geometry(obj: &Map<String, Value>) -> Option<String> {
    let nested = obj
        .get("coordinates")
        .or_else(|| obj.get("geometry"))
        .and_then(Value::as_object);
    let source = nested.unwrap_or(obj);

    let lat = coordinate_field(source, &["lat", "latitude"], 90.0)?;
    let lon = coordinate_field(source, &["lon", "longitude"], 180.0)?;
    Some(format!("SRID=4326;POINT({lon} {lat})"))
}

fn synthesized_ingest_id(obj: &Map<String, Value>) -> Option<String> {
    let source = obj
        .get("sourceName")
        .or_else(|| obj.get("source_name"))
        .and_then(scalar_to_string)?;
    let location = obj.get("location").and_then(scalar_to_string)?;
    let parameter = obj.get("parameter").and_then(scalar_to_string)?;
    Some(format!("{source}-{location}-{parameter}"))
}

/// In-memory accumulator for one ingest run. Files are loaded one at a
/// time; everything is bulk-copied at once by `dump`.
pub struct IngestBatch {
    fetchlogs_id: Option<i32>,
    source: Option<String>,
    matching_method: MatchingMethod,
    schema_version: Option<String>,
    pub keys: Vec<StagedKey>,
    pub nodes: Vec<StagedNode>,
    pub systems: Vec<StagedSystem>,
    pub sensors: Vec<StagedSensor>,
    pub flags: Vec<StagedFlag>,
    pub measurements: Vec<StagedMeasurement>,
    node_ids: HashSet<String>,
    system_ids: HashSet<String>,
    sensor_ids: HashSet<String>,
}

impl Default for IngestBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestBatch {
    pub fn new() -> Self {
        Self {
            fetchlogs_id: None,
            source: None,
            matching_method: MatchingMethod::IngestId,
            schema_version: None,
            keys: Vec::new(),
            nodes: Vec::new(),
            systems: Vec::new(),
            sensors: Vec::new(),
            flags: Vec::new(),
            measurements: Vec::new(),
            node_ids: HashSet::new(),
            system_ids: HashSet::new(),
            sensor_ids: HashSet::new(),
        }
    }

    /// Clear all accumulated state so the batch can be reused.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Fetch, parse and accumulate one claimed file, then record its key
    /// for finalization.
    pub async fn load_key(
        &mut self,
        resources: &Resources,
        row: &ClaimedFetchlog,
    ) -> Result<(), IngestError> {
        debug!("loading key: {}//:{}", row.fetchlogs_id, row.key);
        self.fetchlogs_id = Some(row.fetchlogs_id);

        let format = PayloadFormat::from_key(&row.key).ok_or_else(|| {
            IngestError::UnsupportedFormat {
                key: row.key.clone(),
            }
        })?;

        let reader = resources.store.open(&row.key).await?;
        match format {
            PayloadFormat::Csv => self.load_csv(reader).await?,
            PayloadFormat::NdJson => self.load_ndjson(reader).await?,
            PayloadFormat::Json => {
                let mut reader = reader;
                let mut content = String::new();
                reader
                    .read_to_string(&mut content)
                    .await
                    .map_err(IngestError::Read)?;
                let document: Value =
                    serde_json::from_str(&content).map_err(IngestError::MalformedDocument)?;
                self.load_document(&document)?;
            }
        }

        self.keys.push(StagedKey {
            key: row.key.clone(),
            last_modified: row.last_modified,
            fetchlogs_id: row.fetchlogs_id,
        });
        Ok(())
    }

    /// All CSV data are measurements.
    async fn load_csv(&mut self, reader: ObjectReader) -> Result<(), IngestError> {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await.map_err(IngestError::Read)? {
            if line.trim().is_empty() {
                continue;
            }
            match csv_record(&line) {
                Some(fields) if fields.len() == 3 || fields.len() == 5 => {
                    self.add_measurement(MeasurementInput::CsvRow(&fields));
                }
                Some(fields) => {
                    warn!("dropping record with {} fields: {fields:?}", fields.len());
                }
                None => {}
            }
        }
        Ok(())
    }

    /// One JSON measurement document per non-empty line.
    async fn load_ndjson(&mut self, reader: ObjectReader) -> Result<(), IngestError> {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await.map_err(IngestError::Read)? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(document) => self.add_measurement(MeasurementInput::JsonRecord(&document)),
                Err(err) => warn!("dropping malformed line: {err}"),
            }
        }
        Ok(())
    }

    pub fn load_document(&mut self, document: &Value) -> Result<(), IngestError> {
        let Some(obj) = document.as_object() else {
            warn!("document is not an object");
            return Ok(());
        };
        if let Some(meta) = obj.get("meta") {
            self.load_metadata(meta);
        }
        if let Some(locations) = obj.get("locations").and_then(Value::as_array) {
            self.load_locations(locations)?;
        }
        if let Some(measures) = obj.get("measures").and_then(Value::as_array) {
            self.load_measurements(measures);
        }
        Ok(())
    }

    pub fn load_metadata(&mut self, meta: &Value) {
        let Some(obj) = meta.as_object() else {
            return;
        };
        if let Some(source) = obj
            .get("source")
            .or_else(|| obj.get("sourceName"))
            .and_then(scalar_to_string)
        {
            self.source = Some(source);
        }
        if let Some(method) = obj
            .get("matching_method")
            .or_else(|| obj.get("ingestMatchingMethod"))
            .and_then(Value::as_str)
        {
            match method.parse() {
                Ok(method) => self.matching_method = method,
                Err(_) => warn!("unknown matching method `{method}`"),
            }
        }
        if let Some(schema) = obj
            .get("schema")
            .or_else(|| obj.get("schemaVersion"))
            .and_then(scalar_to_string)
        {
            self.schema_version = Some(schema);
        }
    }

    pub fn load_locations(&mut self, locations: &[Value]) -> Result<(), IngestError> {
        for location in locations {
            self.add_node(location)?;
        }
        Ok(())
    }

    pub fn load_measurements(&mut self, measurements: &[Value]) {
        debug!("loading {} measurements", measurements.len());
        for measurement in measurements {
            self.add_measurement(MeasurementInput::JsonRecord(measurement));
        }
    }

    pub fn add_node(&mut self, document: &Value) -> Result<(), IngestError> {
        let Some(obj) = document.as_object() else {
            warn!("nothing mapped to node");
            return Ok(());
        };

        let fetchlogs_id = obj
            .get("fetchlogs_id")
            .and_then(Value::as_i64)
            .map(|id| id as i32)
            .or(self.fetchlogs_id)
            .unwrap_or_default();

        let ingest_id =
            transformed_value(obj, NODE_FIELDS, "ingest_id").ok_or(IngestError::MissingIngestId)?;

        let mut metadata = Map::new();
        for (key, value) in obj {
            if !is_mapped(NODE_FIELDS, key) && key != "systems" && key != "sensor_system" {
                metadata.insert(key.clone(), value.clone());
            }
        }

        let tokens: Vec<&str> = ingest_id.split('-').collect();

        // source name could be set explicitly, in the ingest id, or in the
        // payload metadata
        let source_name = transformed_value(obj, NODE_FIELDS, "source_name")
            .or_else(|| (tokens.len() > 1).then(|| tokens[0].to_string()))
            .or_else(|| self.source.clone())
            .ok_or_else(|| IngestError::MissingSourceName {
                ingest_id: ingest_id.clone(),
            })?;

        // support an ingest id that is just the source id
        let source_id = if tokens.len() > 1 {
            tokens[1..].join("-")
        } else {
            ingest_id.clone()
        };

        let matching_method = transformed_value(obj, NODE_FIELDS, "matching_method")
            .unwrap_or_else(|| self.matching_method.to_string());

        if self.node_ids.insert(ingest_id.clone()) {
            self.nodes.push(StagedNode {
                ingest_id: ingest_id.clone(),
                site_name: transformed_value(obj, NODE_FIELDS, "site_name"),
                matching_method: Some(matching_method),
                source_name: Some(source_name),
                source_id: Some(source_id),
                ismobile: mapped_value(obj, NODE_FIELDS, "ismobile").and_then(to_bool),
                geom: transformed_value(obj, NODE_FIELDS, "geom"),
                metadata: Value::Object(metadata).to_string(),
                fetchlogs_id,
            });
        }

        if let Some(systems) = obj
            .get("sensor_system")
            .or_else(|| obj.get("systems"))
            .and_then(Value::as_array)
        {
            self.add_systems(systems, &ingest_id, fetchlogs_id);
        }
        Ok(())
    }

    pub fn add_systems(&mut self, systems: &[Value], node_id: &str, fetchlogs_id: i32) {
        for system in systems {
            let Some(obj) = system.as_object() else {
                continue;
            };

            let ingest_id = obj
                .get("sensor_system_id")
                .or_else(|| obj.get("system_id"))
                .and_then(scalar_to_string)
                .unwrap_or_else(|| node_id.to_string());

            let mut metadata = Map::new();
            for (key, value) in obj {
                let stripped = key.strip_prefix("sensor_system_").unwrap_or(key);
                if stripped == "sensors" {
                    if let Some(sensors) = value.as_array() {
                        self.add_sensors(sensors, &ingest_id, fetchlogs_id);
                    }
                } else {
                    metadata.insert(stripped.to_string(), value.clone());
                }
            }

            let tokens: Vec<&str> = ingest_id.split('-').collect();
            let instrument_ingest_id =
                (tokens.len() >= 3).then(|| tokens[tokens.len() - 1].to_string());

            if self.system_ids.insert(ingest_id.clone()) {
                self.systems.push(StagedSystem {
                    ingest_id,
                    instrument_ingest_id,
                    ingest_sensor_nodes_id: node_id.to_string(),
                    metadata: Value::Object(metadata).to_string(),
                    fetchlogs_id,
                });
            }
        }
    }

    pub fn add_sensors(&mut self, sensors: &[Value], system_id: &str, fetchlogs_id: i32) {
        for entry in sensors {
            let Some(obj) = entry.as_object() else {
                continue;
            };

            let mut sensor = StagedSensor {
                ingest_sensor_systems_id: system_id.to_string(),
                fetchlogs_id,
                ..Default::default()
            };
            let mut metadata = Map::new();
            let mut ingest_id = None;
            let mut flags = None;

            for (key, value) in obj {
                let stripped = key.strip_prefix("sensor_").unwrap_or(key);
                match stripped {
                    "id" | "key" => ingest_id = scalar_to_string(value),
                    "measurand_parameter" | "parameter" => {
                        sensor.measurand = scalar_to_string(value)
                    }
                    "measurand_unit" | "units" => {
                        sensor.units = scalar_to_string(value).map(|u| fix_units(&u).to_string())
                    }
                    "status" => sensor.status = scalar_to_string(value),
                    "interval_seconds" => {
                        let interval = scalar_to_string(value);
                        sensor.logging_interval_seconds = interval.clone();
                        sensor.averaging_interval_seconds = interval;
                    }
                    "logging_interval_secs" => {
                        sensor.logging_interval_seconds = scalar_to_string(value)
                    }
                    "averaging_interval_secs" => {
                        sensor.averaging_interval_seconds = scalar_to_string(value)
                    }
                    "flags" => flags = value.as_array(),
                    _ => {
                        metadata.insert(stripped.to_string(), value.clone());
                    }
                }
            }

            // a sensor without its own id inherits its system's
            let ingest_id = ingest_id.unwrap_or_else(|| system_id.to_string());
            if sensor.measurand.is_none() {
                sensor.measurand = ingest_id.rsplit('-').next().map(str::to_string);
            }

            if let Some(flags) = flags {
                self.add_flags(flags, &ingest_id, fetchlogs_id);
            }

            if self.sensor_ids.insert(ingest_id.clone()) {
                sensor.ingest_id = ingest_id;
                sensor.metadata = Value::Object(metadata).to_string();
                self.sensors.push(sensor);
            }
        }
    }

    pub fn add_flags(&mut self, flags: &[Value], sensor_id: &str, fetchlogs_id: i32) {
        for entry in flags {
            match entry {
                Value::Object(obj) => {
                    let mut flag = StagedFlag {
                        sensor_ingest_id: sensor_id.to_string(),
                        fetchlogs_id,
                        ..Default::default()
                    };
                    let mut metadata = Map::new();
                    let mut ingest_id = None;

                    for (key, value) in obj {
                        let stripped = key.strip_prefix("flag_").unwrap_or(key);
                        match stripped {
                            "id" => ingest_id = scalar_to_string(value),
                            "datetime_from" => flag.datetime_from = to_timestamp(value),
                            "datetime_to" => flag.datetime_to = to_timestamp(value),
                            "note" => flag.note = scalar_to_string(value),
                            _ => {
                                metadata.insert(stripped.to_string(), value.clone());
                            }
                        }
                    }

                    flag.ingest_id = ingest_id.unwrap_or_else(|| sensor_id.to_string());
                    flag.metadata = Value::Object(metadata).to_string();
                    self.flags.push(flag);
                }
                Value::String(note) => {
                    self.flags.push(StagedFlag {
                        ingest_id: sensor_id.to_string(),
                        sensor_ingest_id: sensor_id.to_string(),
                        note: Some(note.clone()),
                        metadata: Value::Object(Map::new()).to_string(),
                        fetchlogs_id,
                        ..Default::default()
                    });
                }
                other => warn!("unexpected flag value: {other}"),
            }
        }
    }

    pub fn add_measurement(&mut self, measurement: MeasurementInput<'_>) {
        let fetchlogs_id;
        let ingest_id;
        let value;
        let datetime;
        let mut lat = None;
        let mut lon = None;

        match measurement {
            MeasurementInput::CsvRow(fields) => {
                if fields.len() < 3 {
                    warn!("not enough data in record: {fields:?}");
                    return;
                }
                let id = fields[0].trim();
                if id.is_empty() {
                    return;
                }
                ingest_id = id.to_string();
                value = Some(fields[1].clone()).filter(|v| !v.is_empty());
                datetime = to_timestamp(&Value::String(fields[2].clone()));
                if fields.len() >= 5 {
                    lat = fields[3]
                        .trim()
                        .parse()
                        .ok()
                        .and_then(|v| coordinate(v, 90.0));
                    lon = fields[4]
                        .trim()
                        .parse()
                        .ok()
                        .and_then(|v| coordinate(v, 180.0));
                }
                fetchlogs_id = self.fetchlogs_id.unwrap_or_default();
            }
            MeasurementInput::JsonRecord(document) => {
                let Some(obj) = document.as_object() else {
                    return;
                };
                let Some(id) = transformed_value(obj, MEASUREMENT_FIELDS, "ingest_id")
                    .or_else(|| synthesized_ingest_id(obj))
                else {
                    return;
                };
                ingest_id = id;
                value = transformed_value(obj, MEASUREMENT_FIELDS, "value");
                datetime = transformed_value(obj, MEASUREMENT_FIELDS, "datetime");
                lat = mapped_value(obj, MEASUREMENT_FIELDS, "lat")
                    .and_then(|v| coordinate_from_value(v, 90.0));
                lon = mapped_value(obj, MEASUREMENT_FIELDS, "lon")
                    .and_then(|v| coordinate_from_value(v, 180.0));
                fetchlogs_id = obj
                    .get("fetchlogs_id")
                    .and_then(Value::as_i64)
                    .map(|id| id as i32)
                    .or(self.fetchlogs_id)
                    .unwrap_or_default();
            }
        }

        // half a coordinate pair is no coordinate
        if lat.is_none() || lon.is_none() {
            lat = None;
            lon = None;
        }

        let tokens: Vec<&str> = ingest_id.split('-').collect();
        if tokens.len() < 3 {
            warn!("not enough information in ingest-id: `{ingest_id}`");
            return;
        }
        let source_name = tokens[0].to_string();
        let measurand = tokens[tokens.len() - 1].to_string();
        let source_id = tokens[1..tokens.len() - 1].join("-");

        let Some(datetime) = datetime else {
            return;
        };
        if source_name.is_empty() || source_id.is_empty() || measurand.is_empty() {
            return;
        }

        self.measurements.push(StagedMeasurement {
            ingest_id,
            source_name,
            source_id,
            measurand,
            value,
            datetime,
            lon,
            lat,
            fetchlogs_id,
        });
    }

    /// Dump whatever is loaded. The location dump runs whenever any key was
    /// loaded, even with zero parsed records, so empty files still get their
    /// fetchlog rows finalized.
    pub fn dump(
        &self,
        conn: &mut PgConnection,
        load: bool,
        use_temp_tables: bool,
    ) -> Result<(), QueryError> {
        debug!("dumping data from {} files", self.keys.len());
        if !self.nodes.is_empty() || !self.keys.is_empty() {
            staging::dump_locations(
                conn,
                &LocationsDump {
                    keys: &self.keys,
                    nodes: &self.nodes,
                    systems: &self.systems,
                    sensors: &self.sensors,
                    flags: &self.flags,
                },
                load,
                use_temp_tables,
            )?;
        }
        if !self.measurements.is_empty() || !self.keys.is_empty() {
            staging::dump_measurements(conn, &self.measurements, load, use_temp_tables)?;
        }
        Ok(())
    }
}

/// Claim one batch of files for `pattern` and run them through fetch →
/// parse → accumulate → dump. Returns how many rows were claimed, so the
/// caller can keep draining until the queue is empty.
///
/// Fetch errors leave the row claimed for the visibility timeout to
/// recover; everything else quarantines the row. A dump failure
/// quarantines every row that made it into the batch.
pub async fn load_stream(
    resources: &Resources,
    pattern: &str,
    limit: i64,
    ascending: bool,
) -> Result<usize, IngestFatalError> {
    let mut conn = resources.pool.get()?;
    let rows = queue::load_fetchlogs(&mut conn, pattern, limit, ascending)?;
    if rows.is_empty() {
        return Ok(0);
    }
    ingest_rows(resources, &mut conn, &rows).await?;
    Ok(rows.len())
}

/// Re-run a previous claim batch by its id, e.g. after resubmitting
/// quarantined rows.
pub async fn load_batch(
    resources: &Resources,
    batch_uuid: &str,
) -> Result<usize, IngestFatalError> {
    let mut conn = resources.pool.get()?;
    let rows = queue::rows_for_batch(&mut conn, batch_uuid)?;
    if rows.is_empty() {
        return Ok(0);
    }
    ingest_rows(resources, &mut conn, &rows).await?;
    Ok(rows.len())
}

async fn ingest_rows(
    resources: &Resources,
    conn: &mut PgConnection,
    rows: &[ClaimedFetchlog],
) -> Result<(), IngestFatalError> {
    let started = Instant::now();

    let mut batch = IngestBatch::new();
    for row in rows {
        match batch.load_key(resources, row).await {
            Ok(()) => {}
            Err(err) if err.is_retriable() => {
                warn!("could not fetch {}, leaving for retry: {err}", row.key);
            }
            Err(err) => {
                queue::mark_failure(conn, row.fetchlogs_id, &err.to_string())?;
            }
        }
    }

    let loaded_ids: Vec<i32> = batch.keys.iter().map(|k| k.fetchlogs_id).collect();
    let use_temp_tables = resources.settings.use_temp_tables;
    if let Err(err) = conn.transaction(|conn| batch.dump(conn, true, use_temp_tables)) {
        error!("dump failed: {err}");
        queue::mark_failure_many(conn, &loaded_ids, &err.to_string())?;
    }

    info!(
        "ingest: {} keys; {} measurements; {} locations; {:.4} seconds",
        batch.keys.len(),
        batch.measurements.len(),
        batch.nodes.len(),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reader(content: &'static str) -> ObjectReader {
        Box::new(tokio::io::BufReader::new(content.as_bytes()))
    }

    #[test]
    fn units_are_canonicalized() {
        for input in ["\u{03bc}g/m3", "\u{00b5}g/m3", "\u{03bc}g/m\u{00b3}", "\u{00b5}g/m\u{00b3}"] {
            assert_eq!(fix_units(input), "\u{00b5}g/m\u{00b3}");
        }
        assert_eq!(fix_units("ppm"), "ppm");
    }

    #[test]
    fn thirteen_digit_epochs_are_milliseconds() {
        let expected = DateTime::from_timestamp(1618958580, 0).unwrap().to_rfc3339();
        assert_eq!(
            to_timestamp(&json!("1618958580000")).unwrap(),
            expected
        );
        assert_eq!(to_timestamp(&json!("1618958580")).unwrap(), expected);
    }

    #[test]
    fn rfc3339_timestamps_are_normalized_to_utc() {
        assert_eq!(
            to_timestamp(&json!("2021-04-20T22:03:00+02:00")).unwrap(),
            "2021-04-20T20:03:00+00:00"
        );
    }

    #[test]
    fn freeform_dates_are_rejected() {
        assert_eq!(to_timestamp(&json!("last tuesday")), None);
        assert_eq!(to_timestamp(&json!("2021-04-20 22:03:00")), None);
        assert_eq!(to_timestamp(&json!("")), None);
    }

    #[test]
    fn ingest_id_splits_source_middle_and_parameter() {
        let mut batch = IngestBatch::new();
        let fields: Vec<String> = ["a-b-c-d-p", "3.5", "1618958580"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        batch.add_measurement(MeasurementInput::CsvRow(&fields));

        let m = &batch.measurements[0];
        assert_eq!(m.source_name, "a");
        assert_eq!(m.source_id, "b-c-d");
        assert_eq!(m.measurand, "p");
    }

    #[test]
    fn short_ingest_ids_are_dropped() {
        let mut batch = IngestBatch::new();
        let fields: Vec<String> = ["source-pm25", "3.5", "1618958580"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        batch.add_measurement(MeasurementInput::CsvRow(&fields));
        assert!(batch.measurements.is_empty());
    }

    #[test]
    fn duplicate_nodes_collapse_to_one() {
        let mut batch = IngestBatch::new();
        let node = json!({
            "ingest_id": "acme-site1",
            "site_name": "Site One",
        });
        for _ in 0..4 {
            batch.add_node(&node).unwrap();
        }
        assert_eq!(batch.nodes.len(), 1);
    }

    #[test]
    fn node_without_ingest_id_is_an_error() {
        let mut batch = IngestBatch::new();
        let err = batch.add_node(&json!({"site_name": "nameless"})).unwrap_err();
        assert!(matches!(err, IngestError::MissingIngestId));
    }

    #[test]
    fn node_source_name_resolution_order() {
        let mut batch = IngestBatch::new();

        // multi-token id: leading token
        batch.add_node(&json!({"ingest_id": "acme-site1"})).unwrap();
        assert_eq!(batch.nodes[0].source_name.as_deref(), Some("acme"));

        // single-token id falls back to the load-wide source
        batch.load_metadata(&json!({"source": "acme"}));
        batch.add_node(&json!({"ingest_id": "site2"})).unwrap();
        assert_eq!(batch.nodes[1].source_name.as_deref(), Some("acme"));
        assert_eq!(batch.nodes[1].source_id.as_deref(), Some("site2"));

        // nothing to derive from
        let mut empty = IngestBatch::new();
        let err = empty.add_node(&json!({"ingest_id": "site3"})).unwrap_err();
        assert!(matches!(err, IngestError::MissingSourceName { .. }));
    }

    #[test]
    fn multi_token_location_ids_join_the_middle() {
        let mut batch = IngestBatch::new();
        batch
            .add_node(&json!({
                "ingest_id": "acme-0ae31c9f-2d12-4fb6-ba27-b54bbf59361f"
            }))
            .unwrap();
        assert_eq!(
            batch.nodes[0].source_id.as_deref(),
            Some("0ae31c9f-2d12-4fb6-ba27-b54bbf59361f")
        );
    }

    #[test]
    fn node_geometry_from_document_lat_lon() {
        let mut batch = IngestBatch::new();
        batch
            .add_node(&json!({
                "ingest_id": "acme-site1",
                "lat": 45.5,
                "lon": -122.6,
            }))
            .unwrap();
        assert_eq!(
            batch.nodes[0].geom.as_deref(),
            Some("SRID=4326;POINT(-122.6 45.5)")
        );
    }

    #[test]
    fn node_geometry_from_coordinates_object() {
        let mut batch = IngestBatch::new();
        batch
            .add_node(&json!({
                "ingest_id": "acme-site1",
                "coordinates": {"latitude": "45.5", "longitude": "-122.6"},
            }))
            .unwrap();
        assert_eq!(
            batch.nodes[0].geom.as_deref(),
            Some("SRID=4326;POINT(-122.6 45.5)")
        );
    }

    #[test]
    fn zero_island_is_no_geometry() {
        let mut batch = IngestBatch::new();
        batch
            .add_node(&json!({"ingest_id": "acme-site1", "lat": 0.0, "lon": 0.0}))
            .unwrap();
        assert_eq!(batch.nodes[0].geom, None);
    }

    #[test]
    fn unknown_node_fields_land_in_metadata() {
        let mut batch = IngestBatch::new();
        batch
            .add_node(&json!({
                "ingest_id": "acme-site1",
                "label": "Site One",
                "operator": "city",
            }))
            .unwrap();
        let node = &batch.nodes[0];
        assert_eq!(node.site_name.as_deref(), Some("Site One"));
        let metadata: Value = serde_json::from_str(&node.metadata).unwrap();
        assert_eq!(metadata["operator"], "city");
        assert!(metadata.get("label").is_none());
    }

    #[test]
    fn systems_and_sensors_inherit_ids() {
        let mut batch = IngestBatch::new();
        batch
            .add_node(&json!({
                "ingest_id": "acme-site1",
                "sensor_system": [
                    {
                        "sensors": [
                            {"sensor_id": "acme-site1-pm25", "measurand_unit": "\u{03bc}g/m3"},
                            {"interval_seconds": 60, "measurand_parameter": "o3"},
                        ]
                    }
                ]
            }))
            .unwrap();

        // system without an id inherits the node's
        assert_eq!(batch.systems.len(), 1);
        assert_eq!(batch.systems[0].ingest_id, "acme-site1");
        assert_eq!(batch.systems[0].ingest_sensor_nodes_id, "acme-site1");

        assert_eq!(batch.sensors.len(), 2);
        let first = &batch.sensors[0];
        assert_eq!(first.ingest_id, "acme-site1-pm25");
        assert_eq!(first.units.as_deref(), Some("\u{00b5}g/m\u{00b3}"));
        // missing measurand comes from the id's trailing token
        assert_eq!(first.measurand.as_deref(), Some("pm25"));

        // sensor without an id inherits the system's
        let second = &batch.sensors[1];
        assert_eq!(second.ingest_id, "acme-site1");
        assert_eq!(second.logging_interval_seconds.as_deref(), Some("60"));
        assert_eq!(second.averaging_interval_seconds.as_deref(), Some("60"));
    }

    #[test]
    fn three_token_system_id_yields_instrument() {
        let mut batch = IngestBatch::new();
        batch
            .add_node(&json!({
                "ingest_id": "acme-site1",
                "systems": [{"sensor_system_id": "acme-site1-bam1020"}]
            }))
            .unwrap();
        assert_eq!(
            batch.systems[0].instrument_ingest_id.as_deref(),
            Some("bam1020")
        );
    }

    #[test]
    fn sensor_flags_are_staged() {
        let mut batch = IngestBatch::new();
        batch
            .add_node(&json!({
                "ingest_id": "acme-site1",
                "sensor_system": [{
                    "sensors": [{
                        "sensor_id": "acme-site1-pm25",
                        "flags": [
                            {
                                "flag_id": "acme-site1-pm25::cal",
                                "datetime_from": "2024-01-01T00:00:00+00:00",
                                "note": "calibration",
                                "level": "info"
                            },
                            "spike"
                        ]
                    }]
                }]
            }))
            .unwrap();

        assert_eq!(batch.flags.len(), 2);
        let flag = &batch.flags[0];
        assert_eq!(flag.ingest_id, "acme-site1-pm25::cal");
        assert_eq!(flag.sensor_ingest_id, "acme-site1-pm25");
        assert_eq!(
            flag.datetime_from.as_deref(),
            Some("2024-01-01T00:00:00+00:00")
        );
        assert_eq!(flag.note.as_deref(), Some("calibration"));
        let metadata: Value = serde_json::from_str(&flag.metadata).unwrap();
        assert_eq!(metadata["level"], "info");

        // bare string form inherits the sensor id
        assert_eq!(batch.flags[1].ingest_id, "acme-site1-pm25");
        assert_eq!(batch.flags[1].note.as_deref(), Some("spike"));
    }

    #[test]
    fn measurement_dict_synthesizes_ingest_id() {
        let mut batch = IngestBatch::new();
        batch.add_measurement(MeasurementInput::JsonRecord(&json!({
            "sourceName": "acme",
            "location": "site1",
            "parameter": "pm25",
            "value": 12.1,
            "datetime": "1618958580",
        })));
        assert_eq!(batch.measurements[0].ingest_id, "acme-site1-pm25");
    }

    #[test]
    fn measurement_value_keeps_lexical_form() {
        let mut batch = IngestBatch::new();
        batch.add_measurement(MeasurementInput::JsonRecord(&json!({
            "ingest_id": "acme-site1-pm25",
            "measure": "0.120",
            "timestamp": "1618958580000",
        })));
        assert_eq!(batch.measurements[0].value.as_deref(), Some("0.120"));
    }

    #[test]
    fn out_of_range_or_partial_coordinates_are_dropped() {
        let mut batch = IngestBatch::new();
        let rows = [
            vec!["acme-site1-pm25", "1.0", "1618958580", "95.0", "10.0"],
            vec!["acme-site1-pm25", "1.0", "1618958580", "45.0", "0"],
            vec!["acme-site1-pm25", "1.0", "1618958580", "45.0", "-122.6"],
        ];
        for row in rows {
            let fields: Vec<String> = row.iter().map(|s| s.to_string()).collect();
            batch.add_measurement(MeasurementInput::CsvRow(&fields));
        }
        assert_eq!(batch.measurements.len(), 3);
        assert_eq!(batch.measurements[0].lat, None);
        assert_eq!(batch.measurements[0].lon, None);
        assert_eq!(batch.measurements[1].lat, None);
        assert_eq!(batch.measurements[1].lon, None);
        assert_eq!(batch.measurements[2].lat, Some(45.0));
        assert_eq!(batch.measurements[2].lon, Some(-122.6));
    }

    #[test]
    fn simple_node_file() {
        let mut batch = IngestBatch::new();
        batch
            .load_document(&json!({
                "meta": {"source": "acme", "schema": "v2"},
                "locations": [
                    {"ingest_id": "acme-site1", "label": "One"},
                    {"ingest_id": "acme-site2", "label": "Two"},
                    {"ingest_id": "acme-site3", "label": "Three"},
                ],
                "measures": [
                    {"ingest_id": "acme-site1-pm25", "value": 5, "datetime": "1618958580"},
                    {"ingest_id": "acme-site2-pm25", "value": 7, "datetime": "1618958580"},
                ]
            }))
            .unwrap();

        assert_eq!(batch.nodes.len(), 3);
        assert_eq!(batch.systems.len(), 0);
        assert_eq!(batch.sensors.len(), 0);
        assert_eq!(batch.measurements.len(), 2);
        assert_eq!(batch.schema_version.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn realtime_ndjson_measures() {
        let mut batch = IngestBatch::new();
        batch
            .load_ndjson(reader(concat!(
                "{\"ingest_id\": \"acme-site1-pm25\", \"value\": 3, \"datetime\": \"1618958580\"}\n",
                "\n",
                "{\"ingest_id\": \"acme-site2-o3\", \"value\": 4, \"datetime\": \"1618958580000\"}\n",
                "not json at all\n",
            )))
            .await
            .unwrap();

        assert_eq!(batch.nodes.len(), 0);
        assert_eq!(batch.measurements.len(), 2);
    }

    #[test]
    fn locations_embedding_sensors() {
        let mut batch = IngestBatch::new();
        batch
            .load_document(&json!({
                "locations": [
                    {
                        "ingest_id": "clarity-a1",
                        "sensor_system": [{"sensors": [{"sensor_id": "clarity-a1-pm25"}]}]
                    },
                    {
                        "ingest_id": "clarity-a2",
                        "sensor_system": [{"sensors": [{"sensor_id": "clarity-a2-pm25"}]}]
                    },
                ],
                "measures": [
                    {"ingest_id": "clarity-a1-pm25", "value": 1, "datetime": "1618958580"},
                    {"ingest_id": "clarity-a2-pm25", "value": 2, "datetime": "1618958580"},
                    {"ingest_id": "clarity-a2-pm25", "value": 3, "datetime": "1618958640"},
                ]
            }))
            .unwrap();

        assert_eq!(batch.nodes.len(), 2);
        assert_eq!(batch.systems.len(), 2);
        assert_eq!(batch.sensors.len(), 2);
        assert_eq!(batch.measurements.len(), 3);
    }

    #[tokio::test]
    async fn csv_measures_with_id_only_location_hint() {
        let mut batch = IngestBatch::new();
        batch
            .load_csv(reader(concat!(
                "senstate-dev1-pm25,3.1,1618958580\n",
                "senstate-dev1-pm10,5.5,1618958580\n",
                "senstate-dev2-pm25,1.9,1618958580,45.0,-122.6\n",
            )))
            .await
            .unwrap();

        assert_eq!(batch.nodes.len(), 0);
        assert_eq!(batch.measurements.len(), 3);
        assert_eq!(batch.measurements[2].lat, Some(45.0));
    }

    #[tokio::test]
    async fn csv_records_with_wrong_arity_are_dropped() {
        let mut batch = IngestBatch::new();
        batch
            .load_csv(reader(concat!(
                "acme-site1-pm25,3.1,1618958580,45.0\n",
                "acme-site1-pm25,3.1\n",
                "acme-site1-pm25,3.1,1618958580\n",
            )))
            .await
            .unwrap();
        assert_eq!(batch.measurements.len(), 1);
    }

    #[test]
    fn unsupported_format_message() {
        let err = IngestError::UnsupportedFormat {
            key: "x.tab".to_string(),
        };
        assert!(err.to_string().contains("Not sure how to read file"));
        assert!(!err.is_retriable());
    }

    #[test]
    fn reset_clears_accumulated_state() {
        let mut batch = IngestBatch::new();
        batch
            .load_document(&json!({
                "locations": [{"ingest_id": "acme-site1"}],
                "measures": [
                    {"ingest_id": "acme-site1-pm25", "value": 5, "datetime": "1618958580"}
                ]
            }))
            .unwrap();
        assert!(!batch.nodes.is_empty());

        batch.reset();
        assert!(batch.nodes.is_empty());
        assert!(batch.measurements.is_empty());
        assert!(batch.keys.is_empty());

        // the dedup index is gone too
        batch.add_node(&json!({"ingest_id": "acme-site1"})).unwrap();
        assert_eq!(batch.nodes.len(), 1);
    }

    #[test]
    fn matching_method_round_trips_kebab_case() {
        assert_eq!(MatchingMethod::IngestId.to_string(), "ingest-id");
        assert_eq!(
            "location-id".parse::<MatchingMethod>().unwrap(),
            MatchingMethod::LocationId
        );

        let mut batch = IngestBatch::new();
        batch.load_metadata(&json!({"matching_method": "sensor-id", "source": "acme"}));
        batch.add_node(&json!({"ingest_id": "site1"})).unwrap();
        assert_eq!(batch.nodes[0].matching_method.as_deref(), Some("sensor-id"));
    }
}
