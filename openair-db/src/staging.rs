use crate::models::{
    StagedFlag, StagedKey, StagedMeasurement, StagedNode, StagedSensor, StagedSystem,
};
use crate::schema::{
    staging_flags, staging_keys, staging_measurements, staging_sensornodes, staging_sensors,
    staging_sensorsystems,
};
use diesel::prelude::*;
use diesel::sql_query;
use log::{debug, info};
use std::io::Write;

const LOCATIONS_DDL: &str = include_str!("../sql/temp_locations_dump.sql");
const MEASUREMENTS_DDL: &str = include_str!("../sql/temp_measurements_dump.sql");

/// Everything one ingest run stages for the location path.
#[derive(Debug, Default)]
pub struct LocationsDump<'a> {
    pub keys: &'a [StagedKey],
    pub nodes: &'a [StagedNode],
    pub systems: &'a [StagedSystem],
    pub sensors: &'a [StagedSensor],
    pub flags: &'a [StagedFlag],
}

/// Materialize staged nodes, systems, sensors and flags.
///
/// Creates the staging tables from the DDL template, records the claimed
/// keys, marks their fetchlog rows as in-flight, then pipe-copies the four
/// entity sets in dependency order. With `load` set the promotion routine
/// runs and `last_message` is cleared. The claimed rows are marked completed
/// on exit either way, so an empty file still gets finalized.
pub fn dump_locations(
    conn: &mut PgConnection,
    data: &LocationsDump,
    load: bool,
    use_temp_tables: bool,
) -> QueryResult<()> {
    debug!("dumping {} nodes from {} files", data.nodes.len(), data.keys.len());
    sql_query(ddl(LOCATIONS_DDL, use_temp_tables)).execute(conn)?;

    copy_keys(conn, data.keys)?;

    // update by id instead of key due to matching issues with encoded keys
    sql_query(
        "UPDATE fetchlogs
         SET loaded_datetime = clock_timestamp()
         , last_message = 'load_data'
         WHERE fetchlogs_id IN (SELECT fetchlogs_id FROM staging_keys)",
    )
    .execute(conn)?;

    copy_nodes(conn, data.nodes)?;
    copy_systems(conn, data.systems)?;
    copy_sensors(conn, data.sensors)?;
    copy_flags(conn, data.flags)?;

    if load {
        sql_query("SELECT etl_process_nodes();").execute(conn)?;
        sql_query(
            "UPDATE fetchlogs
             SET completed_datetime = clock_timestamp()
             , last_message = NULL
             WHERE fetchlogs_id IN (SELECT fetchlogs_id FROM staging_keys)",
        )
        .execute(conn)?;
    } else {
        sql_query(
            "UPDATE fetchlogs
             SET completed_datetime = clock_timestamp()
             WHERE fetchlogs_id IN (SELECT fetchlogs_id FROM staging_keys)",
        )
        .execute(conn)?;
    }

    info!("dump_locations: locations: {}", data.nodes.len());
    Ok(())
}

/// Materialize staged measurements and, with `load` set, promote them.
pub fn dump_measurements(
    conn: &mut PgConnection,
    measurements: &[StagedMeasurement],
    load: bool,
    use_temp_tables: bool,
) -> QueryResult<()> {
    debug!("dumping {} measurements", measurements.len());
    sql_query(ddl(MEASUREMENTS_DDL, use_temp_tables)).execute(conn)?;

    copy_measurements(conn, measurements)?;

    if load {
        info!("processing {} measurements", measurements.len());
        sql_query("SELECT etl_process_measurements();").execute(conn)?;
    }
    Ok(())
}

fn ddl(template: &str, use_temp_tables: bool) -> String {
    template.replace(
        "{table}",
        if use_temp_tables { "TEMP TABLE" } else { "TABLE" },
    )
}

/// Render one value for the COPY text protocol. Absent and empty values
/// become `\N`, embedded newlines are escaped, tabs would break the column
/// framing and become spaces.
fn copy_value(value: Option<&str>) -> String {
    match value {
        None | Some("") => r"\N".to_string(),
        Some(v) => v.replace('\n', "\\n").replace('\t', " "),
    }
}

fn write_row(out: &mut dyn Write, values: &[Option<String>]) -> QueryResult<()> {
    let line = values
        .iter()
        .map(|v| copy_value(v.as_deref()))
        .collect::<Vec<_>>()
        .join("\t");
    writeln!(out, "{line}")
        .map_err(|e| diesel::result::Error::SerializationError(Box::new(e)))
}

fn copy_keys(conn: &mut PgConnection, rows: &[StagedKey]) -> QueryResult<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let count = diesel::copy_from(staging_keys::table)
        .from_raw_data(
            (
                staging_keys::key,
                staging_keys::last_modified,
                staging_keys::fetchlogs_id,
            ),
            |copy| {
                for row in rows {
                    write_row(
                        copy,
                        &[
                            Some(row.key.clone()),
                            row.last_modified.map(|dt| dt.to_rfc3339()),
                            Some(row.fetchlogs_id.to_string()),
                        ],
                    )?;
                }
                Ok::<(), diesel::result::Error>(())
            },
        )
        .execute(conn)?;
    debug!("table: staging_keys; rowcount: {count}");
    Ok(count)
}

fn copy_nodes(conn: &mut PgConnection, rows: &[StagedNode]) -> QueryResult<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let count = diesel::copy_from(staging_sensornodes::table)
        .from_raw_data(
            (
                staging_sensornodes::ingest_id,
                staging_sensornodes::site_name,
                staging_sensornodes::matching_method,
                staging_sensornodes::source_name,
                staging_sensornodes::source_id,
                staging_sensornodes::ismobile,
                staging_sensornodes::geom,
                staging_sensornodes::metadata,
                staging_sensornodes::fetchlogs_id,
            ),
            |copy| {
                for row in rows {
                    write_row(
                        copy,
                        &[
                            Some(row.ingest_id.clone()),
                            row.site_name.clone(),
                            row.matching_method.clone(),
                            row.source_name.clone(),
                            row.source_id.clone(),
                            row.ismobile.map(|b| b.to_string()),
                            row.geom.clone(),
                            Some(row.metadata.clone()),
                            Some(row.fetchlogs_id.to_string()),
                        ],
                    )?;
                }
                Ok::<(), diesel::result::Error>(())
            },
        )
        .execute(conn)?;
    debug!("table: staging_sensornodes; rowcount: {count}");
    Ok(count)
}

fn copy_systems(conn: &mut PgConnection, rows: &[StagedSystem]) -> QueryResult<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let count = diesel::copy_from(staging_sensorsystems::table)
        .from_raw_data(
            (
                staging_sensorsystems::ingest_id,
                staging_sensorsystems::instrument_ingest_id,
                staging_sensorsystems::ingest_sensor_nodes_id,
                staging_sensorsystems::metadata,
                staging_sensorsystems::fetchlogs_id,
            ),
            |copy| {
                for row in rows {
                    write_row(
                        copy,
                        &[
                            Some(row.ingest_id.clone()),
                            row.instrument_ingest_id.clone(),
                            Some(row.ingest_sensor_nodes_id.clone()),
                            Some(row.metadata.clone()),
                            Some(row.fetchlogs_id.to_string()),
                        ],
                    )?;
                }
                Ok::<(), diesel::result::Error>(())
            },
        )
        .execute(conn)?;
    debug!("table: staging_sensorsystems; rowcount: {count}");
    Ok(count)
}

fn copy_sensors(conn: &mut PgConnection, rows: &[StagedSensor]) -> QueryResult<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let count = diesel::copy_from(staging_sensors::table)
        .from_raw_data(
            (
                staging_sensors::ingest_id,
                staging_sensors::ingest_sensor_systems_id,
                staging_sensors::measurand,
                staging_sensors::units,
                staging_sensors::status,
                staging_sensors::logging_interval_seconds,
                staging_sensors::averaging_interval_seconds,
                staging_sensors::metadata,
                staging_sensors::fetchlogs_id,
            ),
            |copy| {
                for row in rows {
                    write_row(
                        copy,
                        &[
                            Some(row.ingest_id.clone()),
                            Some(row.ingest_sensor_systems_id.clone()),
                            row.measurand.clone(),
                            row.units.clone(),
                            row.status.clone(),
                            row.logging_interval_seconds.clone(),
                            row.averaging_interval_seconds.clone(),
                            Some(row.metadata.clone()),
                            Some(row.fetchlogs_id.to_string()),
                        ],
                    )?;
                }
                Ok::<(), diesel::result::Error>(())
            },
        )
        .execute(conn)?;
    debug!("table: staging_sensors; rowcount: {count}");
    Ok(count)
}

fn copy_flags(conn: &mut PgConnection, rows: &[StagedFlag]) -> QueryResult<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let count = diesel::copy_from(staging_flags::table)
        .from_raw_data(
            (
                staging_flags::ingest_id,
                staging_flags::sensor_ingest_id,
                staging_flags::datetime_from,
                staging_flags::datetime_to,
                staging_flags::note,
                staging_flags::metadata,
                staging_flags::fetchlogs_id,
            ),
            |copy| {
                for row in rows {
                    write_row(
                        copy,
                        &[
                            Some(row.ingest_id.clone()),
                            Some(row.sensor_ingest_id.clone()),
                            row.datetime_from.clone(),
                            row.datetime_to.clone(),
                            row.note.clone(),
                            Some(row.metadata.clone()),
                            Some(row.fetchlogs_id.to_string()),
                        ],
                    )?;
                }
                Ok::<(), diesel::result::Error>(())
            },
        )
        .execute(conn)?;
    debug!("table: staging_flags; rowcount: {count}");
    Ok(count)
}

fn copy_measurements(conn: &mut PgConnection, rows: &[StagedMeasurement]) -> QueryResult<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let count = diesel::copy_from(staging_measurements::table)
        .from_raw_data(
            (
                staging_measurements::ingest_id,
                staging_measurements::source_name,
                staging_measurements::source_id,
                staging_measurements::measurand,
                staging_measurements::value,
                staging_measurements::datetime,
                staging_measurements::lon,
                staging_measurements::lat,
                staging_measurements::fetchlogs_id,
            ),
            |copy| {
                for row in rows {
                    write_row(
                        copy,
                        &[
                            Some(row.ingest_id.clone()),
                            Some(row.source_name.clone()),
                            Some(row.source_id.clone()),
                            Some(row.measurand.clone()),
                            row.value.clone(),
                            Some(row.datetime.clone()),
                            row.lon.map(|v| v.to_string()),
                            row.lat.map(|v| v.to_string()),
                            Some(row.fetchlogs_id.to_string()),
                        ],
                    )?;
                }
                Ok::<(), diesel::result::Error>(())
            },
        )
        .execute(conn)?;
    debug!("table: staging_measurements; rowcount: {count}");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_empty_render_as_copy_null() {
        assert_eq!(copy_value(None), r"\N");
        assert_eq!(copy_value(Some("")), r"\N");
    }

    #[test]
    fn newlines_and_tabs_are_neutralized() {
        assert_eq!(copy_value(Some("line1\nline2")), "line1\\nline2");
        assert_eq!(copy_value(Some("a\tb")), "a b");
    }

    #[test]
    fn rows_are_tab_separated_lines() {
        let mut out = Vec::new();
        write_row(
            &mut out,
            &[Some("id-1".to_string()), None, Some("42".to_string())],
        )
        .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "id-1\t\\N\t42\n");
    }

    #[test]
    fn ddl_template_switches_on_temp_table_setting() {
        assert!(ddl(LOCATIONS_DDL, true).contains("CREATE TEMP TABLE IF NOT EXISTS staging_sensornodes"));
        assert!(ddl(LOCATIONS_DDL, false).contains("CREATE TABLE IF NOT EXISTS staging_sensornodes"));
        assert!(!ddl(LOCATIONS_DDL, true).contains("{table}"));
        assert!(ddl(MEASUREMENTS_DDL, true).contains("CREATE TEMP TABLE IF NOT EXISTS staging_measurements"));
    }
}
