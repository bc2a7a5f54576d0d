use crate::models::{ClaimedFetchlog, Fetchlog, NewFetchlog};
use crate::schema::fetchlogs;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Text};
use diesel::upsert::excluded;
use log::debug;
use uuid::Uuid;

/// How long a claimed row stays invisible to other claimants before it is
/// considered abandoned and becomes re-claimable.
const VISIBILITY_WINDOW: &str = "30min";

fn claim_sql(ascending: bool) -> String {
    let order = if ascending { "ASC" } else { "DESC" };
    format!(
        "WITH claimed AS (
            UPDATE fetchlogs
            SET loaded_datetime = CURRENT_TIMESTAMP
            , jobs = jobs + 1
            , batch_uuid = $1
            FROM (
                SELECT fetchlogs_id
                FROM fetchlogs
                WHERE key ~* $2
                AND NOT has_error
                AND init_datetime IS NOT NULL
                AND completed_datetime IS NULL
                AND (
                    loaded_datetime IS NULL
                    OR loaded_datetime < now() - '{VISIBILITY_WINDOW}'::interval
                )
                ORDER BY last_modified {order} NULLS LAST
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            ) q
            WHERE q.fetchlogs_id = fetchlogs.fetchlogs_id
            RETURNING fetchlogs.fetchlogs_id
            , fetchlogs.key
            , fetchlogs.last_modified
        )
        SELECT fetchlogs_id, key, last_modified
        FROM claimed
        ORDER BY last_modified {order} NULLS LAST"
    )
}

/// Atomically claim up to `limit` eligible rows whose key matches `pattern`.
///
/// Claimed rows get their visibility timestamp set, their job counter
/// incremented, and a fresh batch id. Row locks are taken with skip-locked
/// semantics so concurrent claimants never hand out the same row.
pub fn load_fetchlogs(
    conn: &mut PgConnection,
    pattern: &str,
    limit: i64,
    ascending: bool,
) -> QueryResult<Vec<ClaimedFetchlog>> {
    let batch_uuid = Uuid::new_v4().simple().to_string();
    let rows = sql_query(claim_sql(ascending))
        .bind::<Text, _>(&batch_uuid)
        .bind::<Text, _>(pattern)
        .bind::<BigInt, _>(limit)
        .load::<ClaimedFetchlog>(conn)?;
    debug!(
        "loaded {} from fetchlogs using {pattern}, ascending: {ascending}",
        rows.len()
    );
    Ok(rows)
}

/// Mark a set of keys as successfully processed.
pub fn mark_success(conn: &mut PgConnection, keys: &[String], message: &str) -> QueryResult<usize> {
    diesel::update(fetchlogs::table.filter(fetchlogs::key.eq_any(keys)))
        .set((
            fetchlogs::last_message.eq(message),
            fetchlogs::completed_datetime.eq(Utc::now()),
            fetchlogs::has_error.eq(false),
        ))
        .execute(conn)
}

/// Quarantine one row: it will not be claimed again until resubmitted.
pub fn mark_failure(
    conn: &mut PgConnection,
    fetchlogs_id: i32,
    error: &str,
) -> QueryResult<usize> {
    log::warn!("processing of fetchlog {fetchlogs_id} failed: {error}");
    diesel::update(fetchlogs::table.find(fetchlogs_id))
        .set((
            fetchlogs::last_message.eq(error),
            fetchlogs::has_error.eq(true),
            fetchlogs::completed_datetime.eq(Utc::now()),
        ))
        .execute(conn)
}

/// Quarantine every row of a claim batch in one statement.
pub fn mark_failure_many(
    conn: &mut PgConnection,
    fetchlogs_ids: &[i32],
    error: &str,
) -> QueryResult<usize> {
    diesel::update(fetchlogs::table.filter(fetchlogs::fetchlogs_id.eq_any(fetchlogs_ids)))
        .set((
            fetchlogs::last_message.eq(error),
            fetchlogs::has_error.eq(true),
            fetchlogs::completed_datetime.eq(Utc::now()),
        ))
        .execute(conn)
}

/// Clear the terminal state of a row so it becomes eligible again.
/// Reprocessing a quarantined file is always an explicit action.
pub fn resubmit(conn: &mut PgConnection, key: &str) -> QueryResult<usize> {
    diesel::update(fetchlogs::table.filter(fetchlogs::key.eq(key)))
        .set((
            fetchlogs::completed_datetime.eq(None::<DateTime<Utc>>),
            fetchlogs::has_error.eq(false),
            fetchlogs::last_message.eq(None::<String>),
        ))
        .execute(conn)
}

/// Upsert a row for a newly-observed object. Re-uploading an object with the
/// same key refreshes `last_modified` and clears `completed_datetime`, which
/// re-queues it for processing.
pub fn insert(
    conn: &mut PgConnection,
    key: &str,
    file_size: Option<i64>,
    last_modified: Option<DateTime<Utc>>,
) -> QueryResult<usize> {
    diesel::insert_into(fetchlogs::table)
        .values(NewFetchlog {
            key,
            file_size,
            last_modified,
            init_datetime: Utc::now(),
        })
        .on_conflict(fetchlogs::key)
        .do_update()
        .set((
            fetchlogs::last_modified.eq(excluded(fetchlogs::last_modified)),
            fetchlogs::completed_datetime.eq(None::<DateTime<Utc>>),
        ))
        .execute(conn)
}

/// Inspect rows whose key matches a pattern, regardless of state.
pub fn logs_for_pattern(
    conn: &mut PgConnection,
    pattern: &str,
    limit: i64,
) -> QueryResult<Vec<Fetchlog>> {
    sql_query(
        "SELECT fetchlogs_id, key, file_size, last_modified, init_datetime
         , loaded_datetime, completed_datetime, last_message, has_error
         , jobs, batch_uuid
         FROM fetchlogs
         WHERE key ~* $1
         LIMIT $2",
    )
    .bind::<Text, _>(pattern)
    .bind::<BigInt, _>(limit)
    .load::<Fetchlog>(conn)
}

/// Re-read the rows of a previous claim by its batch id.
pub fn rows_for_batch(conn: &mut PgConnection, batch_uuid: &str) -> QueryResult<Vec<ClaimedFetchlog>> {
    let rows = fetchlogs::table
        .filter(fetchlogs::batch_uuid.eq(batch_uuid))
        .select((
            fetchlogs::fetchlogs_id,
            fetchlogs::key,
            fetchlogs::last_modified,
        ))
        .load::<(i32, String, Option<DateTime<Utc>>)>(conn)?;
    Ok(rows
        .into_iter()
        .map(|(fetchlogs_id, key, last_modified)| ClaimedFetchlog {
            fetchlogs_id,
            key,
            last_modified,
        })
        .collect())
}
