use diesel::sql_types::BigInt;
use diesel::{Connection, ConnectionError, PgConnection, RunQueryDsl};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::info;
use miette::Diagnostic;
use std::error::Error;
use thiserror::Error;

use crate::QueryError;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("../migrations");
const MIGRATION_LOCK_ID: i64 = 70417;

#[derive(Debug, Error, Diagnostic)]
pub enum MigrationError {
    #[error("couldn't connect to database")]
    FailedToConnectToDatabase(#[source] ConnectionError),

    #[error("error acquiring migrations lock")]
    FailedToAcquireMigrationsLock(#[source] QueryError),

    #[error("error running migrations")]
    FailedToRunMigrations(#[source] Box<dyn Error + Send + Sync>),
}

/// Run any pending migrations. Multiple workers may start at once, so the
/// run is serialized on a pg advisory lock. The lock is released with the
/// connection.
pub fn run_migrations() -> Result<(), MigrationError> {
    let url = crate::write_url_from_environment();

    let mut conn =
        PgConnection::establish(&url).map_err(MigrationError::FailedToConnectToDatabase)?;

    info!("Acquiring migrations lock");
    diesel::sql_query("select pg_advisory_lock($1);")
        .bind::<BigInt, _>(MIGRATION_LOCK_ID)
        .execute(&mut conn)
        .map_err(MigrationError::FailedToAcquireMigrationsLock)?;

    info!("Running pending migrations");
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(MigrationError::FailedToRunMigrations)?;

    info!("Migrations finished");
    Ok(())
}
