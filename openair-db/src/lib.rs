mod migrations;
mod pool;
mod schema;
mod url;

pub mod models;
pub mod queue;
pub mod staging;

pub(crate) use schema::*;

pub use migrations::{MigrationError, run_migrations};
pub use pool::*;
pub use url::*;

pub use diesel::{Connection, PgConnection};

pub type QueryError = diesel::result::Error;
pub type QueryResult<T> = diesel::QueryResult<T>;
