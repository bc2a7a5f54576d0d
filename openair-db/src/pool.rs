use diesel::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};

pub use diesel::r2d2::PoolError;

pub type ConnectionPool = Pool<ConnectionManager<PgConnection>>;

/// Pool against the write-role URL from the environment.
pub fn get_pool(max_size: u32) -> Result<ConnectionPool, PoolError> {
    get_pool_for_url(crate::write_url_from_environment(), max_size)
}

/// Pool against an explicit URL. Lets tests point at a scratch database.
pub fn get_pool_for_url(url: String, max_size: u32) -> Result<ConnectionPool, PoolError> {
    let manager = ConnectionManager::new(url);

    Pool::builder().max_size(max_size).build(manager)
}
