use crate::config::Settings;
use obstore::ObjectStore;
use openair_db::{ConnectionPool, PoolError, get_pool};

/// Shared handles for one worker invocation. Passed explicitly through the
/// call chain; nothing here outlives the invocation.
pub struct Resources {
    pub pool: ConnectionPool,
    pub store: ObjectStore,
    pub settings: Settings,
}

impl Resources {
    pub async fn new(settings: Settings) -> Result<Self, PoolError> {
        let pool = get_pool(settings.db_pool_size)?;
        let store = ObjectStore::connect(settings.fetch_bucket.clone(), settings.dryrun).await;
        Ok(Self {
            pool,
            store,
            settings,
        })
    }

    /// Assemble from pre-built parts. Tests use this to point the worker at
    /// a scratch database and a stubbed store.
    pub fn with_parts(pool: ConnectionPool, store: ObjectStore, settings: Settings) -> Self {
        Self {
            pool,
            store,
            settings,
        }
    }
}
