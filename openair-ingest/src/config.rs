use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};

/// Ingest worker configuration. Only the listed environment variables are
/// recognized; everything else in the environment is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    pub fetch_bucket: String,
    pub etl_bucket: String,
    pub dryrun: bool,
    pub fetch_ascending: bool,
    pub ingest_timeout: u64,
    pub pipeline_limit: i64,
    pub realtime_limit: i64,
    pub metadata_limit: i64,
    pub log_level: String,
    pub use_temp_tables: bool,
    pub pause_ingesting: bool,
    pub db_pool_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fetch_bucket: String::new(),
            etl_bucket: String::new(),
            dryrun: false,
            fetch_ascending: false,
            ingest_timeout: 900,
            pipeline_limit: 10,
            realtime_limit: 10,
            metadata_limit: 10,
            log_level: "info".to_string(),
            use_temp_tables: true,
            pause_ingesting: false,
            db_pool_size: 4,
        }
    }
}

impl Settings {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default())).merge(Env::raw().only(&[
            "FETCH_BUCKET",
            "ETL_BUCKET",
            "DRYRUN",
            "FETCH_ASCENDING",
            "INGEST_TIMEOUT",
            "PIPELINE_LIMIT",
            "REALTIME_LIMIT",
            "METADATA_LIMIT",
            "LOG_LEVEL",
            "USE_TEMP_TABLES",
            "PAUSE_INGESTING",
            "DB_POOL_SIZE",
        ]))
    }

    pub fn config() -> figment::Result<Self> {
        Self::figment().extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.ingest_timeout, 900);
        assert_eq!(settings.pipeline_limit, 10);
        assert_eq!(settings.realtime_limit, 10);
        assert_eq!(settings.metadata_limit, 10);
        assert!(settings.use_temp_tables);
        assert!(!settings.fetch_ascending);
        assert!(!settings.pause_ingesting);
    }

    #[test]
    fn environment_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("FETCH_BUCKET", "fetch-bucket");
            jail.set_env("PIPELINE_LIMIT", "25");
            jail.set_env("PAUSE_INGESTING", "true");
            jail.set_env("SOME_UNRELATED_KEY", "ignored");

            let settings: Settings = Settings::figment().extract()?;
            assert_eq!(settings.fetch_bucket, "fetch-bucket");
            assert_eq!(settings.pipeline_limit, 25);
            assert!(settings.pause_ingesting);
            Ok(())
        });
    }
}
