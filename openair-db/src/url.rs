use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct DatabaseConfig {
    host: Option<String>,
    port: Option<u16>,
    db: Option<String>,
    read_user: Option<String>,
    read_password: Option<String>,
    write_user: Option<String>,
    write_password: Option<String>,
    read_url: Option<String>,
    write_url: Option<String>,
}

fn database_config() -> DatabaseConfig {
    let provider = figment::providers::Env::prefixed("DATABASE_");
    figment::Figment::from(provider)
        .extract()
        .expect("Database configuration environment variable(s) invalid")
}

fn build_url(user: Option<String>, password: Option<String>, config: &DatabaseConfig) -> String {
    let user = user.expect("A DATABASE_*_USER must be provided");
    let password = password.expect("A DATABASE_*_PASSWORD must be provided");
    let host = config.host.as_deref().expect("DATABASE_HOST must be provided");
    let port = config.port.expect("DATABASE_PORT must be provided");
    let db = config.db.as_deref().expect("DATABASE_DB must be provided");

    // Must percent encode the password; it can contain URL-significant
    // characters.
    let password = utf8_percent_encode(&password, NON_ALPHANUMERIC);

    format!("postgresql://{user}:{password}@{host}:{port}/{db}")
}

/// The write-role connection string, from `DATABASE_WRITE_URL` or assembled
/// from the individual `DATABASE_*` variables.
pub fn write_url_from_environment() -> String {
    let config = database_config();
    if let Some(url) = config.write_url.clone() {
        return url;
    }
    build_url(config.write_user.clone(), config.write_password.clone(), &config)
}

/// The read-role connection string, from `DATABASE_READ_URL` or assembled
/// from the individual `DATABASE_*` variables.
pub fn read_url_from_environment() -> String {
    let config = database_config();
    if let Some(url) = config.read_url.clone() {
        return url;
    }
    build_url(config.read_user.clone(), config.read_password.clone(), &config)
}
