mod config;
mod cron;
mod handler;
mod ingest;
mod parse;
mod resources;

use crate::config::Settings;
use crate::cron::CronOptions;
use crate::resources::Resources;
use log::info;
use miette::IntoDiagnostic;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let settings = Settings::config().into_diagnostic()?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&settings.log_level),
    )
    .init();

    openair_db::run_migrations().into_diagnostic()?;

    let resources = Resources::new(settings).await.into_diagnostic()?;

    if let Some(path) = std::env::args().nth(1) {
        // a notification envelope from a file, for one-off runs
        info!("Processing event from {path}");
        let event_text = std::fs::read_to_string(&path).into_diagnostic()?;
        let event: serde_json::Value = serde_json::from_str(&event_text).into_diagnostic()?;
        handler::handle(&resources, &event).await;
    } else {
        let options = CronOptions::from_settings(&resources.settings);
        cron::run(&resources, &options).await;
    }

    Ok(())
}
