use log::{error, info};
use std::future::Future;
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::ingest::{IngestFatalError, load_batch, load_stream};
use crate::resources::Resources;

// The three queue streams, selected by key family.
pub const METADATA_PATTERN: &str = "^stations/";
pub const REALTIME_PATTERN: &str = r"^realtime/.*\.ndjson(\.gz)?$";
pub const PIPELINE_PATTERN: &str = r"^measures/.*\.(csv|json)(\.gz)?$";

#[derive(Debug, Clone)]
pub struct CronOptions {
    pub timeout: Duration,
    pub ascending: bool,
    pub metadata_limit: i64,
    pub realtime_limit: i64,
    pub pipeline_limit: i64,
    pub pause: bool,
    pub fetchlog_key: Option<String>,
    pub batch: Option<String>,
    pub limit: i64,
}

impl CronOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.ingest_timeout),
            ascending: settings.fetch_ascending,
            metadata_limit: settings.metadata_limit,
            realtime_limit: settings.realtime_limit,
            pipeline_limit: settings.pipeline_limit,
            pause: settings.pause_ingesting,
            fetchlog_key: None,
            batch: None,
            limit: 10,
        }
    }
}

/// One scheduled invocation: drain the three streams until they are empty
/// or the wall-clock budget runs out. Never returns an error; whatever is
/// left in the queue waits for the next invocation.
pub async fn run(resources: &Resources, opts: &CronOptions) {
    if opts.pause {
        info!("ingesting is paused");
        return;
    }
    let start = Instant::now();

    if let Some(batch_uuid) = &opts.batch {
        // re-run a previous claim batch by hand
        match load_batch(resources, batch_uuid).await {
            Ok(count) => info!("loaded {count} records for batch {batch_uuid}"),
            Err(err) => error!("load batch failed: {err}"),
        }
        return;
    }

    if let Some(pattern) = &opts.fetchlog_key {
        // one-off pattern, for running the occasional file by hand
        match load_stream(resources, pattern, opts.limit, opts.ascending).await {
            Ok(count) => info!("loaded {count} records for pattern {pattern}"),
            Err(err) => error!("load pattern failed: {err}"),
        }
        return;
    }

    info!("running scheduled ingest, ascending: {}", opts.ascending);

    drain(
        opts,
        start,
        |limit, ascending| load_stream(resources, METADATA_PATTERN, limit, ascending),
        |limit, ascending| load_stream(resources, REALTIME_PATTERN, limit, ascending),
        |limit, ascending| load_stream(resources, PIPELINE_PATTERN, limit, ascending),
    )
    .await;

    info!("done processing: {:.4} seconds", start.elapsed().as_secs_f64());
}

/// Drain loop over the three stream loaders. Generic so tests can inject
/// failing streams; a failure in one stream never reaches the next.
async fn drain<M, R, P, MF, RF, PF>(
    opts: &CronOptions,
    start: Instant,
    mut metadata: M,
    mut realtime: R,
    mut pipeline: P,
) where
    M: FnMut(i64, bool) -> MF,
    MF: Future<Output = Result<usize, IngestFatalError>>,
    R: FnMut(i64, bool) -> RF,
    RF: Future<Output = Result<usize, IngestFatalError>>,
    P: FnMut(i64, bool) -> PF,
    PF: Future<Output = Result<usize, IngestFatalError>>,
{
    drain_stream("metadata", opts.metadata_limit, opts, start, &mut metadata).await;
    drain_stream("realtime", opts.realtime_limit, opts, start, &mut realtime).await;
    drain_stream("pipeline", opts.pipeline_limit, opts, start, &mut pipeline).await;
}

async fn drain_stream<F, Fut>(
    name: &str,
    limit: i64,
    opts: &CronOptions,
    start: Instant,
    load: &mut F,
) where
    F: FnMut(i64, bool) -> Fut,
    Fut: Future<Output = Result<usize, IngestFatalError>>,
{
    if limit <= 0 {
        return;
    }
    let mut count = 0usize;
    loop {
        match load(limit, opts.ascending).await {
            Ok(0) => break,
            Ok(loaded) => {
                count += loaded;
                info!(
                    "loaded {count} {name} records, timer: {:.4}",
                    start.elapsed().as_secs_f64()
                );
                if start.elapsed() >= opts.timeout {
                    break;
                }
            }
            Err(err) => {
                error!("load {name} failed: {err}");
                break;
            }
        }
    }
}
