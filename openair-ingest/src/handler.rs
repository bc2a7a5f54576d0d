use chrono::Utc;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::config::Settings;
use crate::cron::{self, CronOptions};
use crate::resources::Resources;
use openair_db::queue;

/// Entry point for one notification envelope: object-store events (direct
/// or wrapped) feed the queue, scheduler events hand off to the cron
/// orchestrator, anything else is ignored.
pub async fn handle(resources: &Resources, event: &Value) {
    if let Some(records) = event.get("Records").and_then(Value::as_array) {
        intake(resources, records).await;
    } else if event.get("source").and_then(Value::as_str) == Some("aws.events") {
        let scheduler: SchedulerEvent = match serde_json::from_value(event.clone()) {
            Ok(scheduler) => scheduler,
            Err(err) => {
                error!("unreadable scheduler event: {err}");
                return;
            }
        };
        let options = scheduler.options(&resources.settings);
        cron::run(resources, &options).await;
    } else {
        warn!("nothing to do for event: {event}");
    }
}

/// Insert a fetchlog row for every object named in the records. Size and
/// modification time are best-effort; a store that won't answer doesn't
/// block the insert.
async fn intake(resources: &Resources, records: &[Value]) {
    let mut conn = match resources.pool.get() {
        Ok(conn) => conn,
        Err(err) => {
            error!("failed file insert: {err}");
            return;
        }
    };

    for (bucket, key) in collect_keys(records) {
        let object = match resources.store.head(Some(&bucket), &key).await {
            Ok(object) => object,
            Err(err) => {
                error!("could not get info for {bucket}:{key}: {err}");
                obstore::ObjectInfo::default()
            }
        };
        let last_modified = object.last_modified.or_else(|| Some(Utc::now()));

        match queue::insert(&mut conn, &key, object.file_size, last_modified) {
            Ok(_) => info!("inserted: {bucket}:{key}"),
            Err(err) => error!("failed file insert: {key}: {err}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ObjectRecord {
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: NamedEntity,
    object: KeyedEntity,
}

#[derive(Debug, Deserialize)]
struct NamedEntity {
    name: String,
}

#[derive(Debug, Deserialize)]
struct KeyedEntity {
    key: String,
}

#[derive(Debug, Deserialize)]
struct WrappedRecord {
    #[serde(rename = "Sns")]
    sns: SnsMessage,
}

#[derive(Debug, Deserialize)]
struct SnsMessage {
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Debug, Deserialize)]
struct DirectPayload {
    #[serde(rename = "Records")]
    records: Vec<ObjectRecord>,
}

/// Pull `(bucket, key)` pairs out of a record list. Wrapper envelopes carry
/// the direct payload JSON-encoded in their message body. Records that
/// don't parse are logged and skipped.
fn collect_keys(records: &[Value]) -> Vec<(String, String)> {
    let mut keys = Vec::new();
    for record in records {
        if record.get("EventSource").and_then(Value::as_str) == Some("aws:sns") {
            let payload = serde_json::from_value::<WrappedRecord>(record.clone())
                .and_then(|wrapped| serde_json::from_str::<DirectPayload>(&wrapped.sns.message));
            match payload {
                Ok(payload) => keys.extend(
                    payload
                        .records
                        .into_iter()
                        .map(|r| (r.s3.bucket.name, r.s3.object.key)),
                ),
                Err(err) => error!("unreadable notification record: {err}"),
            }
        } else {
            match serde_json::from_value::<ObjectRecord>(record.clone()) {
                Ok(record) => keys.push((record.s3.bucket.name, record.s3.object.key)),
                Err(err) => error!("unreadable notification record: {err}"),
            }
        }
    }
    keys
}

/// Per-invocation overrides carried on a scheduler event.
#[derive(Debug, Default, Deserialize)]
pub struct SchedulerEvent {
    #[serde(rename = "fetchlogKey")]
    pub fetchlog_key: Option<String>,
    pub batch: Option<String>,
    pub limit: Option<i64>,
    pub ascending: Option<bool>,
    pub pause: Option<bool>,
    pub metadata_limit: Option<i64>,
    pub realtime_limit: Option<i64>,
    pub pipeline_limit: Option<i64>,
}

impl SchedulerEvent {
    pub fn options(&self, settings: &Settings) -> CronOptions {
        let defaults = CronOptions::from_settings(settings);
        CronOptions {
            ascending: self.ascending.unwrap_or(defaults.ascending),
            pause: self.pause.unwrap_or(defaults.pause),
            metadata_limit: self.metadata_limit.unwrap_or(defaults.metadata_limit),
            realtime_limit: self.realtime_limit.unwrap_or(defaults.realtime_limit),
            pipeline_limit: self.pipeline_limit.unwrap_or(defaults.pipeline_limit),
            fetchlog_key: self.fetchlog_key.clone(),
            batch: self.batch.clone(),
            limit: self.limit.unwrap_or(defaults.limit),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_object_records_yield_keys() {
        let records = vec![json!({
            "eventSource": "aws:s3",
            "s3": {
                "bucket": {"name": "fetch-bucket"},
                "object": {"key": "stations/site-1.json"}
            }
        })];
        assert_eq!(
            collect_keys(&records),
            vec![("fetch-bucket".to_string(), "stations/site-1.json".to_string())]
        );
    }

    #[test]
    fn wrapped_records_decode_the_inner_payload() {
        let inner = json!({
            "Records": [
                {"s3": {"bucket": {"name": "b"}, "object": {"key": "measures/a.csv"}}},
                {"s3": {"bucket": {"name": "b"}, "object": {"key": "measures/b.csv"}}}
            ]
        });
        let records = vec![json!({
            "EventSource": "aws:sns",
            "Sns": {"Message": inner.to_string()}
        })];
        assert_eq!(
            collect_keys(&records),
            vec![
                ("b".to_string(), "measures/a.csv".to_string()),
                ("b".to_string(), "measures/b.csv".to_string()),
            ]
        );
    }

    #[test]
    fn unreadable_records_are_skipped() {
        let records = vec![
            json!({"unexpected": true}),
            json!({"s3": {"bucket": {"name": "b"}, "object": {"key": "k.json"}}}),
        ];
        assert_eq!(collect_keys(&records).len(), 1);
    }

    #[test]
    fn scheduler_event_overrides_settings() {
        let settings = Settings::default();
        let event: SchedulerEvent = serde_json::from_value(json!({
            "source": "aws.events",
            "ascending": true,
            "pipeline_limit": 100,
            "fetchlogKey": "^measures/acme/",
            "limit": 5
        }))
        .unwrap();

        let options = event.options(&settings);
        assert!(options.ascending);
        assert_eq!(options.pipeline_limit, 100);
        assert_eq!(options.metadata_limit, settings.metadata_limit);
        assert_eq!(options.fetchlog_key.as_deref(), Some("^measures/acme/"));
        assert_eq!(options.limit, 5);
    }
}
