use async_compression::tokio::bufread::GzipDecoder;
use chrono::{DateTime, Utc};
use log::debug;
use miette::Diagnostic;
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufRead, BufReader};

/// A readable object body. Gzipped objects are decoded transparently, so
/// callers always see the uncompressed bytes.
pub type ObjectReader = Box<dyn AsyncBufRead + Send + Unpin>;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("error opening local file {path}")]
    OpenLocal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error requesting s3://{bucket}/{key}")]
    OpenRemote {
        bucket: String,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("error reading object metadata for s3://{bucket}/{key}")]
    Head {
        bucket: String,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("error uploading s3://{bucket}/{key}")]
    Put {
        bucket: String,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("error mirroring object to local file {path}")]
    WriteLocal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error compressing object body")]
    Compress(#[source] std::io::Error),
}

impl StoreError {
    /// Failures to open an object are worth retrying (the store may be
    /// briefly unavailable); everything after a successful open is not.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::OpenLocal { .. } | StoreError::OpenRemote { .. })
    }
}

/// Where a key points after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Remote { bucket: String, key: String },
}

/// Size and modification time reported by the store for one object.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectInfo {
    pub file_size: Option<i64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Client for the staging object store.
///
/// Keys are logical paths that may name a remote object (`s3://bucket/key`
/// or a bare key under the default bucket) or a local file (`local://path`
/// or a path that exists on disk). Keys arrive URL-encoded from upstream
/// notifications and are decoded before use.
pub struct ObjectStore {
    client: aws_sdk_s3::Client,
    default_bucket: String,
    dryrun: bool,
}

impl ObjectStore {
    pub async fn connect(default_bucket: impl Into<String>, dryrun: bool) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::with_client(aws_sdk_s3::Client::new(&config), default_bucket, dryrun)
    }

    /// Build from an existing SDK client. Used by tests to inject a client
    /// pointed at a stub endpoint.
    pub fn with_client(
        client: aws_sdk_s3::Client,
        default_bucket: impl Into<String>,
        dryrun: bool,
    ) -> Self {
        Self {
            client,
            default_bucket: default_bucket.into(),
            dryrun,
        }
    }

    pub fn default_bucket(&self) -> &str {
        &self.default_bucket
    }

    /// Decode a key and work out where it points.
    pub fn resolve(&self, key: &str) -> Location {
        let decoded = decode_key(key);

        if let Some(path) = decoded.strip_prefix("local://") {
            return Location::Local(PathBuf::from(path));
        }

        if let Some(rest) = decoded.strip_prefix("s3://") {
            let (bucket, key) = match rest.split_once('/') {
                Some((bucket, key)) => (bucket.to_string(), key.to_string()),
                None => (rest.to_string(), String::new()),
            };
            return Location::Remote { bucket, key };
        }

        if Path::new(&decoded).is_file() {
            return Location::Local(PathBuf::from(decoded));
        }

        Location::Remote {
            bucket: self.default_bucket.clone(),
            key: decoded,
        }
    }

    /// Open a key as a byte stream, gunzipping `.gz` objects on the fly.
    /// Remote bodies are streamed, never collected into memory here.
    pub async fn open(&self, key: &str) -> Result<ObjectReader, StoreError> {
        let gzipped = decode_key(key).ends_with(".gz");

        match self.resolve(key) {
            Location::Local(path) => {
                debug!("streaming local file data from {}", path.display());
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|source| StoreError::OpenLocal {
                        path: path.clone(),
                        source,
                    })?;
                let reader = BufReader::new(file);
                if gzipped {
                    Ok(Box::new(BufReader::new(GzipDecoder::new(reader))))
                } else {
                    Ok(Box::new(reader))
                }
            }
            Location::Remote { bucket, key } => {
                debug!("streaming object data from s3://{bucket}/{key}");
                let object = self
                    .client
                    .get_object()
                    .bucket(&bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|source| StoreError::OpenRemote {
                        bucket: bucket.clone(),
                        key: key.clone(),
                        source: Box::new(source),
                    })?;
                let body = BufReader::new(object.body.into_async_read());
                if gzipped {
                    Ok(Box::new(BufReader::new(GzipDecoder::new(body))))
                } else {
                    Ok(Box::new(body))
                }
            }
        }
    }

    /// Best-effort size and modification time for one object.
    pub async fn head(&self, bucket: Option<&str>, key: &str) -> Result<ObjectInfo, StoreError> {
        let bucket = bucket.unwrap_or(&self.default_bucket);
        let key = decode_key(key);
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(&key)
            .send()
            .await
            .map_err(|source| StoreError::Head {
                bucket: bucket.to_string(),
                key: key.clone(),
                source: Box::new(source),
            })?;

        Ok(ObjectInfo {
            file_size: head.content_length(),
            last_modified: head
                .last_modified()
                .and_then(|dt| dt.to_millis().ok())
                .and_then(DateTime::from_timestamp_millis),
        })
    }

    /// Gzip-compress `data` and store it under `key`. With dryrun set the
    /// object is mirrored into the local filesystem under the bucket name
    /// instead, preserving the key layout.
    pub async fn put(&self, key: &str, data: &str) -> Result<(), StoreError> {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data.as_bytes())
            .map_err(StoreError::Compress)?;
        let body = encoder.finish().map_err(StoreError::Compress)?;

        if self.dryrun {
            let path = Path::new(&self.default_bucket).join(decode_key(key));
            debug!("dryrun: writing object to local file {}", path.display());
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::WriteLocal {
                        path: path.clone(),
                        source,
                    })?;
            }
            tokio::fs::write(&path, body)
                .await
                .map_err(|source| StoreError::WriteLocal { path, source })?;
            return Ok(());
        }

        self.client
            .put_object()
            .bucket(&self.default_bucket)
            .key(decode_key(key))
            .body(body.into())
            .send()
            .await
            .map_err(|source| StoreError::Put {
                bucket: self.default_bucket.clone(),
                key: key.to_string(),
                source: Box::new(source),
            })?;
        Ok(())
    }
}

/// Keys arrive percent-encoded with `+` for spaces from upstream
/// notification payloads.
fn decode_key(key: &str) -> String {
    let plus_decoded = key.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8_lossy()
        .into_owned()
}
