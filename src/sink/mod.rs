// src/sink/mod.rs
//! Persistence sink: one JSON envelope file per source, plus best-effort
//! forwarding of each envelope to a remote collector.

pub mod learnings;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::crawl::types::{is_valid_source_name, Payload};

pub use learnings::LearningsLog;

pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("invalid source name {0:?}")]
    InvalidName(String),
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("json error on {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// The persisted unit for one poll result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source_name: String,
    pub timestamp: DateTime<Utc>,
    pub data: Payload,
}

#[derive(Serialize)]
struct CollectorBody<'a> {
    crawler: &'a str,
    data: &'a Envelope,
}

#[derive(Clone)]
pub struct RemoteCollector {
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl RemoteCollector {
    pub fn new(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            timeout: DEFAULT_PUSH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/crawlers/data", self.base_url)
    }
}

pub struct PersistenceSink {
    data_dir: PathBuf,
    collector: Option<RemoteCollector>,
    // background pushes, awaited by `flush` before the process exits
    pending: Mutex<JoinSet<bool>>,
}

impl PersistenceSink {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            collector: None,
            pending: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_collector(mut self, collector: Option<RemoteCollector>) -> Self {
        self.collector = collector;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path_for(&self, source_name: &str) -> Result<PathBuf, PersistError> {
        if !is_valid_source_name(source_name) {
            return Err(PersistError::InvalidName(source_name.to_string()));
        }
        Ok(self.data_dir.join(format!("{source_name}.json")))
    }

    /// Overwrite `{data_dir}/{source_name}.json` with a fresh envelope.
    pub fn save(&self, source_name: &str, payload: &Payload) -> Result<Envelope, PersistError> {
        self.save_at(source_name, payload, Utc::now())
    }

    pub fn save_at(
        &self,
        source_name: &str,
        payload: &Payload,
        now: DateTime<Utc>,
    ) -> Result<Envelope, PersistError> {
        let path = self.path_for(source_name)?;
        let envelope = Envelope {
            source_name: source_name.to_string(),
            timestamp: now,
            data: payload.clone(),
        };
        write_json_atomic(&path, &envelope)?;
        Ok(envelope)
    }

    /// Latest envelope for a source, `None` if it has never been saved.
    pub fn load(&self, source_name: &str) -> Result<Option<Envelope>, PersistError> {
        let path = self.path_for(source_name)?;
        read_json_opt(&path)
    }

    /// POST the envelope to the collector. Never fails; returns whether the
    /// collector accepted it.
    pub async fn push_remote(&self, envelope: &Envelope) -> bool {
        let Some(collector) = &self.collector else {
            tracing::debug!(source = %envelope.source_name, "remote push disabled (no collector url)");
            return false;
        };
        push_to(collector, envelope).await
    }

    /// Start a push in the background. Must be called inside a tokio runtime.
    pub fn spawn_push(&self, envelope: Envelope) {
        let Some(collector) = self.collector.clone() else {
            tracing::debug!(source = %envelope.source_name, "remote push disabled (no collector url)");
            return;
        };
        let mut pending = self.pending.lock();
        // reap finished pushes so a long-running daemon does not accumulate them
        while pending.try_join_next().is_some() {}
        pending.spawn(async move { push_to(&collector, &envelope).await });
    }

    pub fn pending_pushes(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait for background pushes, at most `timeout`. Pushes still running
    /// afterwards are aborted. Returns how many were accepted by the collector.
    pub async fn flush(&self, timeout: Duration) -> usize {
        let mut set = std::mem::replace(&mut *self.pending.lock(), JoinSet::new());
        if set.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(res) = set.join_next().await {
                if matches!(res, Ok(true)) {
                    delivered += 1;
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(abandoned = set.len(), "remote pushes still running at flush deadline");
            set.abort_all();
        }
        delivered
    }
}

async fn push_to(collector: &RemoteCollector, envelope: &Envelope) -> bool {
    let body = CollectorBody {
        crawler: &envelope.source_name,
        data: envelope,
    };
    let res = collector
        .client
        .post(collector.endpoint())
        .timeout(collector.timeout)
        .json(&body)
        .send()
        .await;

    match res.and_then(|r| r.error_for_status()) {
        Ok(_) => {
            tracing::debug!(source = %envelope.source_name, "pushed envelope to collector");
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, source = %envelope.source_name, "remote push failed");
            counter!("sink_push_failures_total", "source" => envelope.source_name.clone())
                .increment(1);
            false
        }
    }
}

/// Write-to-temp-then-rename so readers never observe a partial file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let io_err = |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_err)?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

pub(crate) fn read_json_opt<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, PersistError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| PersistError::Json {
            path: path.to_path_buf(),
            source,
        })
}
