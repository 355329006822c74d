// src/crawl/types.rs
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reshaped result of one poll. Opaque to the scheduler.
pub type Payload = serde_json::Value;

pub const DEFAULT_MAX_ERRORS: u32 = 5;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
/// Shortest polling period; tokio intervals reject a zero period.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Failure classes tracked independently in `RunState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Parse,
    Persistence,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::Parse => "parse",
            FailureKind::Persistence => "persistence",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned HTTP {status}")]
    Status { status: u16 },
    #[error("fetch did not finish within {0:?}")]
    Timeout(Duration),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("persistence error: {0}")]
    Persist(#[from] crate::sink::PersistError),
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Network(_) | FetchError::Status { .. } | FetchError::Timeout(_) => {
                FailureKind::Network
            }
            FetchError::Parse(_) => FailureKind::Parse,
            FetchError::Persist(_) => FailureKind::Persistence,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return FetchError::Parse(e.to_string());
        }
        match e.status() {
            Some(s) => FetchError::Status { status: s.as_u16() },
            None => FetchError::Network(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Parse(e.to_string())
    }
}

/// Spend charged to the budget ledger for every attempted fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSpec {
    pub provider: String,
    pub per_call: f64,
}

/// One named external data origin. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub name: String,
    pub interval: Duration,
    pub max_errors: u32,
    pub timeout: Duration,
    pub push_remote: bool,
    pub always_on: bool,
    pub cost: Option<CostSpec>,
}

impl Source {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval: interval.max(MIN_INTERVAL),
            max_errors: DEFAULT_MAX_ERRORS,
            timeout: DEFAULT_TIMEOUT,
            push_remote: false,
            always_on: false,
            cost: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_max_errors(mut self, n: u32) -> Self {
        self.max_errors = n.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_push_remote(mut self, on: bool) -> Self {
        self.push_remote = on;
        self
    }

    pub fn with_always_on(mut self, on: bool) -> Self {
        self.always_on = on;
        self
    }

    pub fn with_cost(mut self, provider: impl Into<String>, per_call: f64) -> Self {
        self.cost = Some(CostSpec {
            provider: provider.into(),
            per_call,
        });
        self
    }
}

/// Source names become file names, so keep them to a safe alphabet.
pub fn is_valid_source_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Source-specific request shape and response reshaping.
#[async_trait::async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Payload, FetchError>;
}

/// Adapter so a plain async closure can serve as a strategy.
pub struct FnFetcher<F> {
    f: F,
}

pub fn fetch_fn<F, Fut>(f: F) -> FnFetcher<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, FetchError>> + Send + 'static,
{
    FnFetcher { f }
}

#[async_trait::async_trait]
impl<F, Fut> SourceFetcher for FnFetcher<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, FetchError>> + Send + 'static,
{
    async fn fetch(&self) -> Result<Payload, FetchError> {
        (self.f)().await
    }
}
