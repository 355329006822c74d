// src/config/crawlers.rs
//! Daemon configuration: data locations, budget caps and the source registry.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::budget::BudgetCaps;
use crate::crawl::types::{is_valid_source_name, CostSpec, DEFAULT_MAX_ERRORS};

pub const ENV_CONFIG_PATH: &str = "CRAWLER_CONFIG_PATH";
pub const ENV_DATA_DIR: &str = "CRAWLER_DATA_DIR";
pub const ENV_LEARNINGS_DIR: &str = "CRAWLER_LEARNINGS_DIR";
pub const ENV_BUDGET_DIR: &str = "BUDGET_DATA_DIR";
pub const ENV_COLLECTOR_URL: &str = "CRAWLER_COLLECTOR_URL";
pub const ENV_API_BIND: &str = "CRAWLER_API_BIND";

pub const DEFAULT_TOML_PATH: &str = "config/crawlers.toml";
pub const DEFAULT_JSON_PATH: &str = "config/crawlers.json";

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_learnings_max_entries() -> usize {
    crate::sink::learnings::DEFAULT_MAX_ENTRIES
}
fn default_api_bind() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_run_all_delay_ms() -> u64 {
    1000
}
fn default_interval_secs() -> u64 {
    300
}
fn default_max_errors() -> u32 {
    DEFAULT_MAX_ERRORS
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Json,
    Rss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    pub url: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub push_remote: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Env var holding a bearer token for this source.
    #[serde(default)]
    pub auth_env: Option<String>,
    /// Skip the source entirely when `auth_env` is unset.
    #[serde(default)]
    pub require_auth: bool,
    /// JSON pointer selecting the kept part of the response (json sources).
    #[serde(default)]
    pub select: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// JSON pointer to a numeric reading classified rising/falling/flat.
    #[serde(default)]
    pub trend_field: Option<String>,
    #[serde(default)]
    pub cost: Option<CostSpec>,
}

impl SourceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Bearer token from the environment, if configured and present.
    pub fn auth_token(&self) -> Option<String> {
        self.auth_env
            .as_deref()
            .and_then(|k| std::env::var(k).ok())
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Sources that keep running when the pause threshold is reached.
    #[serde(default)]
    pub always_on: Vec<String>,
    #[serde(flatten)]
    pub caps: BudgetCaps,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub learnings_dir: Option<PathBuf>,
    #[serde(default = "default_learnings_max_entries")]
    pub learnings_max_entries: usize,
    #[serde(default)]
    pub collector_url: Option<String>,
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
    #[serde(default = "default_run_all_delay_ms")]
    pub run_all_delay_ms: u64,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            learnings_dir: None,
            learnings_max_entries: default_learnings_max_entries(),
            collector_url: None,
            api_bind: default_api_bind(),
            run_all_delay_ms: default_run_all_delay_ms(),
            budget: BudgetConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn learnings_dir(&self) -> PathBuf {
        self.learnings_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("learnings"))
    }

    pub fn budget_dir(&self) -> PathBuf {
        self.budget
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("budget"))
    }

    pub fn run_all_delay(&self) -> Duration {
        Duration::from_millis(self.run_all_delay_ms)
    }

    pub fn is_always_on(&self, name: &str) -> bool {
        self.budget.always_on.iter().any(|n| n == name)
    }

    /// Env values take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        if let Some(v) = var(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var(ENV_LEARNINGS_DIR) {
            self.learnings_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var(ENV_BUDGET_DIR) {
            self.budget.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var(ENV_COLLECTOR_URL) {
            self.collector_url = Some(v);
        }
        if let Some(v) = var(ENV_API_BIND) {
            self.api_bind = v;
        }
    }

    /// Fix values that would break scheduling and reject bad source names.
    pub fn sanitize(mut self) -> Result<Self> {
        self.collector_url = self
            .collector_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        self.learnings_max_entries = self.learnings_max_entries.max(1);
        self.budget.caps = self.budget.caps.sanitized();

        let mut seen = HashSet::new();
        for s in &mut self.sources {
            s.name = s.name.trim().to_string();
            if !is_valid_source_name(&s.name) {
                bail!("invalid source name {:?}", s.name);
            }
            if !seen.insert(s.name.clone()) {
                tracing::warn!(source = %s.name, "duplicate source name; the later entry wins");
            }
            if s.interval_secs == 0 {
                s.interval_secs = default_interval_secs();
            }
            if s.timeout_secs == 0 {
                s.timeout_secs = default_timeout_secs();
            }
            s.max_errors = s.max_errors.max(1);
        }
        Ok(self)
    }
}

/// Load from an explicit path. TOML or JSON, picked by extension.
pub fn load_config_from(path: &Path) -> Result<DaemonConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading crawler config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mut cfg = parse_config(&content, &ext)
        .with_context(|| format!("parsing crawler config {}", path.display()))?;
    cfg.apply_env_overrides();
    cfg.sanitize()
}

/// Resolve the config file:
/// 1) $CRAWLER_CONFIG_PATH
/// 2) config/crawlers.toml
/// 3) config/crawlers.json
/// 4) built-in defaults (no sources)
pub fn load_config_default() -> Result<DaemonConfig> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        return load_config_from(&pb);
    }
    for candidate in [DEFAULT_TOML_PATH, DEFAULT_JSON_PATH] {
        let pb = PathBuf::from(candidate);
        if pb.exists() {
            return load_config_from(&pb);
        }
    }
    tracing::info!("no crawler config found; using defaults");
    let mut cfg = DaemonConfig::default();
    cfg.apply_env_overrides();
    cfg.sanitize()
}

fn parse_config(s: &str, hint_ext: &str) -> Result<DaemonConfig> {
    match hint_ext {
        "json" => Ok(serde_json::from_str(s)?),
        "toml" => Ok(toml::from_str(s)?),
        _ => toml::from_str(s)
            .map_err(anyhow::Error::from)
            .or_else(|_| serde_json::from_str(s).map_err(anyhow::Error::from))
            .map_err(|_| anyhow!("unsupported crawler config format")),
    }
}
