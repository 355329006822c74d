// src/budget.rs
//! Spend ledger per provider per UTC day/month, checked against configured caps.
//!
//! Graduated response: at `warning_ratio` only a log line is emitted, at
//! `pause_ratio` sources outside the always-on allowlist are skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::sink::{read_json_opt, write_json_atomic, PersistError};

pub const LEDGER_FILE: &str = "budget.json";
/// Daily keys kept in the ledger file; months are kept forever.
const DAILY_KEYS_RETAINED: usize = 62;

fn default_warning_ratio() -> f64 {
    0.80
}
fn default_pause_ratio() -> f64 {
    0.95
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCaps {
    #[serde(default)]
    pub daily: Option<f64>,
    #[serde(default)]
    pub monthly: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetCaps {
    #[serde(default)]
    pub daily_cap: Option<f64>,
    #[serde(default)]
    pub monthly_cap: Option<f64>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderCaps>,
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
    #[serde(default = "default_pause_ratio")]
    pub pause_ratio: f64,
}

impl Default for BudgetCaps {
    fn default() -> Self {
        Self {
            daily_cap: None,
            monthly_cap: None,
            providers: BTreeMap::new(),
            warning_ratio: default_warning_ratio(),
            pause_ratio: default_pause_ratio(),
        }
    }
}

impl BudgetCaps {
    /// Clamp ratios into (0, 1] territory and keep warning <= pause.
    pub fn sanitized(mut self) -> Self {
        if !(self.warning_ratio > 0.0 && self.warning_ratio.is_finite()) {
            self.warning_ratio = default_warning_ratio();
        }
        if !(self.pause_ratio > 0.0 && self.pause_ratio.is_finite()) {
            self.pause_ratio = default_pause_ratio();
        }
        if self.warning_ratio > self.pause_ratio {
            std::mem::swap(&mut self.warning_ratio, &mut self.pause_ratio);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetCheck {
    pub daily_ratio: f64,
    pub monthly_ratio: f64,
    pub warning: bool,
    pub pause: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSpend {
    pub provider: String,
    pub daily: f64,
    pub monthly: f64,
    pub daily_cap: Option<f64>,
    pub monthly_cap: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetReport {
    pub day: String,
    pub month: String,
    pub daily_spend: f64,
    pub monthly_spend: f64,
    pub daily_cap: Option<f64>,
    pub monthly_cap: Option<f64>,
    pub check: BudgetCheck,
    pub providers: Vec<ProviderSpend>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerData {
    #[serde(default)]
    daily: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default)]
    monthly: BTreeMap<String, BTreeMap<String, f64>>,
}

fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

fn ratio(spend: f64, cap: Option<f64>) -> f64 {
    match cap {
        Some(c) if c > 0.0 => spend / c,
        _ => 0.0,
    }
}

// tolerate float noise such as 0.95000000001 vs 0.95
fn reaches(ratio: f64, threshold: f64) -> bool {
    ratio + 1e-9 >= threshold
}

pub struct BudgetLedger {
    path: Option<PathBuf>,
    caps: BudgetCaps,
    data: Mutex<LedgerData>,
}

impl BudgetLedger {
    /// Ledger that never touches disk.
    pub fn in_memory(caps: BudgetCaps) -> Self {
        Self {
            path: None,
            caps: caps.sanitized(),
            data: Mutex::new(LedgerData::default()),
        }
    }

    /// Load `{dir}/budget.json` (or start empty) and persist there afterwards.
    pub fn open(dir: impl AsRef<Path>, caps: BudgetCaps) -> Result<Self, PersistError> {
        let path = dir.as_ref().join(LEDGER_FILE);
        let data: LedgerData = read_json_opt(&path)?.unwrap_or_default();
        tracing::info!(path = %path.display(), months = data.monthly.len(), "budget ledger loaded");
        Ok(Self {
            path: Some(path),
            caps: caps.sanitized(),
            data: Mutex::new(data),
        })
    }

    pub fn caps(&self) -> &BudgetCaps {
        &self.caps
    }

    pub fn track(&self, provider: &str, amount: f64) -> Result<BudgetCheck, PersistError> {
        self.track_at(provider, amount, Utc::now())
    }

    /// Record spend and persist. The whole read-modify-write happens under one
    /// lock, so concurrent sources cannot undercount.
    pub fn track_at(
        &self,
        provider: &str,
        amount: f64,
        now: DateTime<Utc>,
    ) -> Result<BudgetCheck, PersistError> {
        let amount = if amount.is_finite() { amount.max(0.0) } else { 0.0 };
        let mut data = self.data.lock();

        *data
            .daily
            .entry(day_key(now))
            .or_default()
            .entry(provider.to_string())
            .or_insert(0.0) += amount;
        *data
            .monthly
            .entry(month_key(now))
            .or_default()
            .entry(provider.to_string())
            .or_insert(0.0) += amount;

        while data.daily.len() > DAILY_KEYS_RETAINED {
            let _ = data.daily.pop_first();
        }

        if let Some(path) = &self.path {
            write_json_atomic(path, &*data)?;
        }

        let check = self.check_data(&data, now);
        gauge!("budget_daily_ratio").set(check.daily_ratio);
        gauge!("budget_monthly_ratio").set(check.monthly_ratio);
        Ok(check)
    }

    pub fn check(&self) -> BudgetCheck {
        self.check_at(Utc::now())
    }

    pub fn check_at(&self, now: DateTime<Utc>) -> BudgetCheck {
        let data = self.data.lock();
        self.check_data(&data, now)
    }

    fn check_data(&self, data: &LedgerData, now: DateTime<Utc>) -> BudgetCheck {
        let day = data.daily.get(&day_key(now));
        let month = data.monthly.get(&month_key(now));
        let spend = |m: Option<&BTreeMap<String, f64>>, p: &str| {
            m.and_then(|m| m.get(p)).copied().unwrap_or(0.0)
        };
        let total = |m: Option<&BTreeMap<String, f64>>| {
            m.map(|m| m.values().sum::<f64>()).unwrap_or(0.0)
        };

        let mut daily_ratio = ratio(total(day), self.caps.daily_cap);
        let mut monthly_ratio = ratio(total(month), self.caps.monthly_cap);
        for (provider, caps) in &self.caps.providers {
            daily_ratio = daily_ratio.max(ratio(spend(day, provider), caps.daily));
            monthly_ratio = monthly_ratio.max(ratio(spend(month, provider), caps.monthly));
        }

        let worst = daily_ratio.max(monthly_ratio);
        BudgetCheck {
            daily_ratio,
            monthly_ratio,
            warning: reaches(worst, self.caps.warning_ratio),
            pause: reaches(worst, self.caps.pause_ratio),
        }
    }

    pub fn report(&self) -> BudgetReport {
        self.report_at(Utc::now())
    }

    pub fn report_at(&self, now: DateTime<Utc>) -> BudgetReport {
        let data = self.data.lock();
        let day_k = day_key(now);
        let month_k = month_key(now);
        let day = data.daily.get(&day_k);
        let month = data.monthly.get(&month_k);

        let mut names: Vec<&String> = self.caps.providers.keys().collect();
        names.extend(day.into_iter().flat_map(|m| m.keys()));
        names.extend(month.into_iter().flat_map(|m| m.keys()));
        names.sort();
        names.dedup();

        let providers = names
            .into_iter()
            .map(|p| {
                let caps = self.caps.providers.get(p).cloned().unwrap_or_default();
                ProviderSpend {
                    provider: p.clone(),
                    daily: day.and_then(|m| m.get(p)).copied().unwrap_or(0.0),
                    monthly: month.and_then(|m| m.get(p)).copied().unwrap_or(0.0),
                    daily_cap: caps.daily,
                    monthly_cap: caps.monthly,
                }
            })
            .collect::<Vec<_>>();

        BudgetReport {
            daily_spend: day.map(|m| m.values().sum::<f64>()).unwrap_or(0.0),
            monthly_spend: month.map(|m| m.values().sum::<f64>()).unwrap_or(0.0),
            day: day_k,
            month: month_k,
            daily_cap: self.caps.daily_cap,
            monthly_cap: self.caps.monthly_cap,
            check: self.check_data(&data, now),
            providers,
        }
    }

    /// Whether a scheduled run of `source` may proceed right now.
    pub fn admits(&self, source: &str, always_on: bool) -> bool {
        let check = self.check();
        if check.pause {
            if always_on {
                tracing::debug!(source, "budget paused; always-on source keeps running");
                return true;
            }
            tracing::info!(
                source,
                daily_ratio = check.daily_ratio,
                monthly_ratio = check.monthly_ratio,
                "budget pause threshold reached; skipping run"
            );
            return false;
        }
        if check.warning {
            tracing::warn!(
                source,
                daily_ratio = check.daily_ratio,
                monthly_ratio = check.monthly_ratio,
                "budget warning threshold reached"
            );
        }
        true
    }
}
