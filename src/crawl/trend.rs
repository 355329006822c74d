// src/crawl/trend.rs
//! Rising/falling classification of one numeric reading against the previous
//! one. Warm-started from the last persisted envelope so a restart does not
//! lose the comparison point.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crawl::types::Payload;
use crate::sink::{Envelope, LearningsLog, PersistenceSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
    Flat,
}

impl Trend {
    pub fn classify(previous: f64, current: f64) -> Self {
        if current > previous {
            Trend::Rising
        } else if current < previous {
            Trend::Falling
        } else {
            Trend::Flat
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TrendMemory {
    value: Option<f64>,
    /// Last non-flat direction.
    direction: Option<Trend>,
}

impl TrendMemory {
    fn from_envelope(env: &Envelope) -> Self {
        let trend = &env.data["trend"];
        let direction = [&trend["last_move"], &trend["direction"]]
            .into_iter()
            .find_map(|v| serde_json::from_value::<Trend>(v.clone()).ok())
            .filter(|d| *d != Trend::Flat);
        Self {
            value: trend["value"].as_f64(),
            direction,
        }
    }
}

pub struct TrendTracker {
    source_name: String,
    /// JSON pointer into the reshaped payload, e.g. `/price`.
    field: String,
    memory: Mutex<TrendMemory>,
    learnings: Option<Arc<LearningsLog>>,
    // when set, the comparison point is the last envelope actually saved
    baseline: Option<Arc<PersistenceSink>>,
}

impl TrendTracker {
    pub fn new(source_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            field: field.into(),
            memory: Mutex::new(TrendMemory::default()),
            learnings: None,
            baseline: None,
        }
    }

    pub fn with_learnings(mut self, log: Option<Arc<LearningsLog>>) -> Self {
        self.learnings = log;
        self
    }

    /// Compare every reading against the last envelope saved by `sink`, so a
    /// reading whose save failed never becomes the comparison point.
    pub fn with_baseline(mut self, sink: Option<Arc<PersistenceSink>>) -> Self {
        self.baseline = sink;
        self
    }

    /// Seed the comparison point from a previously saved envelope.
    pub fn warm_start(self, previous: Option<&Envelope>) -> Self {
        if let Some(env) = previous {
            *self.memory.lock() = TrendMemory::from_envelope(env);
        }
        self
    }

    fn comparison_point(&self) -> TrendMemory {
        if let Some(sink) = &self.baseline {
            match sink.load(&self.source_name) {
                Ok(Some(env)) => return TrendMemory::from_envelope(&env),
                Ok(None) => return TrendMemory::default(),
                Err(e) => {
                    tracing::warn!(error = %e, source = %self.source_name, "could not read trend baseline");
                }
            }
        }
        *self.memory.lock()
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn previous_value(&self) -> Option<f64> {
        self.memory.lock().value
    }

    /// Wrap `data` as `{ data, trend }`. Readings that are not numbers leave
    /// the memory untouched and report `trend: null`.
    pub fn annotate(&self, data: Payload) -> Payload {
        let Some(current) = data.pointer(&self.field).and_then(|v| v.as_f64()) else {
            tracing::debug!(source = %self.source_name, field = %self.field, "trend field missing or not numeric");
            return json!({ "data": data, "trend": null });
        };

        let base = self.comparison_point();
        let previous = base.value;
        let direction = previous.map(|p| Trend::classify(p, current));
        let flipped_from = match (base.direction, direction) {
            (Some(Trend::Rising), Some(Trend::Falling))
            | (Some(Trend::Falling), Some(Trend::Rising)) => base.direction,
            _ => None,
        };
        let last_move = match direction {
            Some(d) if d != Trend::Flat => Some(d),
            _ => base.direction,
        };
        *self.memory.lock() = TrendMemory {
            value: Some(current),
            direction: last_move,
        };

        if let (Some(from), Some(to), Some(log)) = (flipped_from, direction, &self.learnings) {
            let finding = json!({
                "field": self.field,
                "from": from,
                "to": to,
                "previous": previous,
                "value": current,
            });
            if let Err(e) = log.append(&self.source_name, finding) {
                tracing::warn!(error = %e, source = %self.source_name, "failed to append learning");
            }
        }

        json!({
            "data": data,
            "trend": {
                "field": self.field,
                "value": current,
                "previous": previous,
                "direction": direction,
                "last_move": last_move,
            }
        })
    }
}
