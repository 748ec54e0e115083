/*!
 * Metrics Events
 * Sampled structured events emitted by the compaction and freeze workers
 */

use crate::compactor::types::{CompactAction, CompactTier};
use crate::core::types::{Pid, PrincipalId};
use crate::ports::RssSnapshot;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;

/// One observability event. Serialized as a tagged JSON object.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricsEvent {
    CompactionPerformed {
        pid: Pid,
        name: String,
        tier: CompactTier,
        action: CompactAction,
        rss_before: RssSnapshot,
        rss_after: RssSnapshot,
        elapsed_ms: u64,
    },
    ProcessFrozen {
        pid: Pid,
        name: String,
        unfrozen_ms: u64,
    },
    ProcessUnfrozen {
        pid: Pid,
        name: String,
        frozen_ms: u64,
    },
    DaemonKill {
        pid: Pid,
        principal: PrincipalId,
    },
}

/// Event consumer; the default sink logs one JSON line per event
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: MetricsEvent);
}

#[derive(Debug, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn emit(&self, event: MetricsEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => log::info!(target: "procwarden::metrics", "{}", json),
            Err(err) => log::warn!("Unserializable metrics event: {}", err),
        }
    }
}

/// In-memory sink for tests
#[derive(Debug, Default)]
pub struct VecSink {
    events: Mutex<Vec<MetricsEvent>>,
}

impl VecSink {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn events(&self) -> Vec<MetricsEvent> {
        self.events.lock().clone()
    }
}

impl MetricsSink for VecSink {
    fn emit(&self, event: MetricsEvent) {
        self.events.lock().push(event);
    }
}

/// Bernoulli sampler behind the per-event sampling rates
#[derive(Debug)]
pub struct Sampler {
    rng: Mutex<StdRng>,
}

impl Sampler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sampler for tests
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Decide once with the given probability; rates at or above 1.0 always
    /// sample, at or below 0.0 never do
    #[must_use]
    pub fn sample(&self, rate: f32) -> bool {
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        self.rng.lock().gen::<f32>() < rate
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_extremes() {
        let sampler = Sampler::with_seed(7);
        assert!(sampler.sample(1.0));
        assert!(!sampler.sample(0.0));
    }

    #[test]
    fn sampler_rate_roughly_respected() {
        let sampler = Sampler::with_seed(42);
        let hits = (0..10_000).filter(|_| sampler.sample(0.1)).count();
        assert!((500..1500).contains(&hits), "hits={}", hits);
    }

    #[test]
    fn events_serialize_tagged() {
        let event = MetricsEvent::DaemonKill {
            pid: 7,
            principal: 1000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"daemon_kill\""));
    }
}
