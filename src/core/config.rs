/*!
 * Tunable Configuration
 *
 * A typed snapshot of the live-reloadable key/value namespace that supplies
 * throttle durations, sampling rates, enable flags, and exclusion lists.
 * A refresh re-reads every key; a key that is missing or fails to parse
 * falls back to its compiled-in default and logs, never propagates.
 */

use crate::compactor::types::CompactAction;
use crate::policy::bands::ProcState;
use log::warn;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const KEY_USE_COMPACTION: &str = "use_compaction";
pub const KEY_USE_FREEZER: &str = "use_freezer";
pub const KEY_COMPACT_ACTION_LIGHT: &str = "compact_action_light";
pub const KEY_COMPACT_ACTION_FULL: &str = "compact_action_full";
pub const KEY_COMPACT_THROTTLE_1: &str = "compact_throttle_1";
pub const KEY_COMPACT_THROTTLE_2: &str = "compact_throttle_2";
pub const KEY_COMPACT_THROTTLE_3: &str = "compact_throttle_3";
pub const KEY_COMPACT_THROTTLE_4: &str = "compact_throttle_4";
pub const KEY_COMPACT_THROTTLE_5: &str = "compact_throttle_5";
pub const KEY_COMPACT_THROTTLE_6: &str = "compact_throttle_6";
pub const KEY_COMPACT_SAMPLE_RATE: &str = "compact_sample_rate";
pub const KEY_FREEZE_SAMPLE_RATE: &str = "freeze_sample_rate";
pub const KEY_COMPACT_FULL_RSS_THROTTLE_KB: &str = "compact_full_rss_throttle_kb";
pub const KEY_COMPACT_FULL_DELTA_RSS_THROTTLE_KB: &str = "compact_full_delta_rss_throttle_kb";
pub const KEY_COMPACT_STATE_EXCLUDE: &str = "compact_proc_state_throttle";
pub const KEY_MAX_CACHED_PROCESSES: &str = "max_cached_processes";
pub const KEY_EMPTY_APP_PERCENT: &str = "empty_app_percent";
pub const KEY_TRIM_EMPTY_PERCENT: &str = "trim_empty_percent";
pub const KEY_TRIM_CACHE_PERCENT: &str = "trim_cache_percent";
pub const KEY_FREEZE_DEBOUNCE_MS: &str = "freeze_debounce_ms";

const DEFAULT_COMPACT_THROTTLE_1_MS: u64 = 5_000;
const DEFAULT_COMPACT_THROTTLE_2_MS: u64 = 10_000;
const DEFAULT_COMPACT_THROTTLE_3_MS: u64 = 500;
const DEFAULT_COMPACT_THROTTLE_4_MS: u64 = 10_000;
const DEFAULT_COMPACT_THROTTLE_5_MS: u64 = 10 * 60 * 1000;
const DEFAULT_COMPACT_THROTTLE_6_MS: u64 = 10 * 60 * 1000;
const DEFAULT_SAMPLE_RATE: f32 = 0.1;
const DEFAULT_FULL_RSS_THROTTLE_KB: u64 = 12_000;
const DEFAULT_FULL_DELTA_RSS_THROTTLE_KB: u64 = 8_000;
const DEFAULT_MAX_CACHED_PROCESSES: usize = 32;
const DEFAULT_EMPTY_APP_PERCENT: u32 = 50;
const DEFAULT_TRIM_PERCENT: u32 = 100;
const DEFAULT_FREEZE_DEBOUNCE_MS: u64 = 10 * 60 * 1000;

/// Where tunables come from. The real source is a flat JSON object on disk;
/// tests use an in-memory map.
pub trait TunableSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// In-memory source, primarily for tests and programmatic overrides
#[derive(Debug, Clone, Default)]
pub struct MapSource(pub HashMap<String, String>);

impl MapSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Display) -> &mut Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }
}

impl TunableSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Flat JSON object read from disk on every refresh. Values may be strings,
/// numbers, or booleans; everything is normalized to a string before the
/// per-key parsers run.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn snapshot(&self) -> HashMap<String, String> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) => {
                warn!("Tunables file {} unreadable: {}", self.path.display(), err);
                return HashMap::new();
            }
        };
        match serde_json::from_str::<serde_json::Value>(&data) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .map(|(k, v)| {
                    let s = match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (k, s)
                })
                .collect(),
            Ok(_) => {
                warn!("Tunables file {} is not an object", self.path.display());
                HashMap::new()
            }
            Err(err) => {
                warn!("Tunables file {} unparsable: {}", self.path.display(), err);
                HashMap::new()
            }
        }
    }
}

impl TunableSource for JsonFileSource {
    fn get(&self, key: &str) -> Option<String> {
        self.snapshot().remove(key)
    }
}

/// Typed snapshot of all tunables. Workers read through
/// [`SharedTunables`]; changes take effect on the next scheduled action.
#[derive(Debug, Clone, Serialize)]
pub struct Tunables {
    pub use_compaction: bool,
    pub use_freezer: bool,
    pub compact_action_light: CompactAction,
    pub compact_action_full: CompactAction,
    /// Min elapsed before a light compaction follows a light one
    pub compact_throttle_light_after_light: Duration,
    /// Min elapsed before a light compaction follows a full one
    pub compact_throttle_light_after_full: Duration,
    /// Min elapsed before a full compaction follows a light one
    pub compact_throttle_full_after_light: Duration,
    /// Min elapsed before a full compaction follows a full one
    pub compact_throttle_full_after_full: Duration,
    pub compact_throttle_bound_fg: Duration,
    pub compact_throttle_persistent: Duration,
    pub compact_sample_rate: f32,
    pub freeze_sample_rate: f32,
    /// Skip anon-touching compaction below this resident-anon size; 0 disables
    pub full_anon_rss_throttle_kb: u64,
    /// Skip anon-touching compaction when the footprint moved less than this
    /// since the last compaction; 0 disables
    pub full_delta_rss_throttle_kb: u64,
    /// Importance states never compacted
    pub compact_state_exclude: HashSet<ProcState>,
    pub max_cached_processes: usize,
    pub empty_app_percent: u32,
    pub trim_empty_percent: u32,
    pub trim_cache_percent: u32,
    /// Grace period between a process entering the freezable band and the
    /// freeze actually happening
    pub freeze_debounce: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        let mut compact_state_exclude = HashSet::new();
        compact_state_exclude.insert(ProcState::Receiver);
        Self {
            use_compaction: false,
            use_freezer: false,
            compact_action_light: CompactAction::File,
            compact_action_full: CompactAction::All,
            compact_throttle_light_after_light: Duration::from_millis(
                DEFAULT_COMPACT_THROTTLE_1_MS,
            ),
            compact_throttle_light_after_full: Duration::from_millis(DEFAULT_COMPACT_THROTTLE_2_MS),
            compact_throttle_full_after_light: Duration::from_millis(DEFAULT_COMPACT_THROTTLE_3_MS),
            compact_throttle_full_after_full: Duration::from_millis(DEFAULT_COMPACT_THROTTLE_4_MS),
            compact_throttle_bound_fg: Duration::from_millis(DEFAULT_COMPACT_THROTTLE_5_MS),
            compact_throttle_persistent: Duration::from_millis(DEFAULT_COMPACT_THROTTLE_6_MS),
            compact_sample_rate: DEFAULT_SAMPLE_RATE,
            freeze_sample_rate: DEFAULT_SAMPLE_RATE,
            full_anon_rss_throttle_kb: DEFAULT_FULL_RSS_THROTTLE_KB,
            full_delta_rss_throttle_kb: DEFAULT_FULL_DELTA_RSS_THROTTLE_KB,
            compact_state_exclude,
            max_cached_processes: DEFAULT_MAX_CACHED_PROCESSES,
            empty_app_percent: DEFAULT_EMPTY_APP_PERCENT,
            trim_empty_percent: DEFAULT_TRIM_PERCENT,
            trim_cache_percent: DEFAULT_TRIM_PERCENT,
            freeze_debounce: Duration::from_millis(DEFAULT_FREEZE_DEBOUNCE_MS),
        }
    }
}

fn parse_or_default<T: FromStr + Copy>(src: &dyn TunableSource, key: &str, default: T) -> T {
    match src.get(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Tunable {}={:?} unparsable, using default", key, raw);
                default
            }
        },
    }
}

fn parse_millis(src: &dyn TunableSource, key: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_or_default(src, key, default.as_millis() as u64))
}

fn parse_rate(src: &dyn TunableSource, key: &str, default: f32) -> f32 {
    parse_or_default(src, key, default).clamp(0.0, 1.0)
}

fn parse_state_list(src: &dyn TunableSource, key: &str, default: &HashSet<ProcState>) -> HashSet<ProcState> {
    let Some(raw) = src.get(key) else {
        return default.clone();
    };
    let mut states = HashSet::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let parsed = part.parse::<i32>().ok().and_then(ProcState::from_code);
        match parsed {
            Some(state) => {
                states.insert(state);
            }
            None => {
                warn!("Tunable {} entry {:?} unparsable, using default list", key, part);
                return default.clone();
            }
        }
    }
    states
}

impl Tunables {
    /// Build a fresh snapshot from a source, falling back per key
    #[must_use]
    pub fn from_source(src: &dyn TunableSource) -> Self {
        let defaults = Self::default();
        Self {
            use_compaction: parse_or_default(src, KEY_USE_COMPACTION, defaults.use_compaction),
            use_freezer: parse_or_default(src, KEY_USE_FREEZER, defaults.use_freezer),
            compact_action_light: CompactAction::from_flag(parse_or_default(
                src,
                KEY_COMPACT_ACTION_LIGHT,
                1,
            )),
            compact_action_full: CompactAction::from_flag(parse_or_default(
                src,
                KEY_COMPACT_ACTION_FULL,
                3,
            )),
            compact_throttle_light_after_light: parse_millis(
                src,
                KEY_COMPACT_THROTTLE_1,
                defaults.compact_throttle_light_after_light,
            ),
            compact_throttle_light_after_full: parse_millis(
                src,
                KEY_COMPACT_THROTTLE_2,
                defaults.compact_throttle_light_after_full,
            ),
            compact_throttle_full_after_light: parse_millis(
                src,
                KEY_COMPACT_THROTTLE_3,
                defaults.compact_throttle_full_after_light,
            ),
            compact_throttle_full_after_full: parse_millis(
                src,
                KEY_COMPACT_THROTTLE_4,
                defaults.compact_throttle_full_after_full,
            ),
            compact_throttle_bound_fg: parse_millis(
                src,
                KEY_COMPACT_THROTTLE_5,
                defaults.compact_throttle_bound_fg,
            ),
            compact_throttle_persistent: parse_millis(
                src,
                KEY_COMPACT_THROTTLE_6,
                defaults.compact_throttle_persistent,
            ),
            compact_sample_rate: parse_rate(src, KEY_COMPACT_SAMPLE_RATE, defaults.compact_sample_rate),
            freeze_sample_rate: parse_rate(src, KEY_FREEZE_SAMPLE_RATE, defaults.freeze_sample_rate),
            full_anon_rss_throttle_kb: parse_or_default(
                src,
                KEY_COMPACT_FULL_RSS_THROTTLE_KB,
                defaults.full_anon_rss_throttle_kb,
            ),
            full_delta_rss_throttle_kb: parse_or_default(
                src,
                KEY_COMPACT_FULL_DELTA_RSS_THROTTLE_KB,
                defaults.full_delta_rss_throttle_kb,
            ),
            compact_state_exclude: parse_state_list(
                src,
                KEY_COMPACT_STATE_EXCLUDE,
                &defaults.compact_state_exclude,
            ),
            max_cached_processes: parse_or_default(
                src,
                KEY_MAX_CACHED_PROCESSES,
                defaults.max_cached_processes,
            ),
            empty_app_percent: parse_or_default(
                src,
                KEY_EMPTY_APP_PERCENT,
                defaults.empty_app_percent,
            ),
            trim_empty_percent: parse_or_default(
                src,
                KEY_TRIM_EMPTY_PERCENT,
                defaults.trim_empty_percent,
            ),
            trim_cache_percent: parse_or_default(
                src,
                KEY_TRIM_CACHE_PERCENT,
                defaults.trim_cache_percent,
            ),
            freeze_debounce: parse_millis(src, KEY_FREEZE_DEBOUNCE_MS, defaults.freeze_debounce),
        }
    }

    /// Throttle for a (previous tier, requested tier) combination; used by
    /// the compactor worker
    #[must_use]
    pub fn compact_throttle(
        &self,
        previous: Option<crate::compactor::types::CompactTier>,
        requested: crate::compactor::types::CompactTier,
    ) -> Duration {
        use crate::compactor::types::CompactTier::*;
        match (requested, previous) {
            (Light, Some(Light)) => self.compact_throttle_light_after_light,
            (Light, _) => self.compact_throttle_light_after_full,
            (Full, Some(Light)) => self.compact_throttle_full_after_light,
            (Full, _) => self.compact_throttle_full_after_full,
            (Persistent, _) => self.compact_throttle_persistent,
            (BoundFg, _) => self.compact_throttle_bound_fg,
        }
    }
}

/// Handle shared between the control plane and the workers
pub type SharedTunables = Arc<RwLock<Tunables>>;

#[must_use]
pub fn shared(tunables: Tunables) -> SharedTunables {
    Arc::new(RwLock::new(tunables))
}
