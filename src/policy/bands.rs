/*!
 * Score Bands
 * The fixed ordinal eviction-priority scale and its derived classifications
 */

use crate::core::types::OomScore;
use serde::{Deserialize, Serialize};

/// Uninitialized score marker
pub const INVALID_SCORE: OomScore = -10000;

/// Score for a process whose placement has not been computed yet; never
/// pushed to the reclaim daemon
pub const UNKNOWN_SCORE: OomScore = 1001;

/// Upper bound of the cached band
pub const CACHED_MAX_SCORE: OomScore = 999;

/// Lower bound of the cached band
pub const CACHED_MIN_SCORE: OomScore = 900;

/// First cached level the daemon should prefer to kill from
pub const CACHED_LMK_FIRST_SCORE: OomScore = 950;

/// Number of discrete levels the cached band is split into
pub const CACHED_BAND_LEVELS: OomScore = 5;

/// Old, decrepit service hosts demoted out of the main service band
pub const SERVICE_B_SCORE: OomScore = 800;

/// The process the user was previously interacting with
pub const PREVIOUS_SCORE: OomScore = 700;

/// The launcher-equivalent home process
pub const HOME_SCORE: OomScore = 600;

/// Hosts of running background services
pub const SERVICE_SCORE: OomScore = 500;

/// Heavy-weight processes kept out of the cached band for cost reasons
pub const HEAVY_WEIGHT_SCORE: OomScore = 400;

/// Process hosting a backup operation
pub const BACKUP_SCORE: OomScore = 300;

/// Perceptible work of low standing (e.g. demoted media)
pub const PERCEPTIBLE_LOW_SCORE: OomScore = 250;

/// Perceptible but not visible work (e.g. background audio)
pub const PERCEPTIBLE_SCORE: OomScore = 200;

/// Visible but not foreground
pub const VISIBLE_SCORE: OomScore = 100;

/// Recently foreground and still perceptible
pub const PERCEPTIBLE_RECENT_SCORE: OomScore = 50;

/// The foreground process
pub const FOREGROUND_SCORE: OomScore = 0;

/// Services bound by the system that must not be killed casually
pub const PERSISTENT_SERVICE_SCORE: OomScore = -700;

/// Persistent system processes
pub const PERSISTENT_PROC_SCORE: OomScore = -800;

/// The control plane itself and its closest collaborators
pub const SYSTEM_SCORE: OomScore = -900;

/// Native daemons outside warden management
pub const NATIVE_SCORE: OomScore = -1000;

/// Coarse importance classification, ordered most critical first.
///
/// Derived from a score via [`Importance::from_score`]; the mapping is total
/// and monotonic, with out-of-range scores clamping to the nearest band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Native,
    System,
    Persistent,
    PersistentService,
    Foreground,
    PerceptibleRecent,
    Visible,
    Perceptible,
    PerceptibleLow,
    Backup,
    Heavy,
    Service,
    Home,
    Previous,
    ServiceB,
    Cached,
}

impl Importance {
    /// Classify a score into its band. Total over all inputs: scores above
    /// the cached band clamp to `Cached`, scores below the native band clamp
    /// to `Native`.
    #[must_use]
    pub fn from_score(score: OomScore) -> Self {
        if score >= CACHED_MIN_SCORE {
            Importance::Cached
        } else if score >= SERVICE_B_SCORE {
            Importance::ServiceB
        } else if score >= PREVIOUS_SCORE {
            Importance::Previous
        } else if score >= HOME_SCORE {
            Importance::Home
        } else if score >= SERVICE_SCORE {
            Importance::Service
        } else if score >= HEAVY_WEIGHT_SCORE {
            Importance::Heavy
        } else if score >= BACKUP_SCORE {
            Importance::Backup
        } else if score >= PERCEPTIBLE_LOW_SCORE {
            Importance::PerceptibleLow
        } else if score >= PERCEPTIBLE_SCORE {
            Importance::Perceptible
        } else if score >= VISIBLE_SCORE {
            Importance::Visible
        } else if score >= PERCEPTIBLE_RECENT_SCORE {
            Importance::PerceptibleRecent
        } else if score >= FOREGROUND_SCORE {
            Importance::Foreground
        } else if score >= PERSISTENT_SERVICE_SCORE {
            Importance::PersistentService
        } else if score >= PERSISTENT_PROC_SCORE {
            Importance::Persistent
        } else if score >= SYSTEM_SCORE {
            Importance::System
        } else {
            Importance::Native
        }
    }

    /// Whether processes in this band are retained only opportunistically
    #[inline]
    #[must_use]
    pub const fn is_cached(self) -> bool {
        matches!(self, Importance::Cached)
    }
}

/// Coarse process-state ladder reported by the component layer.
///
/// The integer codes are stable and appear in configuration values (the
/// compaction exclusion list) and in metrics payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ProcState {
    Persistent = 0,
    PersistentUi = 1,
    Top = 2,
    BoundTop = 3,
    ForegroundService = 4,
    BoundForegroundService = 5,
    ImportantForeground = 6,
    ImportantBackground = 7,
    TransientBackground = 8,
    Backup = 9,
    Service = 10,
    Receiver = 11,
    TopSleeping = 12,
    Heavy = 13,
    Home = 14,
    LastActivity = 15,
    CachedActivity = 16,
    CachedActivityClient = 17,
    CachedRecent = 18,
    CachedEmpty = 19,
    Nonexistent = 20,
}

impl ProcState {
    /// Stable integer code for configuration and metrics
    #[inline]
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        use ProcState::*;
        Some(match code {
            0 => Persistent,
            1 => PersistentUi,
            2 => Top,
            3 => BoundTop,
            4 => ForegroundService,
            5 => BoundForegroundService,
            6 => ImportantForeground,
            7 => ImportantBackground,
            8 => TransientBackground,
            9 => Backup,
            10 => Service,
            11 => Receiver,
            12 => TopSleeping,
            13 => Heavy,
            14 => Home,
            15 => LastActivity,
            16 => CachedActivity,
            17 => CachedActivityClient,
            18 => CachedRecent,
            19 => CachedEmpty,
            20 => Nonexistent,
            _ => return None,
        })
    }

    /// Whether this state sits in the cached region of the ladder
    #[inline]
    #[must_use]
    pub const fn is_cached(self) -> bool {
        self.code() >= ProcState::CachedActivity.code() && self.code() < ProcState::Nonexistent.code()
    }
}

fn band_tag(prefix: &str, score: OomScore, base: OomScore) -> String {
    let diff = score - base;
    if diff == 0 {
        prefix.to_string()
    } else {
        format!("{}+{}", prefix, diff)
    }
}

/// Compact human-readable tag for a score, for log lines
#[must_use]
pub fn score_tag(score: OomScore) -> String {
    if score >= CACHED_MIN_SCORE {
        band_tag("cch", score, CACHED_MIN_SCORE)
    } else if score >= SERVICE_B_SCORE {
        band_tag("svcb", score, SERVICE_B_SCORE)
    } else if score >= PREVIOUS_SCORE {
        band_tag("prev", score, PREVIOUS_SCORE)
    } else if score >= HOME_SCORE {
        band_tag("home", score, HOME_SCORE)
    } else if score >= SERVICE_SCORE {
        band_tag("svc", score, SERVICE_SCORE)
    } else if score >= HEAVY_WEIGHT_SCORE {
        band_tag("hvy", score, HEAVY_WEIGHT_SCORE)
    } else if score >= BACKUP_SCORE {
        band_tag("bkup", score, BACKUP_SCORE)
    } else if score >= PERCEPTIBLE_LOW_SCORE {
        band_tag("prcl", score, PERCEPTIBLE_LOW_SCORE)
    } else if score >= PERCEPTIBLE_SCORE {
        band_tag("prcp", score, PERCEPTIBLE_SCORE)
    } else if score >= VISIBLE_SCORE {
        band_tag("vis", score, VISIBLE_SCORE)
    } else if score >= PERCEPTIBLE_RECENT_SCORE {
        band_tag("prfg", score, PERCEPTIBLE_RECENT_SCORE)
    } else if score >= FOREGROUND_SCORE {
        band_tag("fg", score, FOREGROUND_SCORE)
    } else if score >= PERSISTENT_SERVICE_SCORE {
        band_tag("psvc", score, PERSISTENT_SERVICE_SCORE)
    } else if score >= PERSISTENT_PROC_SCORE {
        band_tag("pers", score, PERSISTENT_PROC_SCORE)
    } else if score >= SYSTEM_SCORE {
        band_tag("sys", score, SYSTEM_SCORE)
    } else if score >= NATIVE_SCORE {
        band_tag("ntv", score, NATIVE_SCORE)
    } else {
        score.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn importance_band_edges() {
        assert_eq!(Importance::from_score(FOREGROUND_SCORE), Importance::Foreground);
        assert_eq!(Importance::from_score(VISIBLE_SCORE - 1), Importance::PerceptibleRecent);
        assert_eq!(Importance::from_score(CACHED_MIN_SCORE), Importance::Cached);
        assert_eq!(Importance::from_score(CACHED_MAX_SCORE), Importance::Cached);
    }

    #[test]
    fn importance_clamps_out_of_range() {
        assert_eq!(Importance::from_score(UNKNOWN_SCORE), Importance::Cached);
        assert_eq!(Importance::from_score(-5000), Importance::Native);
    }

    #[test]
    fn proc_state_codes_round_trip() {
        for code in 0..=20 {
            let state = ProcState::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }
        assert_eq!(ProcState::from_code(21), None);
        assert_eq!(ProcState::from_code(-1), None);
    }

    #[test]
    fn score_tags() {
        assert_eq!(score_tag(FOREGROUND_SCORE), "fg");
        assert_eq!(score_tag(CACHED_MIN_SCORE + 4), "cch+4");
        assert_eq!(score_tag(VISIBLE_SCORE), "vis");
    }
}
