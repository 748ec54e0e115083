/*!
 * Compaction Types
 */

use serde::{Deserialize, Serialize};

/// Requested compaction strength. Tiers are ordered: a later request only
/// replaces a pending one if it is at least as strong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactTier {
    /// Cheap reclaim of file-backed pages for freshly backgrounded work
    Light,
    /// Full reclaim for processes settled into the cached band
    Full,
    /// Periodic reclaim of persistent processes
    Persistent,
    /// Reclaim of bound-foreground-service hosts
    BoundFg,
}

impl CompactTier {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            CompactTier::Light => "light",
            CompactTier::Full => "full",
            CompactTier::Persistent => "persistent",
            CompactTier::BoundFg => "bound-fg",
        }
    }
}

/// The kernel-level reclaim action a tier maps to. Exactly the token written
/// to the per-process reclaim interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactAction {
    None,
    File,
    Anon,
    All,
}

impl CompactAction {
    /// ASCII token understood by the kernel reclaim interface
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            CompactAction::None => "",
            CompactAction::File => "file",
            CompactAction::Anon => "anon",
            CompactAction::All => "all",
        }
    }

    /// Map a configuration flag value to an action; unknown values mean none
    #[must_use]
    pub fn from_flag(flag: i64) -> Self {
        match flag {
            1 => CompactAction::File,
            2 => CompactAction::Anon,
            3 => CompactAction::All,
            _ => CompactAction::None,
        }
    }

    /// Whether this action touches anonymous memory (and is therefore
    /// subject to the resident-anonymous throttles)
    #[inline]
    #[must_use]
    pub const fn touches_anon(self) -> bool {
        matches!(self, CompactAction::Anon | CompactAction::All)
    }
}
