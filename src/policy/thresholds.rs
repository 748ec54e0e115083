/*!
 * Free-Memory Thresholds
 *
 * Derives the per-band minimum-free-memory table pushed to the reclaim
 * daemon. Levels are interpolated between a low-end and a high-end
 * calibration along two independent axes (available RAM and display
 * resolution), taking the larger of the two factors.
 */

use crate::core::limits::{MAX_DAEMON_BUCKETS, PAGE_SIZE_BYTES};
use crate::core::types::OomScore;
use crate::policy::bands::{
    CACHED_LMK_FIRST_SCORE, CACHED_MIN_SCORE, FOREGROUND_SCORE, PERCEPTIBLE_LOW_SCORE,
    PERCEPTIBLE_SCORE, VISIBLE_SCORE,
};
use serde::Serialize;

/// The scores the daemon is given thresholds for. It only supports six
/// slots, so not every band gets its own level.
const BUCKET_SCORES: [OomScore; MAX_DAEMON_BUCKETS] = [
    FOREGROUND_SCORE,
    VISIBLE_SCORE,
    PERCEPTIBLE_SCORE,
    PERCEPTIBLE_LOW_SCORE,
    CACHED_MIN_SCORE,
    CACHED_LMK_FIRST_SCORE,
];

/// Low-end calibration, in KiB: a small display and under 512 MB of RAM
const MIN_FREE_LOW_KB: [u64; MAX_DAEMON_BUCKETS] = [12288, 18432, 24576, 36864, 43008, 49152];

/// High-end calibration, in KiB: a 1280x800-class display with around 1 GB
const MIN_FREE_HIGH_KB: [u64; MAX_DAEMON_BUCKETS] = [73728, 92160, 110592, 129024, 147456, 184320];

/// RAM axis calibration points, in MB
const MEM_SCALE_LOW_MB: f32 = 350.0;
const MEM_SCALE_HIGH_MB: f32 = 700.0;

/// Display axis calibration points, in pixels
const DISP_SCALE_LOW_PX: f32 = 480.0 * 800.0;
const DISP_SCALE_HIGH_PX: f32 = 1280.0 * 800.0;

/// Inputs for threshold computation. Overrides are applied uniformly across
/// the table: `abs_override_kb` rescales all buckets so the last equals the
/// override; `adjust_kb` adds proportionally.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdParams {
    pub total_mem_mb: u64,
    pub screen_px: u64,
    /// Absolute override for the last bucket, in KiB; negative = none
    pub abs_override_kb: i64,
    /// Additive adjustment relative to the last bucket, in KiB
    pub adjust_kb: i64,
    /// 64-bit hosts carry larger cached buckets
    pub is_64bit: bool,
}

impl ThresholdParams {
    #[must_use]
    pub fn new(total_mem_mb: u64, screen_px: u64) -> Self {
        Self {
            total_mem_mb,
            screen_px,
            abs_override_kb: -1,
            adjust_kb: 0,
            is_64bit: cfg!(target_pointer_width = "64"),
        }
    }
}

/// The derived table: one (score, min-free KiB) pair per daemon bucket,
/// monotonically increasing in both fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThresholdTable {
    buckets: [(OomScore, u64); MAX_DAEMON_BUCKETS],
    /// Largest footprint, in KiB, at which a cached process may be promoted
    /// back to background under memory duress
    cached_restore_kb: u64,
}

impl ThresholdTable {
    /// Interpolation factor across both axes, clamped into [0, 1]
    #[must_use]
    pub fn scale_factor(total_mem_mb: u64, screen_px: u64) -> f32 {
        let scale_mem =
            (total_mem_mb as f32 - MEM_SCALE_LOW_MB) / (MEM_SCALE_HIGH_MB - MEM_SCALE_LOW_MB);
        let scale_disp =
            (screen_px as f32 - DISP_SCALE_LOW_PX) / (DISP_SCALE_HIGH_PX - DISP_SCALE_LOW_PX);
        scale_mem.max(scale_disp).clamp(0.0, 1.0)
    }

    #[must_use]
    pub fn compute(params: ThresholdParams) -> Self {
        let scale = Self::scale_factor(params.total_mem_mb, params.screen_px);

        let mut levels = [0u64; MAX_DAEMON_BUCKETS];
        for i in 0..MAX_DAEMON_BUCKETS {
            let low = MIN_FREE_LOW_KB[i];
            let mut high = MIN_FREE_HIGH_KB[i];
            if params.is_64bit {
                // Cached processes cost more address-space overhead on
                // 64-bit hosts; push their levels up.
                if i == 4 {
                    high = high * 3 / 2;
                } else if i == 5 {
                    high = high * 7 / 4;
                }
            }
            levels[i] = low + ((high - low) as f32 * scale) as u64;
        }

        let last = levels[MAX_DAEMON_BUCKETS - 1];
        if params.abs_override_kb >= 0 {
            for level in &mut levels {
                *level = (params.abs_override_kb as f32 * *level as f32 / last as f32) as u64;
            }
        }

        if params.adjust_kb != 0 {
            let last = levels[MAX_DAEMON_BUCKETS - 1];
            for level in &mut levels {
                let adjusted = *level as i64
                    + (params.adjust_kb as f32 * *level as f32 / last as f32) as i64;
                *level = adjusted.max(0) as u64;
            }
        }

        let mut buckets = [(0, 0); MAX_DAEMON_BUCKETS];
        for i in 0..MAX_DAEMON_BUCKETS {
            buckets[i] = (BUCKET_SCORES[i], levels[i]);
        }

        // Restore cached processes only up to a third of the reserve kept
        // ahead of the last kill level.
        let cached_restore_kb = buckets[MAX_DAEMON_BUCKETS - 1].1 / 3;

        Self {
            buckets,
            cached_restore_kb,
        }
    }

    /// Min-free level, in KiB, applying to a given score: the level of the
    /// first bucket at or above it
    #[must_use]
    pub fn min_free_kb(&self, score: OomScore) -> u64 {
        for (bucket_score, level) in self.buckets {
            if score <= bucket_score {
                return level;
            }
        }
        self.buckets[MAX_DAEMON_BUCKETS - 1].1
    }

    #[inline]
    #[must_use]
    pub fn cached_restore_kb(&self) -> u64 {
        self.cached_restore_kb
    }

    #[inline]
    #[must_use]
    pub fn buckets(&self) -> &[(OomScore, u64); MAX_DAEMON_BUCKETS] {
        &self.buckets
    }

    /// The (min-free pages, score) pairs in daemon wire order
    #[must_use]
    pub fn daemon_pairs(&self) -> Vec<(u32, OomScore)> {
        self.buckets
            .iter()
            .map(|&(score, kb)| ((kb * 1024 / PAGE_SIZE_BYTES) as u32, score))
            .collect()
    }
}

/// Extra free memory, in KiB, the kernel should be asked to keep ahead of
/// direct reclaim: enough for three full-screen 32bpp buffers, with the
/// same absolute/additive override scheme as the bucket table.
#[must_use]
pub fn display_reserve_kb(
    width: u32,
    height: u32,
    abs_override_kb: i64,
    adjust_kb: i64,
) -> u64 {
    let mut reserve = u64::from(width) * u64::from(height) * 4 * 3 / 1024;
    if abs_override_kb >= 0 {
        reserve = abs_override_kb as u64;
    }
    if adjust_kb != 0 {
        reserve = (reserve as i64 + adjust_kb).max(0) as u64;
    }
    reserve
}
