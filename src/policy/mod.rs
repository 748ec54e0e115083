/*!
 * Priority/Eviction Policy
 * Score bands, importance derivation, memory thresholds, retention budgets
 */

pub mod bands;
pub mod budget;
pub mod thresholds;

pub use bands::{score_tag, Importance, ProcState};
pub use budget::{empty_process_limit, RetentionBudget};
pub use thresholds::{display_reserve_kb, ThresholdParams, ThresholdTable};
