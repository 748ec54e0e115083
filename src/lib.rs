/*!
 * procwarden
 *
 * Lifecycle management for a large population of worker processes on one
 * memory-constrained host: importance scoring, LRU eviction ordering, a
 * binary channel to the privileged reclaim daemon, and background memory
 * compaction and process freezing.
 */

pub mod compactor;
pub mod core;
pub mod freezer;
pub mod lowmemd;
pub mod metrics;
pub mod policy;
pub mod ports;
pub mod registry;
pub mod supervisor;

// Re-exports
pub use crate::core::config::{JsonFileSource, MapSource, Tunables};
pub use crate::core::errors::{LowmemdError, PortError, RegistryError};
pub use crate::core::types::{OomScore, Pid, PrincipalId, ProcKey};
pub use compactor::{CompactAction, CompactTier, Compactor};
pub use freezer::Freezer;
pub use lowmemd::{DaemonConnection, SeqPacketTransport};
pub use metrics::{LogSink, MetricsEvent, MetricsSink};
pub use policy::{Importance, ProcState, ThresholdParams, ThresholdTable};
pub use registry::{ProcessRecord, Registry};
pub use supervisor::{Supervisor, SupervisorBuilder};
