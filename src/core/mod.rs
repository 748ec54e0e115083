/*!
 * Core Module
 * Shared types, errors, limits, and configuration
 */

pub mod config;
pub mod errors;
pub mod limits;
pub mod types;

pub use config::{JsonFileSource, MapSource, SharedTunables, TunableSource, Tunables};
pub use errors::{LowmemdError, PortError, RegistryError, RegistryResult};
pub use types::{OomScore, Pid, PrincipalId, ProcKey, Seq};
