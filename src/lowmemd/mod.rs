/*!
 * Low-Memory-Daemon Connection
 * Wire protocol and persistent channel to the privileged reclaim daemon
 */

pub mod connection;
pub mod fake;
pub mod protocol;
pub mod transport;

pub use connection::{DaemonChannel, DaemonConnection, DaemonListener, DaemonTransport};
pub use fake::FakeDaemon;
pub use protocol::{Command, Notification};
pub use transport::SeqPacketTransport;
