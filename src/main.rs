/*!
 * procwardend
 * Daemon entry point: wires real ports and runs the supervisor
 */

use anyhow::{Context, Result};
use log::info;
use procwarden::core::config::JsonFileSource;
use procwarden::lowmemd::SeqPacketTransport;
use procwarden::ports::{CgroupFreezePort, ProcfsReclaimPort, SignalKillPort};
use procwarden::Supervisor;
use std::sync::Arc;
use std::time::Duration;

/// Default reclaim-daemon control socket
const DEFAULT_DAEMON_SOCKET: &str = "/dev/socket/lowmemd";

/// Default tunables file, re-read periodically
const DEFAULT_TUNABLES_PATH: &str = "/etc/procwarden/tunables.json";

const TUNABLES_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

fn total_mem_mb() -> Result<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").context("read /proc/meminfo")?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .context("parse MemTotal")?;
            return Ok(kb / 1024);
        }
    }
    anyhow::bail!("MemTotal not present in /proc/meminfo");
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let socket_path =
        std::env::var("PROCWARDEN_DAEMON_SOCKET").unwrap_or_else(|_| DEFAULT_DAEMON_SOCKET.into());
    let tunables_path =
        std::env::var("PROCWARDEN_TUNABLES").unwrap_or_else(|_| DEFAULT_TUNABLES_PATH.into());
    let total_mem_mb = total_mem_mb()?;

    info!(
        "procwardend starting: {} MB RAM, daemon socket {}, tunables {}",
        total_mem_mb, socket_path, tunables_path
    );

    let supervisor = Supervisor::builder()
        .with_total_mem_mb(total_mem_mb)
        .with_tunable_source(JsonFileSource::new(&tunables_path))
        .with_transport(SeqPacketTransport::new(&socket_path))
        .with_reclaim_port(Arc::new(ProcfsReclaimPort::new()))
        .with_freeze_port(Arc::new(CgroupFreezePort::new()))
        .with_kill_port(Arc::new(SignalKillPort))
        .build();

    supervisor.enable_freezer(true);

    // The control plane is driven entirely by its callers; this thread only
    // keeps the tunables fresh until the service is torn down.
    loop {
        std::thread::sleep(TUNABLES_REFRESH_INTERVAL);
        supervisor.refresh_tunables();
    }
}
