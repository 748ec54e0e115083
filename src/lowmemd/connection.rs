/*!
 * Reclaim-Daemon Connection
 *
 * Persistent duplex channel to the privileged reclaim daemon. One dedicated
 * I/O thread owns the socket: it connects, performs the handshake, then
 * sits in the read loop dispatching replies and unsolicited kill
 * notifications. On disconnect it retries forever with a fixed delay; the
 * daemon keeps no state across reconnects, so every successful connect
 * replays PURGE, the installed bucket table, and the kill subscription.
 */

use super::protocol::{
    decode_kill_count_reply, decode_notification, frame_opcode, Command, Notification,
    ASYNC_EVENT_KILL,
};
use crate::core::errors::LowmemdError;
use crate::core::limits::{DAEMON_EXCHANGE_RETRY_CYCLES, DAEMON_RECONNECT_DELAY};
use crate::core::types::{OomScore, Pid, PrincipalId};
use crate::policy::bands::UNKNOWN_SCORE;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Dials the daemon. Injected so tests can run a scripted in-memory daemon.
pub trait DaemonTransport: Send + Sync + 'static {
    fn connect(&self) -> io::Result<Box<dyn DaemonChannel>>;
}

impl DaemonTransport for Box<dyn DaemonTransport> {
    fn connect(&self) -> io::Result<Box<dyn DaemonChannel>> {
        (**self).connect()
    }
}

/// One established packet channel. `recv` blocks; `close` must unblock it.
pub trait DaemonChannel: Send + Sync {
    fn send(&self, frame: &[u8]) -> io::Result<()>;
    /// Blocking read of one frame; `Ok(None)` is a clean end of stream
    fn recv(&self) -> io::Result<Option<Vec<u8>>>;
    fn close(&self);
}

/// Receiver of daemon-initiated kill notifications
pub trait DaemonListener: Send + Sync + 'static {
    fn on_daemon_kill(&self, pid: Pid, principal: PrincipalId);
}

#[derive(Default)]
struct ConnState {
    connected: bool,
    /// Set on first use; the I/O thread stays idle until then
    wanted: bool,
    channel: Option<Arc<dyn DaemonChannel>>,
}

#[derive(Default)]
struct ReplySlot {
    expected: Option<i32>,
    frame: Option<Vec<u8>>,
}

struct Shared {
    transport: Box<dyn DaemonTransport>,
    listener: Arc<dyn DaemonListener>,
    state: Mutex<ConnState>,
    state_cv: Condvar,
    reply: Mutex<ReplySlot>,
    reply_cv: Condvar,
    /// The last installed bucket table, replayed after every reconnect
    installed_table: Mutex<Option<Vec<(u32, OomScore)>>>,
    /// Serializes request/reply exchanges
    exchange_serial: Mutex<()>,
    shutdown: AtomicBool,
    reconnects: AtomicU32,
}

/// Handle to the daemon connection. Cheap to clone via `Arc` inside.
pub struct DaemonConnection {
    shared: Arc<Shared>,
    io_thread: Option<JoinHandle<()>>,
}

impl DaemonConnection {
    pub fn spawn(
        transport: impl DaemonTransport,
        listener: Arc<dyn DaemonListener>,
    ) -> Self {
        let shared = Arc::new(Shared {
            transport: Box::new(transport),
            listener,
            state: Mutex::new(ConnState::default()),
            state_cv: Condvar::new(),
            reply: Mutex::new(ReplySlot::default()),
            reply_cv: Condvar::new(),
            installed_table: Mutex::new(None),
            exchange_serial: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            reconnects: AtomicU32::new(0),
        });
        let io_shared = Arc::clone(&shared);
        let io_thread = std::thread::Builder::new()
            .name("lowmemd-io".into())
            .spawn(move || io_loop(&io_shared))
            .expect("spawn lowmemd I/O thread");
        Self {
            shared,
            io_thread: Some(io_thread),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    /// Successful connects so far
    #[must_use]
    pub fn reconnect_count(&self) -> u32 {
        self.shared.reconnects.load(Ordering::Relaxed)
    }

    /// Push one process's priority. No-op for unstarted processes and
    /// uncomputed scores; failures degrade to best effort.
    pub fn set_score(&self, pid: Pid, principal: PrincipalId, score: OomScore) {
        if pid <= 0 || score == UNKNOWN_SCORE {
            return;
        }
        let started = Instant::now();
        self.send_best_effort(Command::ProcPriority {
            pid,
            principal,
            score,
        });
        let elapsed = started.elapsed();
        if elapsed > Duration::from_millis(250) {
            warn!("Slow daemon priority push: {:?} for pid {}", elapsed, pid);
        }
    }

    /// Tell the daemon to stop tracking a pid. No-op when never started.
    pub fn remove_pid(&self, pid: Pid) {
        if pid <= 0 {
            return;
        }
        self.send_best_effort(Command::ProcRemove(pid));
    }

    /// Install the bucket table now and after every future reconnect
    pub fn install_thresholds(&self, pairs: Vec<(u32, OomScore)>) {
        *self.shared.installed_table.lock() = Some(pairs.clone());
        self.send_best_effort(Command::Target(pairs));
    }

    /// How many kills the daemon performed in a score range
    pub fn kill_count(&self, min_score: OomScore, max_score: OomScore) -> Result<u32, LowmemdError> {
        let reply = self.exchange(Command::GetKillCount {
            min_score,
            max_score,
        })?;
        let frame = reply.ok_or(LowmemdError::Unavailable)?;
        decode_kill_count_reply(&frame)
    }

    fn send_best_effort(&self, cmd: Command) {
        if let Err(err) = self.exchange(cmd) {
            debug!("Daemon write degraded to no-op: {}", err);
        }
    }

    /// Send one command, waiting for a reply when the command expects one.
    ///
    /// A disconnected channel triggers a connection attempt and blocks the
    /// caller up to a bounded number of reconnect cycles; past that the
    /// request fails soft and the caller proceeds without daemon-side state
    /// having changed.
    fn exchange(&self, cmd: Command) -> Result<Option<Vec<u8>>, LowmemdError> {
        let shared = &self.shared;
        let _serial = shared.exchange_serial.lock();
        let deadline =
            Instant::now() + DAEMON_RECONNECT_DELAY * DAEMON_EXCHANGE_RETRY_CYCLES;

        let channel = {
            let mut state = shared.state.lock();
            if !state.wanted {
                state.wanted = true;
                shared.state_cv.notify_all();
            }
            while !state.connected {
                if shared.state_cv.wait_until(&mut state, deadline).timed_out() {
                    return Err(LowmemdError::Unavailable);
                }
            }
            state.channel.clone().ok_or(LowmemdError::Unavailable)?
        };

        let expected = cmd.reply_opcode();
        if let Some(opcode) = expected {
            let mut slot = shared.reply.lock();
            slot.expected = Some(opcode);
            slot.frame = None;
        }

        channel.send(&cmd.encode())?;

        let Some(opcode) = expected else {
            return Ok(None);
        };
        let mut slot = shared.reply.lock();
        while slot.frame.is_none() {
            if shared.reply_cv.wait_until(&mut slot, deadline).timed_out() {
                slot.expected = None;
                return Err(LowmemdError::Unavailable);
            }
        }
        slot.expected = None;
        let frame = slot.frame.take().ok_or(LowmemdError::Unavailable)?;
        match frame_opcode(&frame) {
            Some(got) if got == opcode => Ok(Some(frame)),
            Some(got) => Err(LowmemdError::ReplyMismatch {
                expected: opcode,
                got,
            }),
            None => Err(LowmemdError::ShortFrame(frame.len())),
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        {
            let mut state = self.shared.state.lock();
            state.wanted = true;
            if let Some(channel) = state.channel.take() {
                channel.close();
            }
            self.shared.state_cv.notify_all();
        }
        if let Some(handle) = self.io_thread.take() {
            if handle.join().is_err() {
                warn!("Daemon I/O thread panicked during shutdown");
            }
        }
    }
}

impl Drop for DaemonConnection {
    fn drop(&mut self) {
        if self.io_thread.is_some() {
            self.stop();
        }
    }
}

fn io_loop(shared: &Shared) {
    // Stay idle until something actually wants the daemon.
    {
        let mut state = shared.state.lock();
        while !state.wanted && !shared.shutdown.load(Ordering::SeqCst) {
            shared.state_cv.wait(&mut state);
        }
    }

    while !shared.shutdown.load(Ordering::SeqCst) {
        match shared.transport.connect() {
            Ok(channel) => {
                let channel: Arc<dyn DaemonChannel> = Arc::from(channel);
                if let Err(err) = handshake(shared, &channel) {
                    warn!("Daemon handshake failed: {}", err);
                } else {
                    info!("Connection with reclaim daemon established");
                    shared.reconnects.fetch_add(1, Ordering::Relaxed);
                    {
                        let mut state = shared.state.lock();
                        state.connected = true;
                        state.channel = Some(Arc::clone(&channel));
                        shared.state_cv.notify_all();
                    }
                    read_loop(shared, &channel);
                    warn!("Lost connection to reclaim daemon");
                    let mut state = shared.state.lock();
                    state.connected = false;
                    state.channel = None;
                }
            }
            Err(err) => {
                debug!(
                    "Reclaim daemon connect failed ({}), retrying in {:?}",
                    err, DAEMON_RECONNECT_DELAY
                );
            }
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(DAEMON_RECONNECT_DELAY);
    }
}

/// The daemon forgets everything across a reconnect: purge stale pids,
/// replay the bucket table if one was ever installed, re-subscribe.
fn handshake(shared: &Shared, channel: &Arc<dyn DaemonChannel>) -> io::Result<()> {
    channel.send(&Command::ProcPurge.encode())?;
    if let Some(pairs) = shared.installed_table.lock().clone() {
        channel.send(&Command::Target(pairs).encode())?;
    }
    channel.send(&Command::Subscribe(ASYNC_EVENT_KILL).encode())
}

fn read_loop(shared: &Shared, channel: &Arc<dyn DaemonChannel>) {
    loop {
        match channel.recv() {
            Ok(Some(frame)) => dispatch(shared, &frame),
            Ok(None) => return,
            Err(err) => {
                if !shared.shutdown.load(Ordering::SeqCst) {
                    debug!("Daemon read failed: {}", err);
                }
                return;
            }
        }
    }
}

fn dispatch(shared: &Shared, frame: &[u8]) {
    let opcode = match frame_opcode(frame) {
        Some(opcode) => opcode,
        None => {
            warn!("Dropping short daemon frame ({} bytes)", frame.len());
            return;
        }
    };

    {
        let mut slot = shared.reply.lock();
        if slot.expected == Some(opcode) {
            slot.frame = Some(frame.to_vec());
            shared.reply_cv.notify_all();
            return;
        }
    }

    match decode_notification(frame) {
        Some(Notification::ProcKilled { pid, principal }) => {
            debug!("Daemon killed pid {} (principal {})", pid, principal);
            shared.listener.on_daemon_kill(pid, principal);
        }
        None => warn!("Unhandled daemon frame, opcode {}", opcode),
    }
}
