/*!
 * Fake Daemon
 *
 * An in-memory reclaim daemon for tests: records every frame per session,
 * answers kill-count queries when scripted to, injects unsolicited kill
 * notifications, and simulates disconnects.
 */

use super::connection::{DaemonChannel, DaemonTransport};
use super::protocol::{frame_opcode, CMD_GET_KILL_COUNT};
use bytes::BufMut;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One accepted connection, as the daemon saw it
pub struct FakeSession {
    received: Mutex<Vec<Vec<u8>>>,
    to_client: Mutex<Option<flume::Sender<Vec<u8>>>>,
    incoming: flume::Receiver<Vec<u8>>,
    closed: AtomicBool,
}

impl FakeSession {
    /// Opcodes of every frame received on this session, in order
    #[must_use]
    pub fn received_opcodes(&self) -> Vec<i32> {
        self.received
            .lock()
            .iter()
            .filter_map(|frame| frame_opcode(frame))
            .collect()
    }

    #[must_use]
    pub fn received_frames(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    fn push_to_client(&self, frame: Vec<u8>) {
        if let Some(tx) = self.to_client.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.to_client.lock().take();
    }
}

#[derive(Default)]
struct FakeDaemonCore {
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    refuse_connects: AtomicBool,
    kill_count_reply: Mutex<Option<u32>>,
}

/// Test-side handle to the fake daemon
#[derive(Clone, Default)]
pub struct FakeDaemon {
    core: Arc<FakeDaemonCore>,
}

impl FakeDaemon {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport to hand to `DaemonConnection::spawn`
    #[must_use]
    pub fn transport(&self) -> FakeTransport {
        FakeTransport {
            core: Arc::clone(&self.core),
        }
    }

    /// Refuse (or stop refusing) new connections
    pub fn refuse_connects(&self, refuse: bool) {
        self.core.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    /// Script the reply to kill-count queries
    pub fn set_kill_count(&self, count: u32) {
        *self.core.kill_count_reply.lock() = Some(count);
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.core.sessions.lock().len()
    }

    #[must_use]
    pub fn session(&self, index: usize) -> Option<Arc<FakeSession>> {
        self.core.sessions.lock().get(index).cloned()
    }

    #[must_use]
    pub fn latest_session(&self) -> Option<Arc<FakeSession>> {
        self.core.sessions.lock().last().cloned()
    }

    /// Send an unsolicited frame to the client on the latest session
    pub fn inject(&self, frame: Vec<u8>) {
        if let Some(session) = self.latest_session() {
            session.push_to_client(frame);
        }
    }

    /// Drop the latest session; the client sees end of stream
    pub fn disconnect(&self) {
        if let Some(session) = self.latest_session() {
            session.close();
        }
    }
}

/// Transport half handed to the connection under test
pub struct FakeTransport {
    core: Arc<FakeDaemonCore>,
}

impl DaemonTransport for FakeTransport {
    fn connect(&self) -> io::Result<Box<dyn DaemonChannel>> {
        if self.core.refuse_connects.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "daemon down",
            ));
        }
        let (to_client_tx, to_client_rx) = flume::unbounded();
        let session = Arc::new(FakeSession {
            received: Mutex::new(Vec::new()),
            to_client: Mutex::new(Some(to_client_tx)),
            incoming: to_client_rx,
            closed: AtomicBool::new(false),
        });
        self.core.sessions.lock().push(Arc::clone(&session));
        Ok(Box::new(FakeChannel {
            session,
            core: Arc::clone(&self.core),
        }))
    }
}

struct FakeChannel {
    session: Arc<FakeSession>,
    core: Arc<FakeDaemonCore>,
}

impl DaemonChannel for FakeChannel {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        if self.session.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
        }
        self.session.received.lock().push(frame.to_vec());
        if frame_opcode(frame) == Some(CMD_GET_KILL_COUNT) {
            if let Some(count) = *self.core.kill_count_reply.lock() {
                let mut reply = bytes::BytesMut::new();
                reply.put_i32_ne(CMD_GET_KILL_COUNT);
                reply.put_i32_ne(count as i32);
                self.session.push_to_client(reply.to_vec());
            }
        }
        Ok(())
    }

    fn recv(&self) -> io::Result<Option<Vec<u8>>> {
        match self.session.incoming.recv() {
            Ok(frame) => Ok(Some(frame)),
            // All senders gone: the daemon side hung up.
            Err(_) => Ok(None),
        }
    }

    fn close(&self) {
        self.session.close();
    }
}
