/*!
 * Daemon Transport
 * Real sequenced-packet socket transport to the reclaim daemon
 */

use super::connection::{DaemonChannel, DaemonTransport};
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Frames on the daemon socket are small; one bucket table is the largest
const RECV_BUF_BYTES: usize = 64;

/// Connects a SOCK_SEQPACKET unix socket, which preserves the protocol's
/// frame boundaries without explicit length prefixes.
#[derive(Debug, Clone)]
pub struct SeqPacketTransport {
    path: PathBuf,
}

impl SeqPacketTransport {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl DaemonTransport for SeqPacketTransport {
    fn connect(&self) -> io::Result<Box<dyn DaemonChannel>> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::empty(),
            None,
        )
        .map_err(io::Error::from)?;
        let addr = UnixAddr::new(&self.path).map_err(io::Error::from)?;
        connect(fd.as_raw_fd(), &addr).map_err(io::Error::from)?;

        let stream = UnixStream::from(fd);
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(Box::new(SeqPacketChannel {
            stream,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }))
    }
}

struct SeqPacketChannel {
    stream: UnixStream,
    reader: Mutex<UnixStream>,
    writer: Mutex<UnixStream>,
}

impl DaemonChannel for SeqPacketChannel {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.writer.lock().write_all(frame)
    }

    fn recv(&self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = [0u8; RECV_BUF_BYTES];
        let n = self.reader.lock().read(&mut buf)?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(buf[..n].to_vec()))
        }
    }

    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
