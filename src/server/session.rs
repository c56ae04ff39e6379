//! session.rs
//! Per-connection state and the table that owns it.
//!
//! The whole table, together with the sensor buffer it arbitrates, sits behind
//! one `parking_lot::Mutex`. Each event locks once and runs to completion on
//! `&mut ServerState`, so removal -> arbitration -> `stop()` never re-enters
//! the lock.

use std::{
    collections::HashMap,
    io::{self, Read},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::Arc,
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::sensor::{buffer::SensorBuffer, channel::ChannelMask};
use crate::server::command::Command;
use crate::utils::metrics::SharedMetrics;

const RECV_CHUNK: usize = 1024;

/// Longest partial line a client may leave unterminated.
pub const MAX_PENDING_LINE: usize = 64 * 1024;

pub type ClientId = u64;
pub type SharedState = Arc<Mutex<ServerState>>;

/// Reassembles newline-delimited lines across reads.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Appends `bytes` and returns every completed line, without the newline.
    /// A trailing partial line stays buffered; once it exceeds
    /// `MAX_PENDING_LINE` the buffer is cleared and `InvalidData` returned.
    pub fn extend(&mut self, bytes: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|&b| b == b'\n') {
            lines.push(self.pending[start..start + pos].to_vec());
            start += pos + 1;
        }
        self.pending.drain(..start);
        if self.pending.len() > MAX_PENDING_LINE {
            self.pending.clear();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line longer than {} bytes", MAX_PENDING_LINE),
            ));
        }
        Ok(lines)
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

#[derive(Debug)]
pub struct ClientSession {
    /// Shared with the broadcast loop, which writes without the table lock.
    pub stream: Arc<TcpStream>,
    pub peer: SocketAddr,
    pub mask: ChannelMask,
    pub streaming: bool,
    pub recv: LineBuffer,
}

impl ClientSession {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Arc::new(stream),
            peer,
            mask: ChannelMask::NONE,
            streaming: false,
            recv: LineBuffer::default(),
        }
    }
}

pub struct ServerState {
    pub(crate) sessions: HashMap<ClientId, ClientSession>,
    pub(crate) buffer: SensorBuffer,
    pub(crate) metrics: SharedMetrics,
    next_id: ClientId,
}

impl ServerState {
    pub fn new(buffer: SensorBuffer, metrics: SharedMetrics) -> Self {
        Self {
            sessions: HashMap::new(),
            buffer,
            metrics,
            next_id: 1,
        }
    }

    pub fn client_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn buffer(&self) -> &SensorBuffer {
        &self.buffer
    }

    pub fn session(&self, id: ClientId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    /// Registers an accepted connection and re-arbitrates.
    pub fn add_client(&mut self, stream: TcpStream, peer: SocketAddr) -> ClientId {
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.insert(id, ClientSession::new(stream, peer));
        info!("[Server] client {} connected from {} ({} active)", id, peer, self.sessions.len());
        self.arbitrate();
        id
    }

    /// Drops the session, shutting its socket down even if the broadcast loop
    /// still holds a handle, then re-arbitrates: losing a client can shrink the
    /// union mask or end streaming altogether. Unknown ids are ignored.
    pub fn remove_client(&mut self, id: ClientId) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        let _ = session.stream.shutdown(Shutdown::Both);
        info!(
            "[Server] client {} ({}) removed, {} active",
            id,
            session.peer,
            self.sessions.len()
        );
        self.arbitrate();
    }

    /// Handles one readiness event on a client socket: a single bounded read,
    /// line reassembly, then each complete command in order.
    pub fn handle_readable(&mut self, id: ClientId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };

        let mut chunk = [0u8; RECV_CHUNK];
        let extended = match (&*session.stream).read(&mut chunk) {
            Ok(0) => {
                debug!("[Server] client {} closed the connection", id);
                self.remove_client(id);
                return;
            }
            Ok(n) => session.recv.extend(&chunk[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                return;
            }
            Err(e) => Err(e),
        };
        let lines = match extended {
            Ok(lines) => lines,
            Err(e) => {
                warn!("[Server] client {} dropped: {}", id, e);
                self.remove_client(id);
                return;
            }
        };

        for line in lines {
            match Command::parse(&line) {
                Some(cmd) => {
                    if !self.apply_command(id, cmd) {
                        break;
                    }
                }
                None => {
                    debug!("[Server] client {} sent an unrecognized line", id);
                    self.metrics.record_ignored_command();
                }
            }
        }
    }

    /// Closes every session without re-arbitrating; used at shutdown.
    pub(crate) fn close_all(&mut self) {
        let closed = self.sessions.len();
        self.sessions.clear();
        if closed > 0 {
            info!("[Server] closed {} client connection(s)", closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_reads_are_reassembled() {
        let mut buf = LineBuffer::default();
        assert!(buf.extend(b"{\"action\":\"sta").unwrap().is_empty());
        assert_eq!(buf.pending(), b"{\"action\":\"sta");

        let lines = buf.extend(b"rt_send\"}\n{\"act").unwrap();
        assert_eq!(lines, vec![b"{\"action\":\"start_send\"}".to_vec()]);
        assert_eq!(buf.pending(), b"{\"act");
    }

    #[test]
    fn several_lines_in_one_read() {
        let mut buf = LineBuffer::default();
        let lines = buf.extend(b"a\n\nb\nc").unwrap();
        assert_eq!(lines, vec![b"a".to_vec(), b"".to_vec(), b"b".to_vec()]);
        assert_eq!(buf.pending(), b"c");
        assert_eq!(buf.extend(b"\n").unwrap(), vec![b"c".to_vec()]);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn unterminated_line_past_the_cap_is_rejected() {
        let mut buf = LineBuffer::default();
        let chunk = vec![b'x'; RECV_CHUNK];
        for _ in 0..MAX_PENDING_LINE / RECV_CHUNK {
            assert!(buf.extend(&chunk).unwrap().is_empty());
        }
        assert_eq!(buf.pending().len(), MAX_PENDING_LINE);

        let err = buf.extend(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn completed_lines_do_not_count_toward_the_cap() {
        let mut buf = LineBuffer::default();
        let mut bytes = vec![b'x'; MAX_PENDING_LINE];
        bytes.push(b'\n');
        bytes.extend_from_slice(b"tail");
        let lines = buf.extend(&bytes).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(buf.pending(), b"tail");
    }
}
