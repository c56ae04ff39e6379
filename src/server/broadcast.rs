//! broadcast.rs
//! Drains the sample queue and fans each sample out to streaming clients,
//! filtered to each client's own mask.
//!
//! Runs on its own thread, independent of the dispatch loop. Lines are built
//! under the session-table lock, but the writes happen after it is released,
//! so a stalled socket never holds up command handling. A client whose socket
//! fails or stays blocked past the send timeout is treated exactly like a
//! client that sent `disconnect`.

use std::{
    io::{self, Write},
    net::TcpStream,
    os::fd::AsRawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::sensor::{packet::Sample, queue::SampleQueue};
use crate::server::session::{ClientId, ServerState, SharedState};
use crate::utils::{metrics::RelayMetrics, poll};

/// One line due to one client.
pub struct Outgoing {
    pub id: ClientId,
    pub stream: Arc<TcpStream>,
    pub line: Vec<u8>,
}

pub(crate) fn spawn_broadcast(
    state: SharedState,
    queue: Arc<SampleQueue>,
    running: Arc<AtomicBool>,
    wait: Duration,
    send_timeout: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("broadcast".into()).spawn(move || {
        info!("[Broadcast] loop started");
        let metrics = state.lock().metrics.clone();
        while running.load(Ordering::Acquire) {
            let Some(sample) = queue.pop_timeout(wait) else {
                continue;
            };
            broadcast(&state, &sample, send_timeout, &metrics);
        }
        info!("[Broadcast] loop exiting");
    })
}

/// Writes the whole line on a non-blocking socket, waiting for writability
/// for at most `timeout` in total.
pub(crate) fn write_line(mut stream: &TcpStream, line: &[u8], timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    let mut written = 0;
    while written < line.len() {
        match stream.write(&line[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || !poll::wait_writable(stream.as_raw_fd(), remaining)? {
                    return Err(io::ErrorKind::TimedOut.into());
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Sends `sample` to every interested client, then drops the clients whose
/// write failed.
pub(crate) fn broadcast(state: &SharedState, sample: &Sample, send_timeout: Duration, metrics: &RelayMetrics) {
    let outgoing = state.lock().outgoing(sample);

    let failed: Vec<ClientId> = outgoing
        .into_iter()
        .filter_map(|out| match write_line(&out.stream, &out.line, send_timeout) {
            Ok(()) => {
                metrics.record_line_sent();
                None
            }
            Err(e) => {
                warn!("[Broadcast] client {} write failed: {}", out.id, e);
                metrics.record_send_failure();
                Some(out.id)
            }
        })
        .collect();

    if failed.is_empty() {
        return;
    }
    let mut state = state.lock();
    for id in failed {
        debug!("[Broadcast] dropping client {}", id);
        state.remove_client(id);
    }
}

impl ServerState {
    /// Lines for `sample`, one per streaming session whose mask selects at
    /// least one of its channels.
    pub fn outgoing(&self, sample: &Sample) -> Vec<Outgoing> {
        self.sessions
            .iter()
            .filter(|(_, session)| session.streaming)
            .filter_map(|(id, session)| {
                let line = sample.select(session.mask).to_json_line()?;
                Some(Outgoing {
                    id: *id,
                    stream: session.stream.clone(),
                    line,
                })
            })
            .collect()
    }
}
