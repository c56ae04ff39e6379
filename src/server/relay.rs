//! relay.rs
//! TCP front end: listening socket, the single-threaded dispatch loop and the
//! ordered shutdown of all three loops.
//!
//! - **Dispatch loop:** level-triggered `poll(2)` over the listener and every
//!   client socket, bounded at `poll_timeout`. Accepts and reads only; it
//!   never writes to clients.
//! - **Broadcast loop:** separate thread, see `broadcast.rs`. It holds the
//!   session-table lock only to collect lines, never while writing.
//! - **Reader:** owned by `SensorBuffer`, started/stopped by the arbiter.

use std::{
    io,
    net::{SocketAddr, TcpListener, ToSocketAddrs},
    os::fd::AsRawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{error, info, warn};
use parking_lot::Mutex;
use socket2::{Domain, SockAddr, Socket, Type};

use crate::sensor::{buffer::SensorBuffer, channel::ChannelMask};
use crate::server::{
    broadcast::spawn_broadcast,
    session::{ClientId, ServerState, SharedState},
};
use crate::utils::{
    config::ServerConfig,
    error::{RelayError, Result},
    metrics::SharedMetrics,
    poll::PollSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Listener,
    Client(ClientId),
}

/// Cloneable control and inspection handle for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    running: Arc<AtomicBool>,
    state: SharedState,
    metrics: SharedMetrics,
}

impl ServerHandle {
    /// Requests shutdown; every loop observes it within its bounded wait.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().client_count()
    }

    /// Channel set currently applied to the hardware.
    pub fn applied_mask(&self) -> Option<ChannelMask> {
        self.state.lock().buffer().applied_mask()
    }

    pub fn reader_running(&self) -> bool {
        self.state.lock().buffer().is_running()
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }
}

pub struct SensorServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: SharedState,
    running: Arc<AtomicBool>,
    config: ServerConfig,
    metrics: SharedMetrics,
}

impl SensorServer {
    /// Binds the listening socket. Failure here is fatal for the process.
    pub fn bind(buffer: SensorBuffer, config: ServerConfig, metrics: SharedMetrics) -> Result<Self> {
        let addr = config
            .listen_addr()
            .to_socket_addrs()
            .map_err(|_| RelayError::InvalidAddress(config.listen_addr()))?
            .next()
            .ok_or_else(|| RelayError::InvalidAddress(config.listen_addr()))?;

        let listener = bind_listener(addr, config.backlog).map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("[Server] listening on {} (max {} clients)", local_addr, config.max_clients);

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(Mutex::new(ServerState::new(buffer, metrics.clone()))),
            running: Arc::new(AtomicBool::new(true)),
            config,
            metrics,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            running: self.running.clone(),
            state: self.state.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Runs the dispatch loop until `ServerHandle::shutdown`, then tears down
    /// in order: broadcast loop, reader thread, client sockets, listener.
    pub fn run(self) -> Result<()> {
        let queue = self.state.lock().buffer().queue();
        let broadcast = spawn_broadcast(
            self.state.clone(),
            queue,
            self.running.clone(),
            self.config.broadcast_wait,
            self.config.send_timeout,
        )?;

        info!("[Server] dispatch loop started");
        let mut poll_set = PollSet::new();
        let mut outcome = Ok(());
        while self.running.load(Ordering::Acquire) {
            poll_set.clear();
            poll_set.register(self.listener.as_raw_fd(), Token::Listener);
            {
                let state = self.state.lock();
                for (id, session) in &state.sessions {
                    poll_set.register(session.stream.as_raw_fd(), Token::Client(*id));
                }
            }

            let ready = match poll_set.wait(self.config.poll_timeout) {
                Ok(ready) => ready,
                Err(e) => {
                    error!("[Server] poll failed: {}", e);
                    outcome = Err(e.into());
                    break;
                }
            };
            for token in ready {
                match token {
                    Token::Listener => self.accept(),
                    Token::Client(id) => self.state.lock().handle_readable(id),
                }
            }
        }

        self.running.store(false, Ordering::Release);
        info!("[Server] shutting down");
        if broadcast.join().is_err() {
            error!("[Server] broadcast thread panicked");
        }
        {
            let mut state = self.state.lock();
            state.buffer.stop();
            state.close_all();
        }
        self.metrics.log_summary();
        drop(self.listener);
        info!("[Server] stopped");
        outcome
    }

    fn accept(&self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("[Server] accept failed: {}", e);
                return;
            }
        };

        let mut state = self.state.lock();
        if state.client_count() >= self.config.max_clients {
            warn!("[Server] rejecting {}: {} clients already connected", peer, state.client_count());
            self.metrics.record_client(false);
            drop(stream);
            return;
        }

        if let Err(e) = stream.set_nonblocking(true) {
            warn!("[Server] cannot make {} non-blocking: {}", peer, e);
            return;
        }
        stream.set_nodelay(true).ok();
        self.metrics.record_client(true);
        state.add_client(stream, peer);
    }
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
