//! Thin safe wrapper over `poll(2)`.
//!
//! Level-triggered readiness with a bounded wait: every loop that blocks on a
//! descriptor goes through here so it can come back and check its stop flag.

use std::{io, os::fd::RawFd, time::Duration};

const READY_MASK: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

fn timeout_ms(timeout: Duration) -> libc::c_int {
    timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
}

/// Interest set over many descriptors, each tagged with a caller token.
pub struct PollSet<T> {
    fds: Vec<libc::pollfd>,
    tokens: Vec<T>,
}

impl<T: Copy> PollSet<T> {
    pub fn new() -> Self {
        Self {
            fds: Vec::new(),
            tokens: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.fds.clear();
        self.tokens.clear();
    }

    pub fn register(&mut self, fd: RawFd, token: T) {
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        self.tokens.push(token);
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Waits up to `timeout`; returns tokens of descriptors that are readable,
    /// hung up or in error. An interrupted wait reports nothing ready.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<T>> {
        for pfd in &mut self.fds {
            pfd.revents = 0;
        }
        // SAFETY: `fds` is a live, correctly sized array of pollfd for the call.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        Ok(self
            .fds
            .iter()
            .zip(&self.tokens)
            .filter(|(pfd, _)| pfd.revents & READY_MASK != 0)
            .map(|(_, token)| *token)
            .collect())
    }
}

impl<T: Copy> Default for PollSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn wait_single(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    // SAFETY: single pollfd on the stack, valid for the duration of the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms(timeout)) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0)
}

/// True when `fd` has data (or a hang-up/error to report) within `timeout`.
pub fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    wait_single(fd, libc::POLLIN, timeout)
}

/// True when `fd` can accept more bytes (or has an error to report) within `timeout`.
pub fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    wait_single(fd, libc::POLLOUT, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::Write,
        net::{TcpListener, TcpStream},
        os::fd::AsRawFd,
    };

    #[test]
    fn reports_only_ready_descriptors() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let mut set = PollSet::new();
        set.register(listener.as_raw_fd(), 'L');
        set.register(server_side.as_raw_fd(), 'C');
        assert!(set.wait(Duration::from_millis(20)).unwrap().is_empty());

        client.write_all(b"ping\n").unwrap();
        let ready = set.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(ready, vec!['C']);
    }

    #[test]
    fn single_fd_helpers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        assert!(wait_writable(client.as_raw_fd(), Duration::from_secs(1)).unwrap());
        assert!(!wait_readable(client.as_raw_fd(), Duration::from_millis(10)).unwrap());
    }
}
