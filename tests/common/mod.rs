#![allow(dead_code)]

use std::{
    ffi::CString,
    fs,
    io::{BufRead, BufReader, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    os::unix::ffi::OsStrExt,
    path::PathBuf,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{Receiver, TrySendError, bounded};
use tempfile::TempDir;

use mpu_relay::{
    sensor::{buffer::SensorBuffer, device::SysfsDevice},
    server::{SensorServer, ServerHandle},
    utils::{
        config::{BufferConfig, ServerConfig},
        metrics::{RelayMetrics, SharedMetrics},
    },
};

/// Scan indices deliberately not in channel declaration order.
pub const SCAN_INDEX: [(&str, u32); 9] = [
    ("accel_x", 3),
    ("accel_y", 4),
    ("accel_z", 5),
    ("anglvel_x", 6),
    ("anglvel_y", 7),
    ("anglvel_z", 8),
    ("magn_x", 0),
    ("magn_y", 1),
    ("magn_z", 2),
];

/// IIO attribute tree in a temp dir, shaped like `/sys/bus/iio/devices/iio:deviceN`.
pub struct FakeImu {
    _dir: TempDir,
    pub attrs: PathBuf,
    pub node: PathBuf,
}

impl FakeImu {
    /// Attribute tree whose character device is `node`.
    pub fn with_node(node: impl Into<PathBuf>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let attrs = dir.path().join("iio:device0");
        fs::create_dir_all(attrs.join("scan_elements")).unwrap();
        fs::create_dir_all(attrs.join("buffer")).unwrap();
        fs::write(attrs.join("buffer/enable"), "0").unwrap();
        for (name, index) in SCAN_INDEX {
            fs::write(attrs.join(format!("scan_elements/in_{name}_en")), "0").unwrap();
            fs::write(attrs.join(format!("scan_elements/in_{name}_index")), format!("{index}\n")).unwrap();
        }
        fs::write(attrs.join("in_accel_scale"), "0.5").unwrap();
        fs::write(attrs.join("in_anglvel_scale"), "0.25").unwrap();
        fs::write(attrs.join("in_magn_x_scale"), "2.0").unwrap();
        fs::write(attrs.join("in_magn_y_scale"), "3.0").unwrap();
        fs::write(attrs.join("in_magn_z_scale"), "4.0").unwrap();
        fs::write(attrs.join("in_magn_offset"), "1").unwrap();
        Self { _dir: dir, attrs, node: node.into() }
    }

    /// Attribute tree plus a regular file holding `packets` as the scan stream.
    pub fn with_packets(packets: &[Vec<i16>]) -> Self {
        let mut imu = Self::with_node("/dev/null");
        imu.node = imu.attrs.join("dev_node");
        let bytes: Vec<u8> = packets
            .iter()
            .flat_map(|p| p.iter().flat_map(|v| v.to_be_bytes()))
            .collect();
        fs::write(&imu.node, bytes).unwrap();
        imu
    }

    /// Attribute tree whose character device is a named pipe the test writes into.
    pub fn with_fifo() -> Self {
        let mut imu = Self::with_node("/dev/null");
        imu.node = imu.attrs.join("dev_fifo");
        let path = CString::new(imu.node.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(path.as_ptr(), 0o600) }, 0, "mkfifo failed");
        imu
    }

    /// Endless all-zero scan stream: every raw word decodes as 0.
    pub fn streaming() -> Self {
        Self::with_node("/dev/zero")
    }

    pub fn device(&self) -> SysfsDevice {
        SysfsDevice::new(&self.attrs, &self.node)
    }

    pub fn remove_index(&self, name: &str) {
        fs::remove_file(self.attrs.join(format!("scan_elements/in_{name}_index"))).unwrap();
    }

    pub fn attr(&self, subpath: &str) -> String {
        fs::read_to_string(self.attrs.join(subpath)).unwrap().trim().to_string()
    }

    pub fn buffer_enabled(&self) -> bool {
        self.attr("buffer/enable") == "1"
    }

    pub fn channel_enabled(&self, name: &str) -> bool {
        self.attr(&format!("scan_elements/in_{name}_en")) == "1"
    }

    pub fn buffer(&self, metrics: SharedMetrics) -> SensorBuffer {
        SensorBuffer::new(self.device(), BufferConfig::default(), metrics)
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

pub struct RunningServer {
    pub imu: FakeImu,
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    pub metrics: SharedMetrics,
    thread: Option<JoinHandle<()>>,
}

impl RunningServer {
    pub fn start() -> Self {
        Self::start_with(|_| {})
    }

    /// Starts with the test defaults adjusted by `tweak`.
    pub fn start_with(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let imu = FakeImu::streaming();
        let metrics = RelayMetrics::shared();
        let mut config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            poll_timeout: Duration::from_millis(200),
            broadcast_wait: Duration::from_millis(100),
            ..ServerConfig::default()
        };
        tweak(&mut config);
        let server = SensorServer::bind(imu.buffer(metrics.clone()), config, metrics.clone()).unwrap();
        let addr = server.local_addr();
        let handle = server.handle();
        let thread = thread::spawn(move || server.run().unwrap());
        Self {
            imu,
            addr,
            handle,
            metrics,
            thread: Some(thread),
        }
    }

    pub fn connect(&self) -> TestClient {
        TestClient::connect(self.addr)
    }

    pub fn wait_clients(&self, n: usize) -> bool {
        wait_until(Duration::from_secs(3), || self.handle.client_count() == n)
    }

    pub fn stop(&mut self) {
        self.handle.shutdown();
        if let Some(t) = self.thread.take() {
            t.join().unwrap();
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Protocol client that drains incoming lines on a background thread so the
/// server never sees it as a stalled socket.
pub struct TestClient {
    pub stream: TcpStream,
    lines: Receiver<String>,
    _reader: JoinHandle<()>,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        // Bounded so a fast stream cannot pile up; overflow lines are discarded.
        let (tx, lines) = bounded(1024);
        let read_half = stream.try_clone().unwrap();
        let reader = thread::spawn(move || {
            for line in BufReader::new(read_half).lines() {
                let Ok(line) = line else { break };
                if let Err(TrySendError::Disconnected(_)) = tx.try_send(line) {
                    break;
                }
            }
        });
        Self {
            stream,
            lines,
            _reader: reader,
        }
    }

    pub fn send(&mut self, json: &str) {
        self.stream.write_all(json.as_bytes()).unwrap();
        self.stream.write_all(b"\n").unwrap();
    }

    pub fn config(&mut self, channels: &[&str]) {
        let params = serde_json::to_string(channels).unwrap();
        self.send(&format!(r#"{{"action":"config_channels","params":{params}}}"#));
    }

    pub fn start(&mut self) {
        self.send(r#"{"action":"start_send"}"#);
    }

    pub fn stop(&mut self) {
        self.send(r#"{"action":"stop_send"}"#);
    }

    pub fn next_line(&self, timeout: Duration) -> Option<String> {
        self.lines.recv_timeout(timeout).ok()
    }

    /// Parses the next `n` sample lines as JSON objects and returns their key sets.
    pub fn sample_keys(&self, n: usize) -> Vec<Vec<String>> {
        (0..n)
            .map(|_| {
                let line = self.next_line(Duration::from_secs(3)).expect("sample line");
                let value: serde_json::Value = serde_json::from_str(&line).unwrap();
                let mut keys: Vec<String> = value.as_object().unwrap().keys().cloned().collect();
                keys.sort();
                keys
            })
            .collect()
    }

    /// Discards whatever has arrived so far.
    pub fn drain(&self) -> usize {
        self.lines.try_iter().count()
    }

    /// Closes both directions without sending `disconnect`.
    pub fn abort(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// True when the server closed the connection (reader thread finished).
    pub fn closed_within(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.lines.recv_timeout(Duration::from_millis(20)) {
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return true,
                _ if Instant::now() >= deadline => return false,
                _ => {}
            }
        }
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.abort();
    }
}
