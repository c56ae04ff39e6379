//! buffer.rs
//! Sensor buffer engine: applies a channel set to the device, derives the packet
//! layout from the device's own metadata, and runs the reader thread that turns
//! raw scans into samples on the drop-oldest queue.
//!
//! - The layout is swapped atomically (`RwLock<Arc<_>>`). The reader snapshots
//!   it after the device reports data, and only publishes the packet if that
//!   snapshot is still current, holding the read lock until the sample is
//!   queued. A packet is never decoded with a layout other than the one its
//!   size was taken from, and nothing decoded with a replaced layout lands in
//!   the queue after the post-reconfiguration flush.
//! - Every reader exit path clears `buffer/enable` through a drop guard.
//! - `stop()` waits a bounded time on a completion channel instead of an
//!   unbounded `join()`.

use std::{
    io::{self, Read},
    os::fd::AsRawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{RecvTimeoutError, Receiver, Sender, bounded};
use log::{debug, error, info, trace, warn};
use parking_lot::RwLock;

use crate::sensor::{
    channel::ChannelMask,
    device::SysfsDevice,
    packet::{ChannelMeta, PacketLayout},
    queue::SampleQueue,
};
use crate::utils::{config::BufferConfig, metrics::SharedMetrics, poll};

// Backoff after a zero-byte read so an idle stream does not spin.
const SHORT_READ_BACKOFF: Duration = Duration::from_millis(1);

type SharedLayout = Arc<RwLock<Arc<PacketLayout>>>;

struct ReaderHandle {
    running: Arc<AtomicBool>,
    // Never sent on; disconnects when the reader thread ends.
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

pub struct SensorBuffer {
    device: Arc<SysfsDevice>,
    queue: Arc<SampleQueue>,
    layout: SharedLayout,
    applied: Option<ChannelMask>,
    reader: Option<ReaderHandle>,
    config: BufferConfig,
    metrics: SharedMetrics,
}

impl SensorBuffer {
    pub fn new(device: SysfsDevice, config: BufferConfig, metrics: SharedMetrics) -> Self {
        Self {
            device: Arc::new(device),
            queue: Arc::new(SampleQueue::new(config.queue_capacity)),
            layout: Arc::new(RwLock::new(Arc::new(PacketLayout::default()))),
            applied: None,
            reader: None,
            config,
            metrics,
        }
    }

    /// Consumer side of the sample queue.
    pub fn queue(&self) -> Arc<SampleQueue> {
        self.queue.clone()
    }

    pub fn device(&self) -> &SysfsDevice {
        &self.device
    }

    pub fn layout(&self) -> Arc<PacketLayout> {
        self.layout.read().clone()
    }

    /// Mask last passed to `configure_channels`, if any.
    pub fn applied_mask(&self) -> Option<ChannelMask> {
        self.applied
    }

    pub fn is_running(&self) -> bool {
        self.reader
            .as_ref()
            .is_some_and(|r| r.running.load(Ordering::Acquire))
    }

    /// Applies `mask` to the device and rebuilds the packet layout.
    ///
    /// Channels whose scan index cannot be read are left out of the layout.
    /// Only failures to toggle `buffer/enable` are returned.
    pub fn configure_channels(&mut self, mask: ChannelMask) -> io::Result<()> {
        self.device.set_buffer_enabled(false)?;

        let mut metas = Vec::new();
        for channel in ChannelMask::atomic() {
            let Some(info) = channel.info() else {
                continue;
            };
            let enabled = mask.contains(channel);
            if let Err(e) = self.device.set_channel_enabled(info, enabled) {
                warn!("[SensorBuffer] cannot set enable for {}: {}", info.device_name, e);
                continue;
            }
            if !enabled {
                continue;
            }
            let Some(index) = self.device.channel_index(info) else {
                warn!("[SensorBuffer] no scan index for {}; channel skipped", info.device_name);
                continue;
            };
            let cal = self.device.calibration(info);
            metas.push(ChannelMeta {
                channel,
                name: info.device_name,
                index,
                scale: cal.scale,
                offset: cal.offset,
            });
        }

        let layout = PacketLayout::new(metas);
        info!(
            "[SensorBuffer] configured {} -> {} channel(s), {} byte packets",
            mask.describe(),
            layout.len(),
            layout.size()
        );
        *self.layout.write() = Arc::new(layout);
        self.applied = Some(mask);

        if self.is_running() {
            self.device.set_buffer_enabled(true)?;
        }
        Ok(())
    }

    /// Launches the reader thread. Returns `false` when there is nothing to
    /// read (empty layout) or the reader is already running.
    pub fn start(&mut self) -> io::Result<bool> {
        if self.layout.read().is_empty() {
            debug!("[SensorBuffer] start ignored: no active channels");
            return Ok(false);
        }
        if self.is_running() {
            return Ok(false);
        }
        // Reap a reader that exited on its own (e.g. device read error).
        self.stop();

        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = bounded::<()>(0);
        let reader = Reader {
            device: self.device.clone(),
            layout: self.layout.clone(),
            queue: self.queue.clone(),
            running: running.clone(),
            read_poll: self.config.read_poll,
            metrics: self.metrics.clone(),
        };
        let handle = thread::Builder::new()
            .name("mpu-reader".into())
            .spawn(move || reader.run(done_tx))?;

        self.reader = Some(ReaderHandle {
            running,
            done: done_rx,
            handle,
        });
        info!("[SensorBuffer] reader started");
        Ok(true)
    }

    /// Signals the reader to exit and waits at most `join_timeout` for it.
    pub fn stop(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        reader.running.store(false, Ordering::Release);

        match reader.done.recv_timeout(self.config.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if reader.handle.join().is_err() {
                    error!("[SensorBuffer] reader thread panicked");
                }
                info!("[SensorBuffer] reader stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "[SensorBuffer] reader did not exit within {:?}; detaching",
                    self.config.join_timeout
                );
                if let Err(e) = self.device.set_buffer_enabled(false) {
                    error!("[SensorBuffer] failed to disable hardware buffer: {}", e);
                }
            }
        }
    }
}

impl Drop for SensorBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved into the reader thread.
struct Reader {
    device: Arc<SysfsDevice>,
    layout: SharedLayout,
    queue: Arc<SampleQueue>,
    running: Arc<AtomicBool>,
    read_poll: Duration,
    metrics: SharedMetrics,
}

/// Clears the run flag and the hardware buffer however the reader exits.
struct ReaderGuard<'a> {
    device: &'a SysfsDevice,
    running: &'a AtomicBool,
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.device.set_buffer_enabled(false) {
            error!("[Reader] failed to disable hardware buffer: {}", e);
        }
    }
}

impl Reader {
    fn run(self, _done: Sender<()>) {
        let _guard = ReaderGuard {
            device: &self.device,
            running: &self.running,
        };

        let mut stream = match self.device.open_stream() {
            Ok(stream) => stream,
            Err(e) => {
                error!("[Reader] cannot open {}: {}", self.device.char_dev().display(), e);
                return;
            }
        };
        if let Err(e) = self.device.set_buffer_enabled(true) {
            error!("[Reader] cannot enable hardware buffer: {}", e);
            return;
        }

        let mut buf = Vec::new();
        while self.running.load(Ordering::Acquire) {
            if self.layout.read().is_empty() {
                thread::sleep(self.read_poll);
                continue;
            }

            match poll::wait_readable(stream.as_raw_fd(), self.read_poll) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!("[Reader] poll failed: {}", e);
                    break;
                }
            }

            // Snapshot only once data is ready; the layout may have changed
            // while we were parked in poll.
            let layout = self.layout.read().clone();
            if layout.is_empty() {
                continue;
            }
            buf.resize(layout.size(), 0);
            match stream.read(&mut buf) {
                Ok(n) if n == layout.size() => self.publish(&layout, &buf),
                Ok(n) => {
                    trace!("[Reader] short read {} of {} bytes", n, layout.size());
                    self.metrics.record_short_read();
                    if n == 0 {
                        thread::sleep(SHORT_READ_BACKOFF);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    error!("[Reader] device read failed: {}", e);
                    break;
                }
            }
        }
        debug!("[Reader] exiting");
    }

    /// Decodes and enqueues one packet read with `layout`. The read lock is
    /// held across the push, so a reconfiguration (and the flush that follows
    /// it) cannot slip in between; a packet read under a replaced layout is
    /// discarded.
    fn publish(&self, layout: &Arc<PacketLayout>, bytes: &[u8]) {
        let current = self.layout.read();
        if !Arc::ptr_eq(layout, &*current) {
            debug!("[Reader] layout changed during read; packet discarded");
            self.metrics.record_stale_packet();
            return;
        }
        if let Some(sample) = layout.decode(bytes) {
            let evicted = self.queue.push(sample);
            self.metrics.record_packet(evicted);
        }
    }
}
