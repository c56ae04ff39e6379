//! Relay counters shared by the reader thread, dispatch loop and broadcast loop.
//!
//! All counters are relaxed atomics: producers never wait on a lock to record,
//! and a snapshot is only used for logging and tests.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use log::info;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct RelayMetrics {
    packets_decoded: AtomicU64,
    short_reads: AtomicU64,
    stale_packets: AtomicU64,
    queue_evictions: AtomicU64,
    queue_flushed: AtomicU64,
    reconfigurations: AtomicU64,
    lines_sent: AtomicU64,
    send_failures: AtomicU64,
    clients_accepted: AtomicU64,
    clients_rejected: AtomicU64,
    commands_ignored: AtomicU64,
}

pub type SharedMetrics = Arc<RelayMetrics>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub packets_decoded: u64,
    pub short_reads: u64,
    pub stale_packets: u64,
    pub queue_evictions: u64,
    pub queue_flushed: u64,
    pub reconfigurations: u64,
    pub lines_sent: u64,
    pub send_failures: u64,
    pub clients_accepted: u64,
    pub clients_rejected: u64,
    pub commands_ignored: u64,
}

#[inline]
fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl RelayMetrics {
    pub fn shared() -> SharedMetrics {
        Arc::new(Self::default())
    }

    pub fn record_packet(&self, evicted: bool) {
        bump(&self.packets_decoded, 1);
        if evicted {
            bump(&self.queue_evictions, 1);
        }
    }

    pub fn record_short_read(&self) {
        bump(&self.short_reads, 1);
    }

    pub fn record_stale_packet(&self) {
        bump(&self.stale_packets, 1);
    }

    pub fn record_reconfiguration(&self, flushed: usize) {
        bump(&self.reconfigurations, 1);
        bump(&self.queue_flushed, flushed as u64);
    }

    pub fn record_line_sent(&self) {
        bump(&self.lines_sent, 1);
    }

    pub fn record_send_failure(&self) {
        bump(&self.send_failures, 1);
    }

    pub fn record_client(&self, accepted: bool) {
        if accepted {
            bump(&self.clients_accepted, 1);
        } else {
            bump(&self.clients_rejected, 1);
        }
    }

    pub fn record_ignored_command(&self) {
        bump(&self.commands_ignored, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            packets_decoded: load(&self.packets_decoded),
            short_reads: load(&self.short_reads),
            stale_packets: load(&self.stale_packets),
            queue_evictions: load(&self.queue_evictions),
            queue_flushed: load(&self.queue_flushed),
            reconfigurations: load(&self.reconfigurations),
            lines_sent: load(&self.lines_sent),
            send_failures: load(&self.send_failures),
            clients_accepted: load(&self.clients_accepted),
            clients_rejected: load(&self.clients_rejected),
            commands_ignored: load(&self.commands_ignored),
        }
    }

    pub fn log_summary(&self) {
        let snap = self.snapshot();
        match serde_json::to_string(&snap) {
            Ok(json) => info!("[Metrics] {}", json),
            Err(_) => info!("[Metrics] {:?}", snap),
        }
    }
}
