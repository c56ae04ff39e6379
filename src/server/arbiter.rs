//! arbiter.rs
//! Maps aggregate client demand onto the single shared sensor.
//!
//! The hardware holds one channel set at a time, so it is configured with the
//! union of every session's mask, and the reader runs while at least one
//! session is streaming. Runs after every accept, command and removal, always
//! under the session-table lock.

use log::{error, info, warn};

use crate::sensor::channel::ChannelMask;
use crate::server::session::ServerState;

/// Aggregate of all sessions' subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Demand {
    pub mask: ChannelMask,
    pub streaming: bool,
}

impl Demand {
    pub fn aggregate(sessions: impl IntoIterator<Item = (ChannelMask, bool)>) -> Self {
        sessions
            .into_iter()
            .fold(Self::default(), |acc, (mask, streaming)| Self {
                mask: acc.mask | mask,
                streaming: acc.streaming || streaming,
            })
    }
}

impl ServerState {
    pub fn demand(&self) -> Demand {
        Demand::aggregate(self.sessions.values().map(|s| (s.mask, s.streaming)))
    }

    /// Reconfigures, starts or stops the sensor buffer to match current demand.
    pub fn arbitrate(&mut self) {
        let demand = self.demand();

        if !demand.mask.is_empty() && self.buffer.applied_mask() != Some(demand.mask) {
            match self.buffer.configure_channels(demand.mask) {
                Ok(()) => {
                    // Pending samples carry the old layout's fields.
                    let flushed = self.buffer.queue().flush();
                    self.metrics.record_reconfiguration(flushed);
                }
                Err(e) => error!("[Arbiter] reconfiguration to {} failed: {}", demand.mask.describe(), e),
            }
        }

        let running = self.buffer.is_running();
        if demand.streaming && !running {
            info!("[Arbiter] streaming requested, starting reader");
            match self.buffer.start() {
                Ok(true) => {}
                Ok(false) => warn!("[Arbiter] reader not started: no active channels"),
                Err(e) => error!("[Arbiter] failed to spawn reader: {}", e),
            }
        } else if !demand.streaming && running {
            info!("[Arbiter] no active streams, stopping reader");
            self.buffer.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_and_any_streaming() {
        let demand = Demand::aggregate([
            (ChannelMask::ACCEL_X, false),
            (ChannelMask::MAGN_Z, true),
            (ChannelMask::NONE, false),
        ]);
        assert_eq!(demand.mask, ChannelMask::ACCEL_X | ChannelMask::MAGN_Z);
        assert!(demand.streaming);
    }

    #[test]
    fn empty_table_means_no_demand() {
        assert_eq!(Demand::aggregate(Vec::new()), Demand::default());
        assert_eq!(Demand::default().mask, ChannelMask::NONE);
    }

    #[test]
    fn repeated_entries_do_not_change_the_result() {
        let once = Demand::aggregate([(ChannelMask::GYRO_XYZ, true)]);
        let twice = Demand::aggregate([(ChannelMask::GYRO_XYZ, true), (ChannelMask::GYRO_XYZ, true)]);
        assert_eq!(once, twice);
    }
}
