// Server side: session table, command processing, hardware arbitration,
// the dispatch loop and the broadcast loop.

pub mod arbiter;
pub mod broadcast;
pub mod command;
pub mod relay;
pub mod session;

pub use relay::{SensorServer, ServerHandle};
