// Sensor side: channel model, IIO attribute access, packet decoding,
// the drop-oldest sample queue and the buffer engine that owns the reader thread.

pub mod buffer;
pub mod channel;
pub mod device;
pub mod packet;
pub mod queue;
