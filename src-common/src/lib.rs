//! framebus common library
//!
//! Zero-copy video frame transport between a producer daemon and any
//! number of consumers: the frame channel, the service directory the two
//! sides meet through, and the consumer-side state machine.

pub mod client;
pub mod directory;
pub mod logging;
pub mod transport;
pub mod types;

pub use types::*;
