//! Frame transport: sealed memfd payloads passed over Unix stream sockets.

mod channel;
pub mod fdpass;
mod memory;
mod wire;

pub use channel::*;
pub use memory::{file_size, identity, FrameMemory, MappedRegion, MemoryIdentity};
pub use wire::*;
