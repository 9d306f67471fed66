//! ghostline-core: wire framing, the chunked LZ codec, the memory
//! descriptor layout, and configuration. Pure and synchronous: nothing in
//! this crate touches a socket.

pub mod compress;
pub mod config;
pub mod descriptor;
pub mod wire;

pub use compress::{compress, decompress, BackRefSchedule, CompressionError, EncodePolicy};
pub use descriptor::MemoryDescriptor;
