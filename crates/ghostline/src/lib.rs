//! ghostline: remote session, memory primitive and address translation
//! built on `ghostline-core`.
//!
//! Data only flows upward: sessions know nothing of the primitive, and the
//! translation engine only ever asks the primitive for physical reads.

pub mod primitive;
pub mod session;
pub mod translate;

pub use primitive::{MemoryPrimitive, PhysicalMemory, PrimitiveError};
pub use session::{RemoteSession, SessionError, Target};
pub use translate::{TranslationContext, TranslationError, Translator};
