//! Spindrift Protocol - RFC 6455 frame-level codec
//!
//! This crate defines the wire-format pieces of the WebSocket protocol:
//! - `FrameHeader`: frame header encoding and decoding
//! - `OpCode`/`MessageKind`: frame and message type tags
//! - `CloseCode`/`CloseFrame`: close handshake payloads
//! - `apply_mask`: client payload (un)masking
//!
//! No I/O happens here; the server crate drives byte streams through these
//! types.

mod close;
mod error;
mod frame;
mod mask;
mod opcode;

pub use close::*;
pub use error::*;
pub use frame::*;
pub use mask::*;
pub use opcode::*;
