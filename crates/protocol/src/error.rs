//! Frame-level protocol violations

use thiserror::Error;

/// Errors raised while decoding or validating frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid opcode {0:#x}")]
    InvalidOpCode(u8),

    #[error("reserved bits set in frame header")]
    ReservedBits,

    #[error("control frame must not be fragmented")]
    FragmentedControlFrame,

    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLong(u64),

    #[error("payload length exceeds 63 bits")]
    PayloadLengthTooLarge,

    #[error("client frame is not masked")]
    UnmaskedFrame,

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("data frame interleaved within a fragmented message")]
    InterleavedDataFrame,

    #[error("malformed close frame payload")]
    InvalidCloseFrame,
}
