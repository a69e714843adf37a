//! Close handshake payloads

use bytes::{BufMut, BytesMut};

use crate::{ProtocolError, MAX_CONTROL_PAYLOAD};

/// A WebSocket close status code (RFC 6455 section 7.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure; the purpose of the connection has been fulfilled
    Normal,
    /// Endpoint is going away (server shutdown, page navigated away)
    Away,
    /// Terminating due to a protocol error
    Protocol,
    /// Received a data type it cannot accept
    Unsupported,
    /// Received data inconsistent with the message type (e.g. bad UTF-8)
    InvalidPayload,
    /// Received a message that violates local policy
    Policy,
    /// Received a message too big to process
    TooLarge,
    /// Client expected the server to negotiate an extension
    MissingExtension,
    /// Server encountered an unexpected condition
    Internal,
    /// Any other registered or application code
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::Policy,
            1009 => CloseCode::TooLarge,
            1010 => CloseCode::MissingExtension,
            1011 => CloseCode::Internal,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::InvalidPayload => 1007,
            CloseCode::Policy => 1008,
            CloseCode::TooLarge => 1009,
            CloseCode::MissingExtension => 1010,
            CloseCode::Internal => 1011,
            CloseCode::Other(other) => other,
        }
    }
}

/// Decoded close frame payload: status code plus optional reason text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    /// Create a close frame, truncating the reason to fit a control frame
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        let max = MAX_CONTROL_PAYLOAD - 2;
        if reason.len() > max {
            let mut cut = max;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        CloseFrame { code, reason }
    }

    /// Decode a close frame payload.
    ///
    /// An empty payload is valid and carries no code (`Ok(None)`); a
    /// one-byte payload or a non-UTF-8 reason is malformed.
    pub fn decode(payload: &[u8]) -> Result<Option<CloseFrame>, ProtocolError> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(ProtocolError::InvalidCloseFrame),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]).into();
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| ProtocolError::InvalidCloseFrame)?
                    .to_owned();
                Ok(Some(CloseFrame { code, reason }))
            }
        }
    }

    /// Append the encoded payload (code + reason bytes) to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(2 + self.reason.len());
        dst.put_u16(u16::from(self.code));
        dst.put_slice(self.reason.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_conversions() {
        assert_eq!(CloseCode::from(1000), CloseCode::Normal);
        assert_eq!(CloseCode::from(1011), CloseCode::Internal);
        assert_eq!(CloseCode::from(4000), CloseCode::Other(4000));
        assert_eq!(u16::from(CloseCode::Normal), 1000);
        assert_eq!(u16::from(CloseCode::Other(3999)), 3999);
    }

    #[test]
    fn test_payload_roundtrip() {
        let frame = CloseFrame::new(CloseCode::Normal, "bye");
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);

        assert_eq!(&buf[..2], &1000u16.to_be_bytes());
        assert_eq!(&buf[2..], b"bye");
        assert_eq!(CloseFrame::decode(&buf).unwrap(), Some(frame));
    }

    #[test]
    fn test_empty_payload_has_no_code() {
        assert_eq!(CloseFrame::decode(&[]).unwrap(), None);
    }

    #[test]
    fn test_one_byte_payload_is_malformed() {
        assert_eq!(
            CloseFrame::decode(&[0x03]),
            Err(ProtocolError::InvalidCloseFrame)
        );
    }

    #[test]
    fn test_non_utf8_reason_is_malformed() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xFF, 0xFE]);
        assert_eq!(
            CloseFrame::decode(&payload),
            Err(ProtocolError::InvalidCloseFrame)
        );
    }

    #[test]
    fn test_long_reason_truncated_to_control_limit() {
        let frame = CloseFrame::new(CloseCode::Policy, "x".repeat(200));
        assert_eq!(frame.reason.len(), MAX_CONTROL_PAYLOAD - 2);

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert!(buf.len() <= MAX_CONTROL_PAYLOAD);
    }
}
