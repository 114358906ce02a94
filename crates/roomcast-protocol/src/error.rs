//! Error type for the wire codec.

use crate::value::Type;

/// Errors raised while encoding or decoding wire data.
///
/// Any of these on an inbound frame terminates the offending peer with
/// close code 1007 (invalid frame payload data); they never carry partial
/// results.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The input ended before the announced structure did.
    #[error("data length not enough: {0} bytes")]
    TooShort(usize),

    /// A type tag outside the defined range.
    #[error("unknown type tag: {0}")]
    UnknownType(u8),

    /// An event type byte outside the defined range.
    #[error("unknown event type: {0}")]
    UnknownEvType(u8),

    /// A message type byte outside the defined range.
    #[error("unknown message type: {0}")]
    UnknownMsgType(u8),

    /// A value had a valid tag but not the one the field requires.
    #[error("unexpected type: expected {expected:?}, got {got:?}")]
    UnexpectedType { expected: Vec<Type>, got: Type },

    /// A string field held invalid UTF-8.
    #[error("invalid utf-8 in string value")]
    InvalidUtf8,

    /// The MAC trailer did not verify under the client's key.
    #[error("message authentication failed")]
    BadMac,
}
