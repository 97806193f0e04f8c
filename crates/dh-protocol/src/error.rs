//! Transport errors on the helper socket

use thiserror::Error;

/// A failure that leaves the byte stream unusable
///
/// Frames with an unknown kind or an undecodable payload are not errors; the
/// codec yields them as [`crate::RejectedFrame`] and the connection survives.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Declared or encoded payload is larger than a frame can carry
    #[error("frame payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// A message could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::Error),

    #[error("helper socket I/O: {0}")]
    Io(#[from] std::io::Error),
}
