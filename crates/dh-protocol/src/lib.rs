//! dh-protocol: Wire protocol for the devhost privileged helper
//!
//! This crate defines the binary protocol spoken between the unprivileged
//! orchestrator and the privileged helper over a local Unix socket. Every
//! exchange is a single request frame answered by a single response frame
//! carrying the same request id.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoded, Frame, FrameCodec, RejectedFrame, DEFAULT_MAX_PAYLOAD};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
pub use message::{
    CertInfo, FailureReason, HelperRequest, HelperResponse, Message, MessageKind,
    HELPER_VERSION,
};
