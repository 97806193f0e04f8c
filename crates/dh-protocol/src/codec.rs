//! Tokio codec for framed helper messages

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::message::{FailureReason, HelperRequest, HelperResponse, Message, MessageKind};

/// Payload limit applied by [`FrameCodec::new`]
///
/// Helper messages carry a handful of paths; anything near this size is
/// hostile or corrupt.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request id this frame belongs to
    pub request_id: u32,
    /// The message payload
    pub message: Message,
}

impl Frame {
    /// Create a new frame
    pub fn new(request_id: u32, message: Message) -> Self {
        Self {
            request_id,
            message,
        }
    }

    /// Convenience constructor for a request frame
    pub fn request(request_id: u32, request: HelperRequest) -> Self {
        Self::new(request_id, Message::Request(request))
    }

    /// Convenience constructor for a response frame
    pub fn response(request_id: u32, response: HelperResponse) -> Self {
        Self::new(request_id, Message::Response(response))
    }
}

/// A frame whose header was readable but whose content was not
///
/// The payload bytes have already been consumed, so the stream stays aligned
/// on the next frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedFrame {
    /// Request id from the header, used to address the failure reply
    pub request_id: u32,
    /// Why the frame was rejected
    pub reason: FailureReason,
    /// Human-readable detail
    pub detail: String,
}

impl RejectedFrame {
    /// The failure response to send back for this frame
    pub fn into_response(self) -> Frame {
        Frame::response(
            self.request_id,
            HelperResponse::failure(self.reason, self.detail),
        )
    }
}

/// Result of decoding one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Valid(Frame),
    Rejected(RejectedFrame),
}

/// Codec for encoding/decoding protocol frames
#[derive(Debug)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
    /// Largest payload accepted
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Create a codec with a custom payload limit (capped by the 24-bit field)
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            pending_header: None,
            max_payload: max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }
}

fn decode_message(header: &FrameHeader, payload: &[u8]) -> Result<Message, RejectedFrame> {
    let reject = |reason: FailureReason, detail: String| RejectedFrame {
        request_id: header.request_id,
        reason,
        detail,
    };

    if header.version != PROTOCOL_VERSION {
        return Err(reject(
            FailureReason::VersionMismatch,
            format!(
                "expected protocol version {}, got {}",
                PROTOCOL_VERSION, header.version
            ),
        ));
    }

    let kind = MessageKind::from_u8(header.kind).ok_or_else(|| {
        reject(
            FailureReason::UnsupportedRequest,
            format!("unknown message kind 0x{:02x}", header.kind),
        )
    })?;

    if kind == MessageKind::Response {
        return bincode::deserialize::<HelperResponse>(payload)
            .map(Message::Response)
            .map_err(|e| reject(FailureReason::MalformedRequest, e.to_string()));
    }

    let request: HelperRequest = bincode::deserialize(payload)
        .map_err(|e| reject(FailureReason::MalformedRequest, e.to_string()))?;

    if request.kind() != kind {
        return Err(reject(
            FailureReason::MalformedRequest,
            format!(
                "header kind {:?} does not match payload kind {:?}",
                kind,
                request.kind()
            ),
        ));
    }

    Ok(Message::Request(request))
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src) {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if payload_len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload,
            });
        }

        if src.len() < payload_len {
            self.pending_header = Some(header);
            src.reserve(payload_len - src.len());
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();

        let decoded = match decode_message(&header, &payload) {
            Ok(message) => Decoded::Valid(Frame {
                request_id: header.request_id,
                message,
            }),
            Err(rejected) => {
                tracing::debug!(
                    request_id = rejected.request_id,
                    reason = %rejected.reason,
                    "Rejected helper frame: {}",
                    rejected.detail
                );
                Decoded::Rejected(rejected)
            }
        };

        Ok(Some(decoded))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = match &frame.message {
            Message::Request(request) => bincode::serialize(request)?,
            Message::Response(response) => bincode::serialize(response)?,
        };
        let payload_len = payload.len();

        if payload_len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload,
            });
        }

        let header = FrameHeader::new(
            frame.request_id,
            frame.message.kind().as_u8(),
            payload_len as u32,
        );
        header.encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
