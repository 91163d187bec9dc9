//! Length-prefixed binary framing for the gateway.
//!
//! One unified layout over every carrier:
//!
//! ```text
//! u32  total_len   big-endian, INCLUSIVE of these 4 bytes
//! u8   kind        0 = request, 1 = response, 2 = push
//! -- request  --   u16 protocol_id, u32 seq_id, payload
//! -- response --   u16 protocol_id, u32 seq_id, u16 error_code, payload
//! -- push     --   u16 push_type, payload
//! ```
//!
//! The decoder is partial-frame safe: bytes accumulate until a whole frame
//! is present. A declared length beyond the cap fails decoding with
//! `FrameOverflow`, on which the server closes the connection.

// Layer 1: Standard library
use std::io;

// Layer 2: Third-party
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

// Layer 3: Internal
use hivecore_shared::config::DEFAULT_MAX_FRAME_LENGTH;
use hivecore_shared::error::ErrorCode;

const LEN_FIELD: usize = 4;
const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;
const KIND_PUSH: u8 = 2;

/// Framing failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Declared or encoded frame length beyond the cap.
    #[error("frame of {declared} bytes exceeds cap of {max}")]
    FrameOverflow { declared: usize, max: usize },

    /// Structurally broken frame (unknown kind, truncated header).
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One wire message: request, response or push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameMessage {
    Request {
        protocol_id: u16,
        seq_id: u32,
        payload: Vec<u8>,
    },
    Response {
        protocol_id: u16,
        seq_id: u32,
        error_code: ErrorCode,
        payload: Vec<u8>,
    },
    Push {
        push_type: u16,
        payload: Vec<u8>,
    },
}

impl GameMessage {
    pub fn request(protocol_id: u16, seq_id: u32, payload: Vec<u8>) -> Self {
        Self::Request {
            protocol_id,
            seq_id,
            payload,
        }
    }

    /// Successful response echoing a request's seq.
    pub fn ok_response(protocol_id: u16, seq_id: u32, payload: Vec<u8>) -> Self {
        Self::Response {
            protocol_id,
            seq_id,
            error_code: ErrorCode::Success,
            payload,
        }
    }

    /// Error response carrying the code's message as a JSON body.
    pub fn error_response(protocol_id: u16, seq_id: u32, error_code: ErrorCode) -> Self {
        let body = serde_json::json!({
            "code": error_code.as_u16(),
            "message": error_code.message(),
        });
        Self::Response {
            protocol_id,
            seq_id,
            error_code,
            payload: body.to_string().into_bytes(),
        }
    }

    pub fn push(push_type: u16, payload: Vec<u8>) -> Self {
        Self::Push { push_type, payload }
    }

    fn header_len(&self) -> usize {
        match self {
            Self::Request { .. } => 1 + 2 + 4,
            Self::Response { .. } => 1 + 2 + 4 + 2,
            Self::Push { .. } => 1 + 2,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Request { payload, .. }
            | Self::Response { payload, .. }
            | Self::Push { payload, .. } => payload,
        }
    }

    /// Total encoded size, length field included.
    pub fn encoded_len(&self) -> usize {
        LEN_FIELD + self.header_len() + self.payload().len()
    }
}

/// The framing codec; one instance per connection.
#[derive(Debug, Clone)]
pub struct GameCodec {
    max_frame_length: usize,
}

impl GameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for GameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for GameCodec {
    type Item = GameMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<GameMessage>, CodecError> {
        if src.len() < LEN_FIELD {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LEN_FIELD];
        len_bytes.copy_from_slice(&src[..LEN_FIELD]);
        let total_len = u32::from_be_bytes(len_bytes) as usize;

        if total_len > self.max_frame_length {
            return Err(CodecError::FrameOverflow {
                declared: total_len,
                max: self.max_frame_length,
            });
        }
        if total_len < LEN_FIELD + 1 {
            return Err(CodecError::Malformed(format!(
                "declared length {total_len} cannot hold a header"
            )));
        }
        if src.len() < total_len {
            // Partial frame; wait for more bytes.
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total_len);
        frame.advance(LEN_FIELD);
        let kind = frame.get_u8();
        let message = match kind {
            KIND_REQUEST => {
                if frame.remaining() < 6 {
                    return Err(CodecError::Malformed("truncated request header".into()));
                }
                GameMessage::Request {
                    protocol_id: frame.get_u16(),
                    seq_id: frame.get_u32(),
                    payload: frame.to_vec(),
                }
            }
            KIND_RESPONSE => {
                if frame.remaining() < 8 {
                    return Err(CodecError::Malformed("truncated response header".into()));
                }
                GameMessage::Response {
                    protocol_id: frame.get_u16(),
                    seq_id: frame.get_u32(),
                    error_code: ErrorCode::from_u16(frame.get_u16()),
                    payload: frame.to_vec(),
                }
            }
            KIND_PUSH => {
                if frame.remaining() < 2 {
                    return Err(CodecError::Malformed("truncated push header".into()));
                }
                GameMessage::Push {
                    push_type: frame.get_u16(),
                    payload: frame.to_vec(),
                }
            }
            other => {
                return Err(CodecError::Malformed(format!("unknown frame kind {other}")));
            }
        };
        Ok(Some(message))
    }
}

impl Encoder<GameMessage> for GameCodec {
    type Error = CodecError;

    fn encode(&mut self, message: GameMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let total_len = message.encoded_len();
        if total_len > self.max_frame_length {
            return Err(CodecError::FrameOverflow {
                declared: total_len,
                max: self.max_frame_length,
            });
        }
        dst.reserve(total_len);
        dst.put_u32(total_len as u32);
        match message {
            GameMessage::Request {
                protocol_id,
                seq_id,
                payload,
            } => {
                dst.put_u8(KIND_REQUEST);
                dst.put_u16(protocol_id);
                dst.put_u32(seq_id);
                dst.put_slice(&payload);
            }
            GameMessage::Response {
                protocol_id,
                seq_id,
                error_code,
                payload,
            } => {
                dst.put_u8(KIND_RESPONSE);
                dst.put_u16(protocol_id);
                dst.put_u32(seq_id);
                dst.put_u16(error_code.as_u16());
                dst.put_slice(&payload);
            }
            GameMessage::Push { push_type, payload } => {
                dst.put_u8(KIND_PUSH);
                dst.put_u16(push_type);
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Tests are allowed to use unwrap for simplicity
mod tests {
    use super::*;

    fn round_trip(message: GameMessage) -> GameMessage {
        let mut codec = GameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(message, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_request_round_trip() {
        let message = GameMessage::request(0x0101, 7, b"hello".to_vec());
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_response_round_trip_preserves_seq_and_code() {
        let message = GameMessage::Response {
            protocol_id: 0x0203,
            seq_id: 0xDEAD_BEEF,
            error_code: ErrorCode::NotEnoughCurrency,
            payload: b"{}".to_vec(),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_push_round_trip() {
        let message = GameMessage::push(0xF001, vec![1, 2, 3]);
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let message = GameMessage::request(0x0101, 0, Vec::new());
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_streaming_decode_over_arbitrary_splits() {
        let mut codec = GameCodec::default();
        let message = GameMessage::request(0x0102, 42, b"split me anywhere".to_vec());
        let mut encoded = BytesMut::new();
        codec.encode(message.clone(), &mut encoded).unwrap();
        let bytes = encoded.to_vec();

        // Feed one byte at a time; exactly one frame must come out, at the
        // very last byte.
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for (i, byte) in bytes.iter().enumerate() {
            buf.put_u8(*byte);
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                decoded.push((i, frame));
            }
        }
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0, bytes.len() - 1);
        assert_eq!(decoded[0].1, message);
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = GameCodec::default();
        let first = GameMessage::request(0x0101, 1, b"a".to_vec());
        let second = GameMessage::push(0xF001, b"b".to_vec());
        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_declared_length_is_rejected() {
        let mut codec = GameCodec::new(64);
        let mut buf = BytesMut::new();
        buf.put_u32(65);
        buf.put_slice(&[0u8; 61]);
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(CodecError::FrameOverflow { .. })));
    }

    #[test]
    fn test_oversized_message_is_not_encoded() {
        let mut codec = GameCodec::new(32);
        let message = GameMessage::request(0x0101, 1, vec![0u8; 64]);
        let mut buf = BytesMut::new();
        let result = codec.encode(message, &mut buf);
        assert!(matches!(result, Err(CodecError::FrameOverflow { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let mut codec = GameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(7);
        buf.put_u8(9); // no such kind
        buf.put_u16(0);
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_error_response_body_names_code() {
        let message = GameMessage::error_response(0x0202, 5, ErrorCode::TokenInvalid);
        let GameMessage::Response {
            error_code,
            payload,
            ..
        } = &message
        else {
            panic!("not a response");
        };
        assert_eq!(*error_code, ErrorCode::TokenInvalid);
        let body: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(body["code"], 201);
    }
}
