//! Frame codec for the control connection
//!
//! Frame layout: the magic prefix `i3-ipc`, a 4-byte little-endian payload
//! length, a 4-byte little-endian type tag, then exactly `length` bytes of
//! JSON payload. Decoding never consumes a partial frame; a corrupt magic
//! prefix is fatal and the connection must be closed.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{CommandKind, RawMessage, EVENT_FLAG, MAGIC};

/// Header: magic + length + type tag
pub const HEADER_SIZE: usize = MAGIC.len() + 8;

/// Maximum payload size (16 MB)
const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt magic prefix: {0:02x?}")]
    BadMagic([u8; 6]),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

impl CodecError {
    /// Whether the stream can still be read after this error. Only IO
    /// hiccups qualify; bad magic and oversized frames mean the framing
    /// is lost for good.
    pub fn is_framing(&self) -> bool {
        !matches!(self, CodecError::Io(_))
    }
}

/// An outbound command frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutFrame {
    pub kind: CommandKind,
    /// Raw payload text. Plain text for `run_command`, JSON for
    /// `subscribe`, empty for parameterless commands.
    pub payload: String,
}

impl OutFrame {
    pub fn new(kind: CommandKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Codec for control connection frames: encodes `OutFrame`, decodes
/// `RawMessage`
#[derive(Debug, Default)]
pub struct IpcCodec;

impl IpcCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for IpcCodec {
    type Item = RawMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Validate magic before anything else; a mismatch is fatal even if
        // the rest of the frame has not arrived.
        if &src[..MAGIC.len()] != MAGIC {
            let mut got = [0u8; 6];
            got.copy_from_slice(&src[..MAGIC.len()]);
            return Err(CodecError::BadMagic(got));
        }

        // Peek length and type tag without consuming
        let len = u32::from_le_bytes([src[6], src[7], src[8], src[9]]) as usize;
        let tag = u32::from_le_bytes([src[10], src[11], src[12], src[13]]);

        if len > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let data = src.split_to(len);

        let body: Value = if data.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&data)?
        };

        let msg = if tag & EVENT_FLAG != 0 {
            RawMessage::Event {
                code: tag & !EVENT_FLAG,
                body,
            }
        } else {
            RawMessage::Reply { code: tag, body }
        };
        Ok(Some(msg))
    }
}

impl Encoder<OutFrame> for IpcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: OutFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = item.payload.as_bytes();
        if body.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                size: body.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        dst.reserve(HEADER_SIZE + body.len());
        dst.put_slice(MAGIC);
        dst.put_u32_le(body.len() as u32);
        dst.put_u32_le(item.kind.code());
        dst.put_slice(body);
        Ok(())
    }
}

/// Encode an inbound-style frame (reply or event). Used by tests and by
/// anything mocking the window manager side of the connection.
pub fn encode_raw(tag: u32, body: &Value, dst: &mut BytesMut) {
    let payload = serde_json::to_vec(body).expect("value serialization cannot fail");
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_u32_le(tag);
    dst.put_slice(&payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(buf: &mut BytesMut) -> Vec<RawMessage> {
        let mut codec = IpcCodec::new();
        let mut out = Vec::new();
        while let Some(msg) = codec.decode(buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_command_frame_layout() {
        let mut codec = IpcCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(OutFrame::new(CommandKind::RunCommand, "exit"), &mut buf)
            .unwrap();

        assert_eq!(&buf[..6], b"i3-ipc");
        assert_eq!(u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]), 4);
        assert_eq!(u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]), 0);
        assert_eq!(&buf[14..], b"exit");
    }

    #[test]
    fn test_reply_roundtrip() {
        let mut buf = BytesMut::new();
        encode_raw(
            CommandKind::GetWorkspaces.code(),
            &json!([{"name": "1", "focused": true}]),
            &mut buf,
        );

        let msgs = decode_all(&mut buf);
        assert_eq!(msgs.len(), 1);
        assert_eq!(
            msgs[0],
            RawMessage::Reply {
                code: 1,
                body: json!([{"name": "1", "focused": true}]),
            }
        );
    }

    #[test]
    fn test_event_flag_demultiplexing() {
        let mut buf = BytesMut::new();
        encode_raw(EVENT_FLAG | 3, &json!({"change": "focus"}), &mut buf);

        let msgs = decode_all(&mut buf);
        assert_eq!(
            msgs[0],
            RawMessage::Event {
                code: 3,
                body: json!({"change": "focus"}),
            }
        );
    }

    #[test]
    fn test_partial_frame_consumes_nothing() {
        let mut codec = IpcCodec::new();
        let mut buf = BytesMut::new();
        encode_raw(0, &json!({"success": true}), &mut buf);
        let total = buf.len();

        // Feed one byte at a time; no progress until the frame completes
        let mut partial = BytesMut::new();
        for i in 0..total - 1 {
            partial.put_u8(buf[i]);
            let before = partial.len();
            assert!(codec.decode(&mut partial).unwrap().is_none());
            assert_eq!(partial.len(), before, "decode consumed a partial frame");
        }
        partial.put_u8(buf[total - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
        assert!(partial.is_empty());
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let mut codec = IpcCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(b"xx-ipc");
        buf.put_u32_le(0);
        buf.put_u32_le(0);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::BadMagic(_)));
        assert!(err.is_framing());
    }

    #[test]
    fn test_bad_magic_detected_before_full_frame() {
        // Corrupt magic with a huge claimed length: must error on the
        // header alone rather than waiting for payload bytes.
        let mut codec = IpcCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(b"not-i3");
        buf.put_u32_le(1_000_000);
        buf.put_u32_le(0);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::BadMagic(_))
        ));
    }

    #[test]
    fn test_payload_too_large() {
        let mut codec = IpcCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u32_le((MAX_PAYLOAD_SIZE + 1) as u32);
        buf.put_u32_le(0);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge { .. }));
        assert!(err.is_framing());
    }

    #[test]
    fn test_empty_payload_decodes_as_null() {
        let mut codec = IpcCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u32_le(0);
        buf.put_u32_le(7);

        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            RawMessage::Reply {
                code: 7,
                body: Value::Null,
            }
        );
    }

    #[test]
    fn test_invalid_json_payload() {
        let mut codec = IpcCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u32_le(3);
        buf.put_u32_le(0);
        buf.put_slice(b"{{{");

        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        encode_raw(2, &json!({"success": true}), &mut buf);
        encode_raw(EVENT_FLAG | 0, &json!({"change": "init"}), &mut buf);
        encode_raw(EVENT_FLAG | 7, &json!({"first": true}), &mut buf);

        let msgs = decode_all(&mut buf);
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[0], RawMessage::Reply { code: 2, .. }));
        assert!(matches!(msgs[1], RawMessage::Event { code: 0, .. }));
        assert!(matches!(msgs[2], RawMessage::Event { code: 7, .. }));
        assert!(buf.is_empty());
    }
}
