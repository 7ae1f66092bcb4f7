//! Wire framing for peer-to-peer streams.
//!
//! Every frame is a one-byte type tag, a four-byte big-endian payload
//! length, and a JSON payload of at most [`MAX_FRAME_SIZE`] bytes. The codec
//! is sans-io: encoding produces bytes, decoding consumes bytes pushed in by
//! whatever transport carries them.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreError, CoreResult};
use crate::message::{MessageType, MAX_FRAME_SIZE};

const HEADER_LEN: usize = 5;

/// A complete decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub tag: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Deserialize the JSON payload into a typed message.
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Encode a message into a single frame.
pub fn encode_frame<T: Serialize>(tag: MessageType, msg: &T) -> CoreResult<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CoreError::FrameTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(tag as u8);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Incremental frame decoder. Feed bytes with [`push`](FrameDecoder::push),
/// drain complete frames with [`next_frame`](FrameDecoder::next_frame).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, or `None` if more bytes are needed.
    ///
    /// An oversize declared length or an unknown tag poisons the stream and
    /// is returned as an error; callers are expected to close the connection.
    pub fn next_frame(&mut self) -> CoreResult<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = MessageType::from_u8(self.buf[0]).ok_or(CoreError::UnknownTag(self.buf[0]))?;
        let len =
            u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(CoreError::FrameTooLarge(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(Frame { tag, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{StatusRequest, MAX_FRAME_SIZE};

    #[test]
    fn test_encode_decode_round_trip() {
        let msg = StatusRequest {
            deployment_id: Some("dep-1".into()),
        };
        let bytes = encode_frame(MessageType::StatusRequest, &msg).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.tag, MessageType::StatusRequest);

        let decoded: StatusRequest = frame.decode().unwrap();
        assert_eq!(decoded.deployment_id.as_deref(), Some("dep-1"));
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_incremental_feed() {
        let msg = StatusRequest {
            deployment_id: None,
        };
        let bytes = encode_frame(MessageType::StatusRequest, &msg).unwrap();

        let mut decoder = FrameDecoder::new();
        for b in &bytes[..bytes.len() - 1] {
            decoder.push(std::slice::from_ref(b));
            assert!(decoder.next_frame().unwrap().is_none());
        }
        decoder.push(&bytes[bytes.len() - 1..]);
        assert!(decoder.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_two_frames_in_one_push() {
        let a = encode_frame(
            MessageType::StatusRequest,
            &StatusRequest {
                deployment_id: Some("a".into()),
            },
        )
        .unwrap();
        let b = encode_frame(
            MessageType::StatusRequest,
            &StatusRequest {
                deployment_id: Some("b".into()),
            },
        )
        .unwrap();

        let mut decoder = FrameDecoder::new();
        let mut joined = a.clone();
        joined.extend_from_slice(&b);
        decoder.push(&joined);

        let first: StatusRequest = decoder.next_frame().unwrap().unwrap().decode().unwrap();
        let second: StatusRequest = decoder.next_frame().unwrap().unwrap().decode().unwrap();
        assert_eq!(first.deployment_id.as_deref(), Some("a"));
        assert_eq!(second.deployment_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_oversize_length_rejected() {
        let mut decoder = FrameDecoder::new();
        let mut header = vec![MessageType::StatusRequest as u8];
        header.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        decoder.push(&header);
        assert!(matches!(
            decoder.next_frame(),
            Err(CoreError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0xff, 0, 0, 0, 0]);
        assert!(matches!(
            decoder.next_frame(),
            Err(CoreError::UnknownTag(0xff))
        ));
    }
}
