//! Frame Codec
//!
//! Each application message is JSON followed by a single `0x0A` byte.
//! The codec buffers partial reads, splits on the delimiter and drops empty
//! frames. It never fails on frame *content*: decoding a frame into a
//! [`WireMessage`] is a separate step, so one malformed frame cannot tear
//! down the connection it arrived on.
//!
//! Usable sans-IO through [`FrameCodec::feed`]/[`FrameCodec::next_frame`]
//! (notification payloads) or as a `tokio_util` codec (byte streams).

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::config::DEFAULT_MAX_FRAME_LEN;
use crate::sync::WireMessage;

pub const FRAME_DELIMITER: u8 = b'\n';

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame too large: {size} bytes")]
    TooLarge { size: usize },
}

/// Delimiter framing with an upper bound on frame size
#[derive(Debug)]
pub struct FrameCodec {
    /// Sans-IO buffer (unused when driven by `FramedRead`)
    buffer: BytesMut,
    max_frame_len: usize,
    /// Skipping the rest of an oversized frame
    discarding: bool,
    /// Oversized frames dropped so far
    discarded: u64,
    /// Bytes already searched for a delimiter
    scan_from: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_len,
            discarding: false,
            discarded: 0,
            scan_from: 0,
        }
    }

    /// Append raw bytes
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete, non-empty frame (without the delimiter)
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let mut buffer = std::mem::take(&mut self.buffer);
        let frame = self.split_frame(&mut buffer);
        self.buffer = buffer;
        frame
    }

    /// Number of oversized frames dropped
    pub fn discarded_frames(&self) -> u64 {
        self.discarded
    }

    /// Bytes buffered but not yet framed
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn split_frame(&mut self, src: &mut BytesMut) -> Option<Bytes> {
        loop {
            let start = self.scan_from.min(src.len());
            let Some(offset) = src[start..].iter().position(|b| *b == FRAME_DELIMITER) else {
                if src.len() > self.max_frame_len {
                    if !self.discarding {
                        debug!("Frame: dropping oversized frame ({} bytes so far)", src.len());
                        self.discarding = true;
                    }
                    src.clear();
                    self.scan_from = 0;
                } else {
                    self.scan_from = src.len();
                }
                return None;
            };

            let end = start + offset;
            let mut line = src.split_to(end + 1);
            line.truncate(end);
            self.scan_from = 0;

            if self.discarding {
                self.discarding = false;
                self.discarded += 1;
                continue;
            }
            if line.len() > self.max_frame_len {
                debug!("Frame: dropping oversized frame ({} bytes)", line.len());
                self.discarded += 1;
                continue;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(line.freeze());
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        Ok(self.split_frame(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if let Some(frame) = self.split_frame(src) {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            debug!("Frame: {} trailing bytes without delimiter at EOF", src.len());
            src.clear();
        }
        self.scan_from = 0;
        self.discarding = false;
        Ok(None)
    }
}

impl Encoder<WireMessage> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), FrameError> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > self.max_frame_len {
            return Err(FrameError::TooLarge { size: json.len() });
        }
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(FRAME_DELIMITER);
        Ok(())
    }
}

/// Encode a message as one delimited frame
pub fn encode_message(message: &WireMessage) -> Result<Vec<u8>, FrameError> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(FRAME_DELIMITER);
    Ok(bytes)
}

/// Decode one frame (delimiter optional)
pub fn decode_message(frame: &[u8]) -> Result<WireMessage, FrameError> {
    let frame = frame.strip_suffix(&[FRAME_DELIMITER]).unwrap_or(frame);
    Ok(serde_json::from_slice(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{ControlAck, TimerAction, TimerMessage, TimerPhase};
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;
    use uuid::Uuid;

    fn ack(seq: u64) -> WireMessage {
        WireMessage::Ack(ControlAck {
            action_seq: seq,
            sender_id: Uuid::nil(),
        })
    }

    #[test]
    fn test_encoded_frame_is_json_plus_newline() {
        let bytes = encode_message(&ack(3)).unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        let json: serde_json::Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["actionSeq"], 3);
    }

    #[test]
    fn test_partial_reads_reassemble() {
        let mut bytes = encode_message(&ack(1)).unwrap();
        bytes.extend(encode_message(&ack(2)).unwrap());

        let mut codec = FrameCodec::new();
        let (a, b) = bytes.split_at(7);
        codec.feed(a);
        assert!(codec.next_frame().is_none());
        codec.feed(b);

        let first = decode_message(&codec.next_frame().unwrap()).unwrap();
        let second = decode_message(&codec.next_frame().unwrap()).unwrap();
        assert_eq!(first, ack(1));
        assert_eq!(second, ack(2));
        assert!(codec.next_frame().is_none());
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_empty_frames_are_skipped() {
        let mut codec = FrameCodec::new();
        codec.feed(b"\n\n  \n");
        codec.feed(&encode_message(&ack(9)).unwrap());
        codec.feed(b"\n");
        let frame = codec.next_frame().unwrap();
        assert_eq!(decode_message(&frame).unwrap(), ack(9));
        assert!(codec.next_frame().is_none());
    }

    #[test]
    fn test_oversized_frame_discarded_then_resyncs() {
        // Room for an ack frame (about 80 bytes) but not the junk run
        let mut codec = FrameCodec::with_max_frame_len(128);
        codec.feed(&[b'x'; 200]);
        assert!(codec.next_frame().is_none());
        assert_eq!(codec.buffered_len(), 0);
        codec.feed(&[b'y'; 30]);
        codec.feed(b"\n");
        codec.feed(&encode_message(&ack(4)).unwrap());

        let frame = codec.next_frame().unwrap();
        assert_eq!(decode_message(&frame).unwrap(), ack(4));
        assert_eq!(codec.discarded_frames(), 1);
    }

    #[test]
    fn test_malformed_frame_is_a_decode_error_not_a_framing_error() {
        let mut codec = FrameCodec::new();
        codec.feed(b"{\"type\":\"bogus\"}\n");
        codec.feed(&encode_message(&ack(5)).unwrap());

        let bad = codec.next_frame().unwrap();
        assert!(matches!(decode_message(&bad), Err(FrameError::Malformed(_))));
        let good = codec.next_frame().unwrap();
        assert_eq!(decode_message(&good).unwrap(), ack(5));
    }

    #[test]
    fn test_encoder_rejects_oversized_message() {
        let mut codec = FrameCodec::with_max_frame_len(16);
        let mut dst = BytesMut::new();
        let msg = WireMessage::Timer(TimerMessage::new(TimerAction::Start, TimerPhase::Running, 0, 0));
        assert!(matches!(
            codec.encode(msg, &mut dst),
            Err(FrameError::TooLarge { .. })
        ));
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn test_framed_read_over_stream() {
        let mut wire = Vec::new();
        for seq in 0..3 {
            wire.extend(encode_message(&ack(seq)).unwrap());
        }
        wire.extend_from_slice(b"{\"type\":\"ack\"");

        let frames: Vec<Bytes> = FramedRead::new(&wire[..], FrameCodec::new())
            .filter_map(|r| async move { r.ok() })
            .collect()
            .await;

        // The unterminated tail is dropped at EOF
        assert_eq!(frames.len(), 3);
        assert_eq!(decode_message(&frames[2]).unwrap(), ack(2));
    }
}
