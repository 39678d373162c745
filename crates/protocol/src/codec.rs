//! Newline-delimited JSON framing
//!
//! # Frame Format
//!
//! ```text
//! {"action":"usb_list"}\n
//! {"result":"ok","usb_devices":[...]}\n
//! ```
//!
//! Every frame is one JSON object followed by a single `\n`. serde_json
//! escapes newlines inside strings, so the delimiter never appears inside a
//! frame. Receiving is done through [`FrameDecoder`], which accumulates bytes
//! and hands out complete frames in arrival order while carrying any partial
//! tail over to the next read.

use crate::error::{ProtocolError, Result};
use crate::messages::Frame;
use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde_json::Value;

#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Byte terminating every frame
pub const FRAME_DELIMITER: u8 = b'\n';

/// Read chunk size used by the async helpers
pub const READ_CHUNK_SIZE: usize = 4096;

/// Encode a value as one frame (JSON + newline)
///
/// # Example
/// ```
/// use protocol::{Request, encode_frame};
///
/// let bytes = encode_frame(&Request::UsbList).unwrap();
/// assert_eq!(bytes, b"{\"action\":\"usb_list\"}\n");
/// ```
pub fn encode_frame<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(FRAME_DELIMITER);
    Ok(bytes)
}

/// Decode a single line (without its delimiter) into a frame
///
/// Anything that is not a JSON object is a framing error.
pub fn decode_frame(line: &[u8]) -> Result<Frame> {
    match serde_json::from_slice::<Value>(line) {
        Ok(Value::Object(map)) => Ok(Frame::from(map)),
        Ok(other) => Err(ProtocolError::framing(
            format!("expected a JSON object, got {}", json_kind(&other)),
            line,
        )),
        Err(e) => Err(ProtocolError::framing(e, line)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Accumulating frame decoder
///
/// Feed it bytes as they arrive and pull frames out with
/// [`next_frame`](Self::next_frame). A malformed line yields one error and is
/// dropped; the frames after it are still returned.
///
/// # Example
/// ```
/// use protocol::FrameDecoder;
///
/// let mut decoder = FrameDecoder::new();
/// decoder.feed(b"{\"result\":\"ok\"}\n{\"event\":");
/// let frame = decoder.next_frame().unwrap().unwrap();
/// assert!(frame.is_ok());
/// assert!(decoder.next_frame().is_none());
///
/// decoder.feed(b"\"usb_attached\"}\n");
/// let frame = decoder.next_frame().unwrap().unwrap();
/// assert_eq!(frame.event(), Some("usb_attached"));
/// ```
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: Option<usize>,
    /// Bytes up to the next delimiter belong to an oversized frame
    discarding: bool,
}

impl FrameDecoder {
    /// Create a decoder without a frame size limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder rejecting frames longer than `max` bytes
    pub fn with_max_frame_size(max: usize) -> Self {
        Self {
            max_frame_size: Some(max),
            ..Self::default()
        }
    }

    /// Append received bytes to the buffer
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any buffered residue
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    /// Pop the next complete frame
    ///
    /// Returns `None` when no complete line is buffered. Blank lines are
    /// skipped.
    pub fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == FRAME_DELIMITER) else {
                return self.check_partial();
            };

            let line = self.buffer.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }

            let line = &line[..pos];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            if let Some(max) = self.max_frame_size
                && line.len() > max
            {
                return Some(Err(ProtocolError::FrameTooLarge {
                    size: line.len(),
                    max,
                }));
            }

            return Some(decode_frame(line));
        }
    }

    /// Enforce the size limit on an incomplete tail
    fn check_partial(&mut self) -> Option<Result<Frame>> {
        if self.discarding {
            self.buffer.clear();
            return None;
        }

        match self.max_frame_size {
            Some(max) if self.buffer.len() > max => {
                let size = self.buffer.len();
                self.buffer.advance(size);
                self.discarding = true;
                Some(Err(ProtocolError::FrameTooLarge { size, max }))
            }
            _ => None,
        }
    }

    /// Pop every complete frame currently buffered, in order
    pub fn extract(&mut self) -> Vec<Result<Frame>> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }
}

/// Async: write one frame and flush
#[cfg(feature = "async")]
pub async fn write_frame_async<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let bytes = encode_frame(value)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Async: read until the decoder yields a frame
///
/// Returns `Ok(None)` once the reader reaches end of stream with no complete
/// frame buffered. Framing errors are returned as they occur; the decoder
/// keeps its state, so calling again continues with the next frame.
#[cfg(feature = "async")]
pub async fn read_frame_async<R>(reader: &mut R, decoder: &mut FrameDecoder) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        if let Some(frame) = decoder.next_frame() {
            return frame.map(Some);
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        decoder.feed(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Request;
    use serde_json::json;

    fn frame(value: Value) -> Frame {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_encode_appends_single_newline() {
        let bytes = encode_frame(&Request::EnableNotifications).unwrap();
        assert_eq!(bytes.last(), Some(&FRAME_DELIMITER));
        assert_eq!(bytes.iter().filter(|&&b| b == FRAME_DELIMITER).count(), 1);
    }

    #[test]
    fn test_encode_escapes_embedded_newlines() {
        let bytes = encode_frame(&json!({"product_name": "line one\nline two"})).unwrap();
        assert_eq!(bytes.iter().filter(|&&b| b == FRAME_DELIMITER).count(), 1);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded.get("product_name").unwrap(), "line one\nline two");
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let first = frame(json!({"result": "ok"}));
        let second = frame(json!({"event": "usb_attached", "vm": "vmA"}));

        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let frames: Vec<Frame> = decoder.extract().into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(frames, vec![first, second]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"{\"result\":");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 10);

        decoder.feed(b"\"ok\"}\n{\"ev");
        assert!(decoder.next_frame().unwrap().unwrap().is_ok());
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 4);
    }

    #[test]
    fn test_malformed_frame_does_not_stop_decoding() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"{\"result\":\"ok\"}\nnot json\n{\"event\":\"usb_detached\"}\n");

        let results = decoder.extract();
        assert_eq!(results.len(), 3);
        assert!(results[0].as_ref().unwrap().is_ok());
        assert!(matches!(results[1], Err(ProtocolError::Framing { .. })));
        assert_eq!(results[2].as_ref().unwrap().event(), Some("usb_detached"));
    }

    #[test]
    fn test_non_object_json_is_framing_error() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"[1,2,3]\n\"ok\"\n");
        let results = decoder.extract();
        assert_eq!(results.len(), 2);
        for result in results {
            let Err(ProtocolError::Framing { reason, .. }) = result else {
                panic!("Expected framing error, got {:?}", result);
            };
            assert!(reason.contains("expected a JSON object"));
        }
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"\n\r\n{\"result\":\"ok\"}\r\n");
        let results = decoder.extract();
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap().is_ok());
    }

    #[test]
    fn test_max_frame_size_complete_line() {
        let mut decoder = FrameDecoder::with_max_frame_size(16);
        decoder.feed(b"{\"result\":\"a-very-long-result\"}\n{\"result\":\"ok\"}\n");

        let results = decoder.extract();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(ProtocolError::FrameTooLarge { max: 16, .. })
        ));
        assert!(results[1].as_ref().unwrap().is_ok());
    }

    #[test]
    fn test_max_frame_size_discards_oversized_tail() {
        let mut decoder = FrameDecoder::with_max_frame_size(8);
        decoder.feed(b"{\"result\":\"a-very-");
        assert!(matches!(
            decoder.next_frame(),
            Some(Err(ProtocolError::FrameTooLarge { .. }))
        ));
        assert_eq!(decoder.buffered(), 0);

        decoder.feed(b"long\"}\n{\"a\":1}\n");
        let results = decoder.extract();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().get("a").unwrap(), 1);
    }

    #[test]
    fn test_clear_drops_residue() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"{\"partial\":");
        decoder.clear();
        decoder.feed(b"{\"result\":\"ok\"}\n");
        assert!(decoder.next_frame().unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_write_then_read_async() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_frame_async(&mut client, &Request::UsbList).await.unwrap();
        write_frame_async(&mut client, &Request::EnableNotifications)
            .await
            .unwrap();
        drop(client);

        let mut decoder = FrameDecoder::new();
        let first = read_frame_async(&mut server, &mut decoder).await.unwrap().unwrap();
        assert_eq!(first.get("action").unwrap(), "usb_list");
        let second = read_frame_async(&mut server, &mut decoder).await.unwrap().unwrap();
        assert_eq!(second.get("action").unwrap(), "enable_notifications");
        assert!(read_frame_async(&mut server, &mut decoder).await.unwrap().is_none());
    }
}
