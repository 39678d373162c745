//! Protocol library for the USB passthrough broker
//!
//! This crate defines the wire protocol spoken between the control client and
//! the broker that owns USB passthrough decisions: newline-delimited JSON
//! objects over a stream socket. It provides the request set, a typed view of
//! broker replies and pushes, the raw device shape and the framing codec.
//!
//! # Example
//!
//! ```
//! use protocol::{FrameDecoder, Request, encode_frame};
//!
//! // Encode a request
//! let bytes = encode_frame(&Request::UsbList).unwrap();
//! assert!(bytes.ends_with(b"\n"));
//!
//! // Decode what the broker sent back
//! let mut decoder = FrameDecoder::new();
//! decoder.feed(b"{\"result\":\"ok\",\"usb_devices\":[]}\n");
//! let reply = decoder.next_frame().unwrap().unwrap();
//! assert!(reply.is_ok());
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{FRAME_DELIMITER, FrameDecoder, READ_CHUNK_SIZE, decode_frame, encode_frame};

#[cfg(feature = "async")]
pub use codec::{read_frame_async, write_frame_async};
pub use error::{ProtocolError, Result};
pub use messages::{Event, Frame, Message, RESULT_OK, Request, events};
pub use types::{DeviceList, RawDevice};
