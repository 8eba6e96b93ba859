//! Wire format of the calbridge bridge.
//!
//! Both ends of a bridge exchange length-prefixed JSON frames:
//! - 4 bytes: payload length (u32, big-endian)
//! - N bytes: a JSON [`Envelope`] holding one [`Frame`]
//!
//! The UI end sends [`Frame::Request`]. The worker end answers with
//! [`Frame::Response`], pushes [`Frame::Broadcast`] events, and announces
//! its registered services with [`Frame::Ready`].
//!
//! ```rust
//! use calbridge_protocol::{Envelope, Frame, RequestFrame, decode_message, encode_message};
//!
//! let frame = Frame::Request(RequestFrame::new("req-1", "calendar", "getAccount", vec![]));
//! let bytes = encode_message(&Envelope::new(frame)).unwrap();
//! let decoded: Envelope = decode_message(&bytes).unwrap();
//! assert!(decoded.is_compatible());
//! ```

mod error;
mod framing;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FrameReader, FrameWriter, decode_message, encode_message};
pub use types::{
    BroadcastFrame, Envelope, ErrorCode, ErrorResponse, EventName, Frame, Outcome, RequestFrame,
    ResponseFrame,
};

/// Protocol version constant.
pub const PROTOCOL_VERSION: &str = "1";

/// Maximum frame payload size (1 MB).
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Service name answered by the bridge itself rather than a registered service.
pub const BRIDGE_SERVICE: &str = "bridge";
