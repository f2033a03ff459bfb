//! # parley-protocol
//!
//! Wire protocol definitions for the Parley conversation server.
//!
//! This crate defines the frames exchanged between a client connection and
//! the server, the codec used to put them on the wire, and the small set of
//! vocabulary types (topics, operations, error codes) shared with the core.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake carrying the session identity
//! - `Subscribe` / `Unsubscribe` - Live event streams
//! - `Request` / `Reply` - State transitions and queries
//! - `Event` / `Closed` - Delivered events and stream termination
//! - `Ack` / `Error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Frame, Topic};
//!
//! let frame = Frame::subscribe(1, Topic::ConversationUpdated, None);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{codes, is_compatible, Frame, FrameType, Operation, Topic, PROTOCOL_VERSION};
