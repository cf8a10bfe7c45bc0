//! Multiplexed request/response messaging over a WebSocket-style stream.
//!
//! `blipwire` implements BLIP, a full-duplex protocol in which many
//! requests and responses interleave on one reliable byte stream. Each
//! message carries an ordered property list and an opaque binary body,
//! optionally deflate-compressed and optionally streamed from a pull
//! source. The engine provides ordered delivery, per-message flow control
//! through cumulative acks, two-tier priority scheduling, and per-frame
//! checksums.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use blipwire::{Connection, ConnectionOptions, MessageBuilder};
//! use blipwire::websocket::LoopbackWebSocket;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (socket, _peer) = LoopbackWebSocket::pair();
//! let connection = Connection::new(socket, ConnectionOptions::default());
//! let reply = connection
//!     .send_request(MessageBuilder::new().profile("echo").body(b"hi"))?
//!     .await?;
//! assert_eq!(&reply.body()[..], b"hi");
//! # Ok(())
//! # }
//! ```

pub mod async_value;
pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod mailbox;
pub mod message;
mod mux;
pub mod varint;
pub mod websocket;

pub use async_value::{Async, AsyncProvider};
pub use connection::{CompressionLevel, Connection, ConnectionDelegate, ConnectionOptions};
pub use error::BlipError;
pub use frame::{FrameFlags, MessageNo, MessageType};
pub use mailbox::{ChannelManifest, Mailbox};
pub use message::{
    MessageBuilder, MessageError, MessageIn, MessageProgress, ProgressState, Properties,
    ReplyFailure, ReplyResult,
};
pub use websocket::{CloseCode, CloseReason, CloseStatus};
