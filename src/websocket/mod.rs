//! The byte-stream transport contract and WebSocket implementations.
//!
//! The protocol engine consumes the [`WebSocket`] trait: connect, send with
//! backpressure, close with status, plus delegate events. Two
//! implementations ship here: [`FramedWebSocket`], which speaks RFC 6455
//! framing (with ping/pong, the close handshake, and a heartbeat) over a raw
//! socket seam, and [`LoopbackWebSocket`], an in-memory pair for tests and
//! same-process peers.

mod framing;
mod loopback;
mod socket;

use std::{fmt, time::Duration};

use bytes::Bytes;

pub use framing::{FrameDecoder, FramingError, Opcode, WsFrame, encode_frame};
pub use loopback::LoopbackWebSocket;
pub use socket::{FramedWebSocket, Role, SocketIo};

/// Subprotocol name offered during the HTTP upgrade.
pub const BLIP_SUBPROTOCOL: &str = "BLIP_3+CBMobile_2";

/// What layer reported a close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the WebSocket protocol (code is a [`CloseCode`] value).
    WebSocket,
    /// Closed by an IP socket error (code is an errno).
    Posix,
    /// Closed by another network-layer error.
    Network,
    /// Closed because the peer stopped answering keepalives.
    Timeout,
    /// Origin unknown.
    Unknown,
}

impl CloseReason {
    const fn name(self) -> &'static str {
        match self {
            Self::WebSocket => "WebSocket status",
            Self::Posix => "errno",
            Self::Network => "network error",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown error",
        }
    }
}

/// Standard WebSocket close codes (RFC 6455 §7.4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    UnsupportedData = 1003,
    /// Reserved: no status code was present.
    StatusCodeExpected = 1005,
    /// Reserved: the connection dropped without a close frame.
    Abnormal = 1006,
    InconsistentData = 1007,
    PolicyViolation = 1008,
    MessageTooBig = 1009,
    ExtensionNotNegotiated = 1010,
    UnexpectedCondition = 1011,
    FailedTlsHandshake = 1015,
}

impl CloseCode {
    /// The wire value.
    #[must_use]
    pub const fn code(self) -> u16 { self as u16 }
}

/// Why and how a connection closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseStatus {
    pub reason: CloseReason,
    pub code: u16,
    pub message: String,
}

impl CloseStatus {
    #[must_use]
    pub fn new(reason: CloseReason, code: u16, message: impl Into<String>) -> Self {
        Self {
            reason,
            code,
            message: message.into(),
        }
    }

    /// Whether this is an ordinary, expected close.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.reason == CloseReason::WebSocket
            && (self.code == CloseCode::Normal.code() || self.code == CloseCode::GoingAway.code())
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.reason.name(), self.code)?;
        if !self.message.is_empty() {
            write!(f, " '{}'", self.message)?;
        }
        Ok(())
    }
}

/// Timer settings for transports that run the WebSocket heartbeat.
#[derive(Clone, Debug)]
pub struct WebSocketOptions {
    /// Idle interval between keepalive PINGs.
    pub heartbeat: Duration,
    /// How long after a PING to wait for any inbound frame before failing
    /// the connection with a timeout.
    pub response_timeout: Duration,
    /// How long to wait for the peer to echo a CLOSE frame.
    pub close_timeout: Duration,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
            response_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// A connected message-oriented byte transport: in practice, a WebSocket.
pub trait WebSocket: Send + Sync {
    /// Install the delegate and open the transport. Events fire on an
    /// unspecified context; the protocol engine re-serializes them onto its
    /// own actor.
    fn connect(&self, delegate: std::sync::Arc<dyn WebSocketDelegate>);

    /// Send one message. Returns `false` when the send buffer has crossed
    /// its high-water mark; the caller should pause until
    /// [`WebSocketDelegate::on_writeable`].
    fn send(&self, message: Bytes, binary: bool) -> bool;

    /// Begin a clean close with `code` and `message`.
    fn close(&self, code: CloseCode, message: &str);
}

/// Events a [`WebSocket`] delivers to its owner.
pub trait WebSocketDelegate: Send + Sync {
    /// The HTTP upgrade response arrived.
    fn on_http_response(&self, _status: u16, _headers: &[(String, String)]) {}

    /// The transport is open for traffic.
    fn on_connect(&self) {}

    /// One complete message arrived.
    fn on_message(&self, message: Bytes, binary: bool);

    /// The send buffer drained below its high-water mark.
    fn on_writeable(&self) {}

    /// The transport closed.
    fn on_close(&self, status: CloseStatus);
}
