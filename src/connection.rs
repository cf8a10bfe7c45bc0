//! Public connection façade.

use std::{sync::Arc, time::Duration};

use crate::{
    async_value::Async,
    error::BlipError,
    message::{MessageBuilder, MessageIn, ReplyResult},
    mux::Mux,
    websocket::{CloseCode, CloseStatus, WebSocket},
};

/// Whether outgoing messages marked compressed actually deflate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressionLevel {
    /// Never compress; the `Compressed` flag on builders is ignored.
    None,
    /// Deflate at the default level.
    #[default]
    Default,
}

/// Tunables recognized by a [`Connection`].
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Idle interval between keepalive PINGs, for transports that run the
    /// heartbeat (see [`WebSocketOptions`](crate::websocket::WebSocketOptions)).
    pub heartbeat: Duration,
    /// Per-message cap on sent-but-unacknowledged bytes. A message at the
    /// cap is skipped by the scheduler until the peer acks.
    pub max_unacked: u64,
    /// Received-byte threshold past which an ack is sent for an incomplete
    /// incoming message.
    pub ack_threshold: u64,
    /// Target frame size in bytes, including header and checksum.
    pub frame_size: usize,
    /// Compression policy for outgoing messages.
    pub compression: CompressionLevel,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
            max_unacked: 128 * 1024,
            ack_threshold: 50_000,
            frame_size: 16 * 1024,
            compression: CompressionLevel::Default,
        }
    }
}

/// Application-side callbacks of a connection. All calls are made on the
/// connection's actor.
pub trait ConnectionDelegate: Send + Sync {
    /// The transport finished connecting.
    fn on_connect(&self) {}

    /// A complete incoming request. Respond through the message itself.
    fn on_request(&self, request: Arc<MessageIn>);

    /// A complete response. Rarely needed: responses also resolve the
    /// [`Async`] returned from [`Connection::send_request`].
    fn on_response(&self, _response: Arc<MessageIn>) {}

    /// The connection closed; every pending message has already been
    /// notified with `Disconnected`.
    fn on_close(&self, _status: CloseStatus) {}
}

/// A BLIP connection over a WebSocket-style transport.
///
/// Cheap to share behind an [`Arc`]; all methods enqueue work on the
/// connection's serial actor and return immediately.
pub struct Connection {
    mux: Mux,
}

impl Connection {
    /// Open a connection over `transport`. The delegate can be installed
    /// afterwards with [`set_delegate`](Self::set_delegate), but a delegate
    /// installed that way can miss events from a transport that connects
    /// instantly; prefer [`with_delegate`](Self::with_delegate) when
    /// handling incoming requests.
    #[must_use]
    pub fn new(transport: Arc<dyn WebSocket>, options: ConnectionOptions) -> Arc<Self> {
        let mux = Mux::new(transport, options);
        mux.start();
        Arc::new(Self { mux })
    }

    /// Open a connection with the delegate installed before any transport
    /// event can fire.
    #[must_use]
    pub fn with_delegate(
        transport: Arc<dyn WebSocket>,
        options: ConnectionOptions,
        delegate: Arc<dyn ConnectionDelegate>,
    ) -> Arc<Self> {
        let mux = Mux::new(transport, options);
        mux.set_delegate(delegate);
        mux.start();
        Arc::new(Self { mux })
    }

    /// Install or replace the delegate.
    pub fn set_delegate(&self, delegate: Arc<dyn ConnectionDelegate>) {
        self.mux.set_delegate(delegate);
    }

    /// Queue a request for delivery and return its deferred reply.
    ///
    /// The reply resolves with the response message (which may be an
    /// `Error`-type reply; check [`MessageIn::is_error`]), or with a
    /// [`ReplyFailure`](crate::message::ReplyFailure) when the request was
    /// noreply or the connection dropped first.
    ///
    /// # Errors
    ///
    /// Returns [`BlipError::Closed`] once the connection has disconnected.
    pub fn send_request(&self, request: MessageBuilder) -> Result<Async<ReplyResult>, BlipError> {
        self.mux.send_request(request)
    }

    /// Begin a clean close with the given status.
    pub fn close(&self, code: CloseCode, message: &str) {
        self.mux.close(code, message.to_owned());
    }

    /// Whether the connection has disconnected.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.mux.is_closed() }
}
