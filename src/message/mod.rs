//! Message model: builders, outgoing transmission state, and incoming
//! reassembly.
//!
//! A logical message is identified by `(message number, direction)` and
//! carries an ordered property list plus an opaque binary body, possibly
//! spread over many frames. [`MessageOut`] owns the sending side of one
//! message; [`MessageIn`] accumulates the receiving side and is shared with
//! the application once complete.

mod builder;
mod incoming;
mod outgoing;
mod properties;

use std::{io, sync::Arc};

pub use builder::MessageBuilder;
pub use incoming::MessageIn;
pub(crate) use outgoing::MessageOut;
pub use properties::Properties;
use thiserror::Error;

/// Pull-style source of body bytes for a streamed outgoing message.
///
/// The callback fills the provided buffer and returns how many bytes it
/// wrote; `Ok(0)` signals end of data. An error closes the connection.
pub type DataSource = Box<dyn FnMut(&mut [u8]) -> io::Result<usize> + Send>;

/// Delivery state reported through a progress callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressState {
    /// The request is queued for delivery.
    Queued,
    /// Frames are being transmitted.
    Sending,
    /// Fully sent; a reply is expected but has not completed.
    AwaitingReply,
    /// Reply frames are arriving.
    ReceivingReply,
    /// Delivery (and receipt, unless noreply) finished.
    Complete,
    /// The connection dropped before delivery or receipt completed.
    Disconnected,
}

/// Progress notification for an outgoing request.
#[derive(Clone)]
pub struct MessageProgress {
    pub state: ProgressState,
    /// Uncompressed bytes of the request sent so far.
    pub bytes_sent: u64,
    /// Raw bytes of the reply received so far.
    pub bytes_received: u64,
    /// The reply, once complete.
    pub reply: Option<Arc<MessageIn>>,
}

/// Callback observing an outgoing request's progress. Invoked on the
/// connection's actor.
pub type ProgressCallback = dyn Fn(&MessageProgress) + Send + Sync;

/// Error payload of an `Error`-type response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageError {
    /// Namespace of the error code, e.g. `"BLIP"` or `"HTTP"`.
    pub domain: String,
    pub code: i64,
    pub message: String,
}

impl MessageError {
    #[must_use]
    pub fn new(domain: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            code,
            message: message.into(),
        }
    }

    /// The canonical "nobody handled this request" error.
    #[must_use]
    pub fn not_handled() -> Self { Self::new("BLIP", 404, "Not Handled") }
}

/// Why a pending reply will never arrive.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ReplyFailure {
    /// The connection dropped before the reply completed.
    #[error("connection disconnected before the reply arrived")]
    Disconnected,
    /// The request was sent noreply; no response is tracked.
    #[error("request was sent noreply")]
    NoReply,
}

/// Resolution of a pending request: the reply message, or the reason none
/// will come. `Error`-type replies resolve as `Ok`; check
/// [`MessageIn::is_error`].
pub type ReplyResult = Result<Arc<MessageIn>, ReplyFailure>;
