//! Error types for the protocol engine.

use thiserror::Error;

use crate::{codec::CodecError, frame::MessageNo, varint::VarintError};

/// Top-level error type for protocol, transport, and API misuse failures.
///
/// Protocol variants are fatal to the connection: the multiplexer closes the
/// transport with a protocol-error status and fans `Disconnected` out to
/// every pending message. API-misuse variants (`Closed`, `AlreadyResponded`,
/// `Incomplete`) affect only the calling operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BlipError {
    /// A length or header varint was malformed.
    #[error("malformed varint: {0}")]
    Varint(#[from] VarintError),

    /// Compression, decompression, or checksum verification failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The low bits of a frame header named an undefined message type.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// An initial frame's message number was not the successor of the last.
    #[error("message {0} arrived out of order")]
    OutOfOrderMessage(MessageNo),

    /// A non-ack frame was shorter than its checksum trailer.
    #[error("frame shorter than its checksum trailer")]
    TruncatedFrame,

    /// The declared property block did not fit in the message's first frame.
    #[error("property block of message {0} overruns its first frame")]
    PropertyBlockTooLong(MessageNo),

    /// An ack referenced a message number this side never allocated.
    #[error("ack for unknown message {0}")]
    UnknownAck(MessageNo),

    /// The pull data source of an outgoing message reported an error.
    #[error("message data source failed: {0}")]
    DataSourceFailed(#[source] std::io::Error),

    /// The deflater still held buffered output when a frame ended.
    #[error("compression buffer overflow")]
    CompressionOverflow,

    /// The connection has disconnected; no further messages can be sent.
    #[error("connection is closed")]
    Closed,

    /// A response was attempted on a message that already has one.
    #[error("message has already been responded to")]
    AlreadyResponded,

    /// The operation requires a completely received message.
    #[error("message is not complete")]
    Incomplete,
}

impl BlipError {
    /// Whether this error must tear the connection down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Closed | Self::AlreadyResponded | Self::Incomplete
        )
    }
}
