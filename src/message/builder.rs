//! Builder for outgoing messages.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::{DataSource, MessageError, MessageProgress, ProgressCallback, properties};
use crate::frame::{FrameFlags, MessageType};

/// Assembles the properties, body, and delivery flags of an outgoing
/// message.
///
/// Builders are consumed by `Connection::send_request` or by the `respond`
/// family on [`MessageIn`](super::MessageIn).
#[derive(Default)]
pub struct MessageBuilder {
    properties: Vec<(String, String)>,
    body: BytesMut,
    urgent: bool,
    no_reply: bool,
    compressed: bool,
    message_type: Option<MessageType>,
    data_source: Option<DataSource>,
    on_progress: Option<Arc<ProgressCallback>>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Shorthand for setting the `Profile` property, which names the
    /// operation a request performs.
    #[must_use]
    pub fn profile(self, profile: impl Into<String>) -> Self {
        self.property("Profile", profile)
    }

    /// Append a property. Order is preserved on the wire.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn body(mut self, body: impl AsRef<[u8]>) -> Self {
        self.body.clear();
        self.body.extend_from_slice(body.as_ref());
        self
    }

    /// Append bytes to the body.
    #[must_use]
    pub fn append_body(mut self, chunk: impl AsRef<[u8]>) -> Self {
        self.body.extend_from_slice(chunk.as_ref());
        self
    }

    /// Schedule the message on the urgent priority tier.
    #[must_use]
    pub fn urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }

    /// Declare that no response is wanted. Meaningful on requests only.
    #[must_use]
    pub fn no_reply(mut self, no_reply: bool) -> Self {
        self.no_reply = no_reply;
        self
    }

    /// Deflate-compress the message's frames. Subject to the connection's
    /// compression option.
    #[must_use]
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Stream additional body bytes from a pull source after the in-memory
    /// body. The source is drained frame by frame until it reports EOF.
    #[must_use]
    pub fn data_source(mut self, source: DataSource) -> Self {
        self.data_source = Some(source);
        self
    }

    /// Observe delivery progress. The callback runs on the connection's
    /// actor.
    #[must_use]
    pub fn on_progress(mut self, callback: impl Fn(&MessageProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Turn this builder into an error response payload.
    #[must_use]
    pub(crate) fn for_error(error: &MessageError) -> Self {
        Self::new()
            .property("Error-Domain", error.domain.clone())
            .property("Error-Code", error.code.to_string())
            .body(error.message.as_bytes())
            .with_type(MessageType::Error)
    }

    #[must_use]
    pub(crate) fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub(crate) fn message_type(&self) -> MessageType {
        self.message_type.unwrap_or(MessageType::Request)
    }

    /// Frame flags for the first frame, before `MoreComing` is applied.
    /// `allow_compression` reflects the connection-level compression option.
    pub(crate) fn frame_flags(&self, allow_compression: bool) -> FrameFlags {
        FrameFlags::new(self.message_type())
            .with(FrameFlags::URGENT, self.urgent)
            .with(FrameFlags::NO_REPLY, self.no_reply)
            .with(
                FrameFlags::COMPRESSED,
                self.compressed && allow_compression,
            )
    }

    /// Encode the leading payload: varint-prefixed property block followed
    /// by the in-memory body.
    pub(crate) fn encode_payload(&self) -> Bytes {
        let mut payload = BytesMut::new();
        properties::encode_prefixed(&self.properties, &mut payload);
        payload.extend_from_slice(&self.body);
        payload.freeze()
    }

    pub(crate) fn take_parts(self) -> (Option<DataSource>, Option<Arc<ProgressCallback>>) {
        (self.data_source, self.on_progress)
    }
}
