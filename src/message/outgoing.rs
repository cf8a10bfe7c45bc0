//! Outgoing message transmission state.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use super::{
    DataSource, MessageBuilder, MessageProgress, ProgressCallback, ProgressState,
};
use crate::{
    codec::{CHECKSUM_SIZE, CodecMode, Deflater, SYNC_FLUSH_TRAILER},
    error::BlipError,
    frame::{FrameBuf, FrameFlags, MessageNo, MessageType},
    varint::write_uvarint,
};

/// Stop filling a frame once less than this much room remains. Leaves the
/// deflater space to complete its sync flush within the frame budget.
const FRAME_FILL_HEADROOM: usize = 1024;

/// Buffer size for pulls from a streaming data source.
const SOURCE_BUFFER_SIZE: usize = 16 * 1024;

/// The sending half of one message, owned exclusively by the multiplexer.
pub(crate) struct MessageOut {
    flags: FrameFlags,
    number: MessageNo,
    contents: Contents,
    bytes_sent: u64,
    unacked_bytes: u64,
    uncompressed_bytes_sent: u64,
    on_progress: Option<Arc<ProgressCallback>>,
}

impl MessageOut {
    /// Build a request or response message from a builder.
    pub(crate) fn from_builder(
        builder: MessageBuilder,
        number: MessageNo,
        allow_compression: bool,
    ) -> Self {
        let flags = builder.frame_flags(allow_compression);
        let payload = builder.encode_payload();
        let (data_source, on_progress) = builder.take_parts();
        Self {
            flags,
            number,
            contents: Contents::new(payload, data_source),
            bytes_sent: 0,
            unacked_bytes: 0,
            uncompressed_bytes_sent: 0,
            on_progress,
        }
    }

    /// Build an ack message: body is a single varint of the cumulative bytes
    /// received for the acked message.
    pub(crate) fn new_ack(acked: MessageType, number: MessageNo, received: u64) -> Self {
        let ack_type = acked.ack_type().unwrap_or(MessageType::AckRequest);
        let mut payload = BytesMut::new();
        write_uvarint(received, &mut payload);
        Self {
            flags: FrameFlags::new(ack_type)
                .with(FrameFlags::URGENT, true)
                .with(FrameFlags::NO_REPLY, true),
            number,
            contents: Contents::new(payload.freeze(), None),
            bytes_sent: 0,
            unacked_bytes: 0,
            uncompressed_bytes_sent: 0,
            on_progress: None,
        }
    }

    pub(crate) fn number(&self) -> MessageNo { self.number }

    pub(crate) fn message_type(&self) -> MessageType { self.flags.message_type() }

    pub(crate) fn is_ack(&self) -> bool { self.flags.is_ack() }

    pub(crate) fn urgent(&self) -> bool { self.flags.urgent() }

    pub(crate) fn no_reply(&self) -> bool { self.flags.no_reply() }

    /// Whether a response will arrive for this message.
    pub(crate) fn expects_reply(&self) -> bool {
        self.message_type() == MessageType::Request && !self.no_reply()
    }

    pub(crate) fn has_more_data(&self) -> bool { self.contents.has_more() }

    pub(crate) fn unacked_bytes(&self) -> u64 { self.unacked_bytes }

    #[cfg(test)]
    pub(crate) fn bytes_sent(&self) -> u64 { self.bytes_sent }

    pub(crate) fn uncompressed_bytes_sent(&self) -> u64 { self.uncompressed_bytes_sent }

    pub(crate) fn on_progress(&self) -> Option<Arc<ProgressCallback>> { self.on_progress.clone() }

    /// Fill `dst` with this message's next frame and return the frame's
    /// flags plus the progress state the send implies.
    ///
    /// Acks bypass the codec and carry no checksum. For everything else the
    /// payload is pulled through `codec` (deflating when the message is
    /// compressed) until the frame budget is nearly spent, then the
    /// sync-flush trailer is stripped and the running checksum appended.
    ///
    /// # Errors
    ///
    /// Returns [`BlipError::DataSourceFailed`] if the pull source errors,
    /// [`BlipError::CompressionOverflow`] if the deflater holds unflushed
    /// bytes at frame end, or a codec error.
    pub(crate) fn next_frame_to_send(
        &mut self,
        codec: &mut Deflater,
        dst: &mut FrameBuf,
    ) -> Result<(FrameFlags, ProgressState), BlipError> {
        let mut flags = self.flags;
        if self.is_ack() {
            let len = self.contents.payload.len();
            dst.put_slice(&self.contents.payload);
            self.contents.payload.advance(len);
            self.bytes_sent += len as u64;
            return Ok((flags, ProgressState::Complete));
        }

        let frame_start = dst.len();
        dst.reserve_trailer(CHECKSUM_SIZE);
        let mode = if flags.compressed() {
            CodecMode::SyncFlush
        } else {
            CodecMode::Raw
        };

        loop {
            let consumed = {
                let chunk = self.contents.data_to_send()?;
                if chunk.is_empty() {
                    break;
                }
                let mut view: &[u8] = chunk.as_ref();
                let consumed = codec.write(&mut view, dst, mode)?;
                chunk.advance(consumed);
                consumed
            };
            self.uncompressed_bytes_sent += consumed as u64;
            if consumed == 0 || dst.remaining() < FRAME_FILL_HEADROOM {
                break;
            }
        }

        if codec.unflushed_bytes() > 0 {
            return Err(BlipError::CompressionOverflow);
        }

        if mode == CodecMode::SyncFlush && dst.len() > frame_start {
            let len = dst.len();
            if len < frame_start + SYNC_FLUSH_TRAILER.len()
                || dst.as_slice()[len - SYNC_FLUSH_TRAILER.len()..] != SYNC_FLUSH_TRAILER
            {
                return Err(crate::codec::CodecError::MissingTrailer.into());
            }
            dst.truncate(len - SYNC_FLUSH_TRAILER.len());
        }

        dst.release_trailer(CHECKSUM_SIZE);
        codec.write_checksum(dst);

        let frame_len = (dst.len() - frame_start) as u64;
        self.bytes_sent += frame_len;
        self.unacked_bytes += frame_len;

        let state = if self.contents.has_more() {
            flags = flags.with(FrameFlags::MORE_COMING, true);
            ProgressState::Sending
        } else if flags.no_reply() {
            ProgressState::Complete
        } else {
            ProgressState::AwaitingReply
        };
        Ok((flags, state))
    }

    /// Placeholder for this request's eventual reply, carrying the request's
    /// progress callback and uncompressed size. Flags are finalized when the
    /// response's first frame arrives. `None` unless a reply is expected.
    pub(crate) fn create_response(&self, mux: Option<crate::mux::MuxRef>) -> Option<super::MessageIn> {
        if !self.expects_reply() {
            return None;
        }
        Some(super::MessageIn::pending_reply(
            self.number,
            mux,
            self.on_progress(),
            self.uncompressed_bytes_sent,
        ))
    }

    /// Record a cumulative ack from the peer. Never grows the unacked count.
    pub(crate) fn received_ack(&mut self, cumulative: u64) {
        if cumulative <= self.bytes_sent {
            self.unacked_bytes = self.unacked_bytes.min(self.bytes_sent - cumulative);
        }
    }

    /// Compose a progress event for this message, if anyone is listening.
    pub(crate) fn progress(
        &self,
        state: ProgressState,
    ) -> Option<(Arc<ProgressCallback>, MessageProgress)> {
        let callback = self.on_progress.clone()?;
        Some((
            callback,
            MessageProgress {
                state,
                bytes_sent: self.uncompressed_bytes_sent,
                bytes_received: 0,
                reply: None,
            },
        ))
    }
}

/// Body bytes still to send: the in-memory payload followed by pulls from an
/// optional streaming source.
struct Contents {
    payload: Bytes,
    pending: Bytes,
    data_source: Option<DataSource>,
}

impl Contents {
    fn new(payload: Bytes, data_source: Option<DataSource>) -> Self {
        Self {
            payload,
            pending: Bytes::new(),
            data_source,
        }
    }

    /// The next unsent chunk, refilled from the data source when the
    /// in-memory payload runs dry. Empty only when everything is sent.
    fn data_to_send(&mut self) -> Result<&mut Bytes, BlipError> {
        if !self.payload.is_empty() {
            return Ok(&mut self.payload);
        }
        if self.pending.is_empty() {
            if let Some(source) = &mut self.data_source {
                let mut buffer = vec![0u8; SOURCE_BUFFER_SIZE];
                match source(&mut buffer) {
                    Ok(0) => self.data_source = None,
                    Ok(n) => {
                        buffer.truncate(n);
                        self.pending = Bytes::from(buffer);
                    }
                    Err(err) => {
                        self.data_source = None;
                        return Err(BlipError::DataSourceFailed(err));
                    }
                }
            }
        }
        Ok(&mut self.pending)
    }

    fn has_more(&self) -> bool {
        !self.payload.is_empty() || !self.pending.is_empty() || self.data_source.is_some()
    }
}
