//! Incoming message reassembly.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use super::{
    MessageBuilder, MessageError, MessageProgress, ProgressCallback, ProgressState, Properties,
};
use crate::{
    codec::{CHECKSUM_SIZE, CodecMode, Inflater, SYNC_FLUSH_TRAILER},
    error::BlipError,
    frame::{FrameFlags, MessageNo, MessageType},
    mux::MuxRef,
    varint::read_uvarint32,
};

/// What a received frame did to the message.
#[derive(Debug)]
pub(crate) struct FrameOutcome {
    /// The frame was the message's last.
    pub(crate) complete: bool,
    /// An ack is due, carrying this cumulative received byte count.
    pub(crate) ack_bytes: Option<u64>,
}

struct InState {
    flags: FrameFlags,
    got_first_frame: bool,
    properties: Properties,
    body: Vec<u8>,
    frozen_body: Option<Bytes>,
    raw_bytes_received: u64,
    unacked_bytes: u64,
    complete: bool,
    responded: bool,
    on_progress: Option<Arc<ProgressCallback>>,
}

/// The receiving half of one message.
///
/// Assembled by the multiplexer frame by frame, then shared with the
/// application: as a delivered request (respond through the `respond`
/// family) or as the resolution of a pending reply. Holds only a weak link
/// back to the connection, so an application keeping a message alive does
/// not keep the connection alive.
pub struct MessageIn {
    number: MessageNo,
    outgoing_size: u64,
    mux: Option<MuxRef>,
    state: Mutex<InState>,
}

impl MessageIn {
    /// A message whose first frame has yet to arrive.
    pub(crate) fn new(number: MessageNo, kind: MessageType, mux: Option<MuxRef>) -> Self {
        Self::build(number, kind, mux, None, 0)
    }

    /// Placeholder for the reply to a sent request. Flags are finalized by
    /// the first frame of the actual response, which may upgrade the type to
    /// `Error`.
    pub(crate) fn pending_reply(
        number: MessageNo,
        mux: Option<MuxRef>,
        on_progress: Option<Arc<ProgressCallback>>,
        outgoing_size: u64,
    ) -> Self {
        Self::build(number, MessageType::Response, mux, on_progress, outgoing_size)
    }

    fn build(
        number: MessageNo,
        kind: MessageType,
        mux: Option<MuxRef>,
        on_progress: Option<Arc<ProgressCallback>>,
        outgoing_size: u64,
    ) -> Self {
        Self {
            number,
            outgoing_size,
            mux,
            state: Mutex::new(InState {
                flags: FrameFlags::new(kind),
                got_first_frame: false,
                properties: Properties::default(),
                body: Vec::new(),
                frozen_body: None,
                raw_bytes_received: 0,
                unacked_bytes: 0,
                complete: false,
                responded: false,
                on_progress,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Message number, shared with the request for replies.
    #[must_use]
    pub fn number(&self) -> MessageNo { self.number }

    /// Whether every frame, including the final one, has been received.
    #[must_use]
    pub fn is_complete(&self) -> bool { self.lock().complete }

    /// Whether this is an `Error`-type response.
    #[must_use]
    pub fn is_error(&self) -> bool { self.lock().flags.message_type() == MessageType::Error }

    /// Whether the sender declined a response.
    #[must_use]
    pub fn no_reply(&self) -> bool { self.lock().flags.no_reply() }

    /// Whether the sender marked the message urgent.
    #[must_use]
    pub fn urgent(&self) -> bool { self.lock().flags.urgent() }

    /// The decoded property list.
    #[must_use]
    pub fn properties(&self) -> Properties { self.lock().properties.clone() }

    /// Value of one property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<String> {
        self.lock().properties.get(key).map(str::to_owned)
    }

    /// A property parsed as an integer.
    #[must_use]
    pub fn int_property(&self, key: &str) -> Option<i64> {
        self.lock().properties.get(key).and_then(|v| v.parse().ok())
    }

    /// A property parsed as a boolean (`"true"`/`"false"`, absent = false).
    #[must_use]
    pub fn bool_property(&self, key: &str) -> bool {
        self.lock()
            .properties
            .get(key)
            .is_some_and(|v| v == "true" || v == "1")
    }

    /// The `Profile` property naming the requested operation.
    #[must_use]
    pub fn profile(&self) -> Option<String> { self.property("Profile") }

    /// The body received so far; the full body once
    /// [`is_complete`](Self::is_complete) is true.
    #[must_use]
    pub fn body(&self) -> Bytes {
        let st = self.lock();
        match &st.frozen_body {
            Some(body) => body.clone(),
            None => Bytes::copy_from_slice(&st.body),
        }
    }

    /// The structured error of an `Error`-type response.
    #[must_use]
    pub fn get_error(&self) -> Option<MessageError> {
        if !self.is_error() {
            return None;
        }
        Some(MessageError {
            domain: self.property("Error-Domain").unwrap_or_default(),
            code: self.int_property("Error-Code").unwrap_or_default(),
            message: String::from_utf8_lossy(&self.body()).into_owned(),
        })
    }

    /// Send a response built from `builder`. The response inherits this
    /// request's urgency and reuses its message number.
    ///
    /// A no-op when the request was sent noreply.
    ///
    /// # Errors
    ///
    /// [`BlipError::Incomplete`] before the final frame arrived,
    /// [`BlipError::AlreadyResponded`] on a second response, or
    /// [`BlipError::Closed`] when the connection is gone.
    pub fn respond(&self, builder: MessageBuilder) -> Result<(), BlipError> {
        let builder = if builder.message_type() == MessageType::Request {
            builder.with_type(MessageType::Response)
        } else {
            builder
        };
        self.queue_reply(builder)
    }

    /// Send an empty default response, if a reply is expected.
    ///
    /// # Errors
    ///
    /// Same conditions as [`respond`](Self::respond).
    pub fn respond_default(&self) -> Result<(), BlipError> {
        self.respond(MessageBuilder::new())
    }

    /// Send `error` as the response.
    ///
    /// # Errors
    ///
    /// Same conditions as [`respond`](Self::respond).
    pub fn respond_with_error(&self, error: &MessageError) -> Result<(), BlipError> {
        self.queue_reply(MessageBuilder::for_error(error))
    }

    /// Respond that nobody handled this request.
    ///
    /// # Errors
    ///
    /// Same conditions as [`respond`](Self::respond).
    pub fn not_handled(&self) -> Result<(), BlipError> {
        self.respond_with_error(&MessageError::not_handled())
    }

    fn queue_reply(&self, builder: MessageBuilder) -> Result<(), BlipError> {
        let urgent = {
            let mut st = self.lock();
            if !st.complete {
                return Err(BlipError::Incomplete);
            }
            if st.flags.no_reply() {
                return Ok(());
            }
            if st.responded {
                return Err(BlipError::AlreadyResponded);
            }
            st.responded = true;
            st.flags.urgent()
        };
        let Some(mux) = &self.mux else {
            return Err(BlipError::Closed);
        };
        mux.queue_response(self.number, builder.urgent(urgent));
        Ok(())
    }

    /// Feed one frame's bytes (payload plus checksum trailer) through the
    /// shared receive codec and into this message.
    ///
    /// # Errors
    ///
    /// Any failure is a protocol error fatal to the connection: truncated
    /// frame, decompression failure, checksum mismatch, or a property block
    /// overrunning the first frame.
    pub(crate) fn received_frame(
        &self,
        codec: &mut Inflater,
        frame: &[u8],
        frame_flags: FrameFlags,
        ack_threshold: u64,
    ) -> Result<FrameOutcome, BlipError> {
        if frame.len() < CHECKSUM_SIZE {
            return Err(BlipError::TruncatedFrame);
        }
        let (payload, trailer) = frame.split_at(frame.len() - CHECKSUM_SIZE);
        let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);

        let mut decoded = Vec::new();
        if frame_flags.compressed() {
            let mut input = Vec::with_capacity(payload.len() + SYNC_FLUSH_TRAILER.len());
            input.extend_from_slice(payload);
            input.extend_from_slice(&SYNC_FLUSH_TRAILER);
            codec.read(&input, &mut decoded, CodecMode::SyncFlush)?;
        } else {
            codec.read(payload, &mut decoded, CodecMode::Raw)?;
        }
        codec.verify_checksum(expected)?;

        let mut st = self.lock();
        if st.got_first_frame {
            st.body.extend_from_slice(&decoded);
        } else {
            st.got_first_frame = true;
            st.flags = frame_flags.with(FrameFlags::MORE_COMING, false);
            let mut src: &[u8] = &decoded;
            let prop_len = read_uvarint32(&mut src)? as usize;
            if prop_len > src.len() {
                return Err(BlipError::PropertyBlockTooLong(self.number));
            }
            st.properties = Properties::from_block(Bytes::copy_from_slice(&src[..prop_len]));
            st.body.extend_from_slice(&src[prop_len..]);
        }

        st.raw_bytes_received += frame.len() as u64;
        st.unacked_bytes += frame.len() as u64;

        let mut ack_bytes = None;
        if st.unacked_bytes >= ack_threshold {
            ack_bytes = Some(st.raw_bytes_received);
            st.unacked_bytes = 0;
        }
        if !frame_flags.more_coming() {
            st.complete = true;
            st.frozen_body = Some(Bytes::from(std::mem::take(&mut st.body)));
        }
        Ok(FrameOutcome {
            complete: st.complete,
            ack_bytes,
        })
    }

    /// Compose a progress event for the request awaiting this reply.
    pub(crate) fn progress(
        &self,
        state: ProgressState,
        reply: Option<Arc<MessageIn>>,
    ) -> Option<(Arc<ProgressCallback>, MessageProgress)> {
        let st = self.lock();
        let callback = st.on_progress.clone()?;
        Some((
            callback,
            MessageProgress {
                state,
                bytes_sent: self.outgoing_size,
                bytes_received: st.raw_bytes_received,
                reply,
            },
        ))
    }
}

impl std::fmt::Debug for MessageIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("MessageIn")
            .field("number", &self.number)
            .field("flags", &st.flags)
            .field("complete", &st.complete)
            .field("bytes", &st.raw_bytes_received)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use flate2::Compression;

    use super::*;
    use crate::{
        codec::Deflater,
        frame::FrameBuf,
        message::{MessageOut, ProgressState},
    };

    const NO_ACK: u64 = u64::MAX;

    fn frames_of(builder: MessageBuilder, frame_size: usize) -> (Vec<(Vec<u8>, FrameFlags)>, u64) {
        let mut out = MessageOut::from_builder(builder, MessageNo(1), true);
        let mut deflater = Deflater::new(Compression::default());
        let mut frames = Vec::new();
        loop {
            let mut buf = FrameBuf::new(frame_size);
            let (flags, _) = out
                .next_frame_to_send(&mut deflater, &mut buf)
                .expect("frame encodes");
            let done = !flags.more_coming();
            frames.push((buf.as_slice().to_vec(), flags));
            if done {
                break;
            }
        }
        (frames, out.uncompressed_bytes_sent())
    }

    fn deliver(
        msg: &MessageIn,
        frames: &[(Vec<u8>, FrameFlags)],
        ack_threshold: u64,
    ) -> Vec<u64> {
        let mut inflater = Inflater::new();
        let mut acks = Vec::new();
        for (bytes, flags) in frames {
            let outcome = msg
                .received_frame(&mut inflater, bytes, *flags, ack_threshold)
                .expect("frame accepted");
            if let Some(bytes) = outcome.ack_bytes {
                acks.push(bytes);
            }
        }
        acks
    }

    #[test]
    fn single_frame_message_reassembles() {
        let (frames, _) = frames_of(
            MessageBuilder::new().profile("echo").body(b"hello"),
            16 * 1024,
        );
        assert_eq!(frames.len(), 1);

        let msg = MessageIn::new(MessageNo(1), MessageType::Request, None);
        deliver(&msg, &frames, NO_ACK);

        assert!(msg.is_complete());
        assert!(!msg.is_error());
        assert_eq!(msg.profile().as_deref(), Some("echo"));
        assert_eq!(&msg.body()[..], b"hello");
    }

    #[test]
    fn multi_frame_compressed_message_reassembles() {
        let body: Vec<u8> = (0u32..100_000).map(|i| (i % 77) as u8).collect();
        let (frames, _) = frames_of(
            MessageBuilder::new().body(&body).compressed(true),
            16 * 1024,
        );
        assert!(frames.len() > 1);
        for (_, flags) in &frames[..frames.len() - 1] {
            assert!(flags.more_coming());
        }

        let msg = MessageIn::new(MessageNo(1), MessageType::Request, None);
        deliver(&msg, &frames, NO_ACK);
        assert!(msg.is_complete());
        assert_eq!(&msg.body()[..], &body[..]);
    }

    #[test]
    fn acks_are_scheduled_past_the_threshold() {
        let body = vec![0xC3_u8; 120_000];
        let (frames, _) = frames_of(MessageBuilder::new().body(&body), 16 * 1024);

        let msg = MessageIn::new(MessageNo(1), MessageType::Request, None);
        let acks = deliver(&msg, &frames, 50_000);
        assert!(!acks.is_empty());
        // Cumulative counts are strictly increasing.
        assert!(acks.windows(2).all(|w| w[0] < w[1]));
        assert!(msg.is_complete());
    }

    #[test]
    fn corrupted_payload_fails_the_checksum() {
        let (mut frames, _) = frames_of(MessageBuilder::new().body(b"payload"), 16 * 1024);
        frames[0].0[2] ^= 0x01;

        let msg = MessageIn::new(MessageNo(1), MessageType::Request, None);
        let mut inflater = Inflater::new();
        let err = msg
            .received_frame(&mut inflater, &frames[0].0, frames[0].1, NO_ACK)
            .unwrap_err();
        assert!(matches!(
            err,
            BlipError::Codec(crate::codec::CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn reply_placeholder_adopts_error_type_from_first_frame() {
        let (frames, _) = frames_of(
            MessageBuilder::for_error(&MessageError::new("HTTP", 500, "boom")),
            16 * 1024,
        );
        let msg = MessageIn::pending_reply(MessageNo(1), None, None, 42);
        deliver(&msg, &frames, NO_ACK);

        assert!(msg.is_error());
        let error = msg.get_error().expect("error payload");
        assert_eq!(error.domain, "HTTP");
        assert_eq!(error.code, 500);
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn respond_requires_a_complete_message() {
        let msg = MessageIn::new(MessageNo(1), MessageType::Request, None);
        assert!(matches!(
            msg.respond_default(),
            Err(BlipError::Incomplete)
        ));
    }

    #[test]
    fn respond_to_noreply_request_is_a_noop() {
        let (frames, _) = frames_of(MessageBuilder::new().no_reply(true), 16 * 1024);
        let msg = MessageIn::new(MessageNo(1), MessageType::Request, None);
        deliver(&msg, &frames, NO_ACK);
        assert!(msg.no_reply());
        assert!(msg.respond_default().is_ok());
        assert!(msg.respond_default().is_ok());
    }

    #[test]
    fn progress_carries_reply_byte_counts() {
        let (frames, _) = frames_of(MessageBuilder::new().body(b"pong"), 16 * 1024);
        let msg = Arc::new(MessageIn::pending_reply(
            MessageNo(1),
            None,
            Some(Arc::new(|_| {})),
            77,
        ));
        deliver(&msg, &frames, NO_ACK);
        let (_, progress) = msg
            .progress(ProgressState::Complete, Some(Arc::clone(&msg)))
            .expect("callback registered");
        assert_eq!(progress.state, ProgressState::Complete);
        assert_eq!(progress.bytes_sent, 77);
        assert!(progress.bytes_received > 0);
        assert!(progress.reply.is_some());
    }
}
