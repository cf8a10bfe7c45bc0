//! The frame multiplexer and scheduler.
//!
//! One multiplexer actor owns all protocol state of a connection: the
//! two-tier outbox, the icebox of fully-sent requests awaiting replies, the
//! reassembly maps for incoming messages, both codecs, and the transport
//! handle. Every mutation happens inside a thunk on the connection's
//! mailbox; delegate callbacks, progress notifications, and reply
//! resolutions are collected as effects and run after the state lock is
//! released.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use flate2::Compression;

use crate::{
    async_value::{Async, AsyncProvider},
    codec::{Deflater, Inflater},
    connection::{CompressionLevel, ConnectionDelegate, ConnectionOptions},
    error::BlipError,
    frame::{FrameBuf, FrameHeader, MessageNo, MessageType},
    mailbox::Mailbox,
    message::{
        MessageBuilder, MessageIn, MessageOut, MessageProgress, ProgressCallback, ProgressState,
        ReplyFailure, ReplyResult,
    },
    varint::{MAX_VARINT64_LEN, read_uvarint},
    websocket::{CloseCode, CloseStatus, WebSocket, WebSocketDelegate},
};

/// After this many consecutive urgent frames, one normal-tier frame is
/// scheduled so bulk traffic keeps moving.
const URGENT_YIELD_EVERY: u32 = 4;

/// Frame budgets below this are rounded up; a frame must hold the header,
/// the checksum, and room for the deflater to flush.
const MIN_FRAME_SIZE: usize = 2 * 1024;

/// Side effects produced under the state lock, run after it is released.
enum Effect {
    Progress(Arc<ProgressCallback>, MessageProgress),
    Request(Arc<MessageIn>),
    Response(Arc<MessageIn>),
    Resolve(AsyncProvider<ReplyResult>, ReplyResult),
    Closed(CloseStatus),
}

pub(crate) struct MuxState {
    options: ConnectionOptions,
    transport: Arc<dyn WebSocket>,
    delegate: Option<Arc<dyn ConnectionDelegate>>,
    urgent_queue: VecDeque<MessageOut>,
    normal_queue: VecDeque<MessageOut>,
    icebox: HashMap<MessageNo, MessageOut>,
    pending_requests: HashMap<MessageNo, Arc<MessageIn>>,
    pending_responses: HashMap<MessageNo, Arc<MessageIn>>,
    reply_providers: HashMap<MessageNo, AsyncProvider<ReplyResult>>,
    outgoing_number: u64,
    last_incoming_number: u64,
    deflater: Deflater,
    inflater: Inflater,
    connected: bool,
    writeable: bool,
    closed: bool,
    urgent_streak: u32,
    total_bytes_sent: u64,
    total_bytes_received: u64,
    connected_at: Option<Instant>,
}

/// Owning handle to a connection's multiplexer.
#[derive(Clone)]
pub(crate) struct Mux {
    mailbox: Mailbox,
    state: Arc<Mutex<MuxState>>,
    closed: Arc<AtomicBool>,
}

/// Non-owning handle held by [`MessageIn`] for sending responses. Weak, so
/// an application keeping a message alive does not keep the connection's
/// state alive.
#[derive(Clone)]
pub(crate) struct MuxRef {
    mailbox: Mailbox,
    state: Weak<Mutex<MuxState>>,
    closed: Arc<AtomicBool>,
}

impl MuxRef {
    fn upgrade(&self) -> Option<Mux> {
        Some(Mux {
            mailbox: self.mailbox.clone(),
            state: self.state.upgrade()?,
            closed: Arc::clone(&self.closed),
        })
    }

    pub(crate) fn queue_response(&self, number: MessageNo, builder: MessageBuilder) {
        let this = self.clone();
        self.mailbox.enqueue("mux.queue_response", move || {
            let Some(mux) = this.upgrade() else {
                return;
            };
            mux.with_state(|st, effects| {
                if st.closed {
                    return;
                }
                let allow = st.options.compression == CompressionLevel::Default;
                let msg = MessageOut::from_builder(builder, number, allow);
                enqueue_outgoing(st, msg, effects);
                mux.feed(st, effects);
            });
        });
    }
}

impl Mux {
    pub(crate) fn new(transport: Arc<dyn WebSocket>, options: ConnectionOptions) -> Self {
        let level = match options.compression {
            CompressionLevel::None => Compression::none(),
            CompressionLevel::Default => Compression::default(),
        };
        let state = MuxState {
            options,
            transport,
            delegate: None,
            urgent_queue: VecDeque::new(),
            normal_queue: VecDeque::new(),
            icebox: HashMap::new(),
            pending_requests: HashMap::new(),
            pending_responses: HashMap::new(),
            reply_providers: HashMap::new(),
            outgoing_number: 0,
            last_incoming_number: 0,
            deflater: Deflater::new(level),
            inflater: Inflater::new(),
            connected: false,
            writeable: false,
            closed: false,
            urgent_streak: 0,
            total_bytes_sent: 0,
            total_bytes_received: 0,
            connected_at: None,
        };
        Self {
            mailbox: Mailbox::new("blip"),
            state: Arc::new(Mutex::new(state)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register this multiplexer as the transport's delegate and open it.
    pub(crate) fn start(&self) {
        let transport = {
            let st = self.lock_state();
            Arc::clone(&st.transport)
        };
        transport.connect(Arc::new(TransportEvents {
            mux: self.downgrade(),
        }));
    }

    pub(crate) fn downgrade(&self) -> MuxRef {
        MuxRef {
            mailbox: self.mailbox.clone(),
            state: Arc::downgrade(&self.state),
            closed: Arc::clone(&self.closed),
        }
    }

    pub(crate) fn is_closed(&self) -> bool { self.closed.load(Ordering::SeqCst) }

    pub(crate) fn set_delegate(&self, delegate: Arc<dyn ConnectionDelegate>) {
        let mux = self.clone();
        self.mailbox.enqueue("mux.set_delegate", move || {
            let mut st = mux.lock_state();
            st.delegate = Some(delegate);
        });
    }

    /// Queue a request, returning the deferred reply.
    ///
    /// # Errors
    ///
    /// Returns [`BlipError::Closed`] once the connection has disconnected.
    pub(crate) fn send_request(
        &self,
        builder: MessageBuilder,
    ) -> Result<Async<ReplyResult>, BlipError> {
        if self.is_closed() {
            return Err(BlipError::Closed);
        }
        let provider = AsyncProvider::new();
        let value = provider.value();
        let mux = self.clone();
        self.mailbox.enqueue("mux.send_request", move || {
            mux.with_state(|st, effects| {
                if st.closed {
                    effects.push(Effect::Resolve(provider, Err(ReplyFailure::Disconnected)));
                    return;
                }
                st.outgoing_number += 1;
                let number = MessageNo(st.outgoing_number);
                let allow = st.options.compression == CompressionLevel::Default;
                let msg = MessageOut::from_builder(builder, number, allow);
                st.reply_providers.insert(number, provider);
                enqueue_outgoing(st, msg, effects);
                mux.feed(st, effects);
            });
        });
        Ok(value)
    }

    /// Ask the transport to close cleanly. The disconnect fanout happens
    /// when the transport reports the close back.
    pub(crate) fn close(&self, code: CloseCode, message: String) {
        let mux = self.clone();
        self.mailbox.enqueue("mux.close", move || {
            let st = mux.lock_state();
            if !st.closed {
                st.transport.close(code, &message);
            }
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_state<F: FnOnce(&mut MuxState, &mut Vec<Effect>)>(&self, f: F) {
        let mut effects = Vec::new();
        let delegate = {
            let mut st = self.lock_state();
            f(&mut st, &mut effects);
            st.delegate.clone()
        };
        run_effects(delegate, effects);
    }

    /// Transmit frames until the transport pushes back or nothing is
    /// eligible to send.
    fn feed(&self, st: &mut MuxState, effects: &mut Vec<Effect>) {
        while st.connected && st.writeable && !st.closed {
            let Some(mut msg) = next_message(st) else {
                break;
            };
            let frame_size = st.options.frame_size.max(MIN_FRAME_SIZE);
            let mut buf = FrameBuf::new(frame_size - MAX_VARINT64_LEN);
            let (flags, progress_state) = match msg.next_frame_to_send(&mut st.deflater, &mut buf)
            {
                Ok(frame) => frame,
                Err(err) => {
                    self.fail(st, err);
                    return;
                }
            };

            let mut out = BytesMut::with_capacity(MAX_VARINT64_LEN + buf.len());
            FrameHeader::new(msg.number(), flags).encode(&mut out);
            out.extend_from_slice(buf.as_slice());
            st.total_bytes_sent += out.len() as u64;
            if !st.transport.send(out.freeze(), true) {
                st.writeable = false;
            }

            if !msg.is_ack() {
                if let Some((callback, progress)) = msg.progress(progress_state) {
                    effects.push(Effect::Progress(callback, progress));
                }
            }
            self.route_after_send(st, msg, effects);
        }
    }

    /// Put a partially-sent message back in its tier, park a fully-sent
    /// request in the icebox, or let a finished message go.
    fn route_after_send(&self, st: &mut MuxState, msg: MessageOut, effects: &mut Vec<Effect>) {
        if msg.has_more_data() {
            if msg.urgent() {
                st.urgent_queue.push_back(msg);
            } else {
                st.normal_queue.push_back(msg);
            }
            return;
        }
        if msg.expects_reply() {
            if let Some(reply) = msg.create_response(Some(self.downgrade())) {
                let number = msg.number();
                st.pending_responses.insert(number, Arc::new(reply));
                st.icebox.insert(number, msg);
            }
            return;
        }
        if msg.message_type() == MessageType::Request {
            if let Some(provider) = st.reply_providers.remove(&msg.number()) {
                effects.push(Effect::Resolve(provider, Err(ReplyFailure::NoReply)));
            }
        }
    }

    /// Route one received transport frame.
    fn handle_frame(
        &self,
        st: &mut MuxState,
        bytes: &Bytes,
        effects: &mut Vec<Effect>,
    ) -> Result<(), BlipError> {
        st.total_bytes_received += bytes.len() as u64;
        let mut src: &[u8] = bytes;
        let header = FrameHeader::decode(&mut src)?;
        log::trace!(
            "received frame {} flags={:?} ({} bytes)",
            header.number,
            header.flags,
            bytes.len()
        );
        match header.flags.message_type() {
            MessageType::AckRequest | MessageType::AckResponse => {
                self.handle_ack(st, header, src)
            }
            MessageType::Request => self.handle_request_frame(st, header, src, effects),
            MessageType::Response | MessageType::Error => {
                self.handle_response_frame(st, header, src, effects)
            }
        }
    }

    fn handle_ack(
        &self,
        st: &mut MuxState,
        header: FrameHeader,
        mut body: &[u8],
    ) -> Result<(), BlipError> {
        let cumulative = read_uvarint(&mut body)?;
        let number = header.number;
        let acked = header.flags.message_type().acked_type();

        let queued = st
            .urgent_queue
            .iter_mut()
            .chain(st.normal_queue.iter_mut())
            .find(|msg| msg.number() == number && ack_matches(msg.message_type(), acked));
        if let Some(msg) = queued {
            msg.received_ack(cumulative);
            return Ok(());
        }
        if let Some(msg) = st.icebox.get_mut(&number) {
            if ack_matches(msg.message_type(), acked) {
                msg.received_ack(cumulative);
                return Ok(());
            }
        }

        // A number neither side has allocated is protocol corruption; an ack
        // for a message that already finished is a benign race.
        let allocated = match acked {
            Some(MessageType::Request) => number.0 <= st.outgoing_number,
            _ => number.0 <= st.last_incoming_number,
        };
        if allocated {
            log::debug!("ignoring ack for completed message {number}");
            Ok(())
        } else {
            Err(BlipError::UnknownAck(number))
        }
    }

    fn handle_request_frame(
        &self,
        st: &mut MuxState,
        header: FrameHeader,
        payload: &[u8],
        effects: &mut Vec<Effect>,
    ) -> Result<(), BlipError> {
        let number = header.number;
        let msg = if let Some(existing) = st.pending_requests.get(&number) {
            Arc::clone(existing)
        } else if number.0 == st.last_incoming_number + 1 {
            st.last_incoming_number = number.0;
            let msg = Arc::new(MessageIn::new(
                number,
                MessageType::Request,
                Some(self.downgrade()),
            ));
            st.pending_requests.insert(number, Arc::clone(&msg));
            msg
        } else {
            return Err(BlipError::OutOfOrderMessage(number));
        };

        let outcome =
            msg.received_frame(&mut st.inflater, payload, header.flags, st.options.ack_threshold)?;
        if let Some(received) = outcome.ack_bytes {
            queue_ack(st, MessageType::Request, number, received);
        }
        if outcome.complete {
            st.pending_requests.remove(&number);
            effects.push(Effect::Request(msg));
        }
        Ok(())
    }

    fn handle_response_frame(
        &self,
        st: &mut MuxState,
        header: FrameHeader,
        payload: &[u8],
        effects: &mut Vec<Effect>,
    ) -> Result<(), BlipError> {
        let number = header.number;
        let Some(msg) = st.pending_responses.get(&number).map(Arc::clone) else {
            // A response to a noreply request or to a finished exchange.
            log::warn!("ignoring unexpected response {number}");
            return Ok(());
        };

        let outcome =
            msg.received_frame(&mut st.inflater, payload, header.flags, st.options.ack_threshold)?;
        if let Some(received) = outcome.ack_bytes {
            queue_ack(st, MessageType::Response, number, received);
        }
        if outcome.complete {
            st.pending_responses.remove(&number);
            st.icebox.remove(&number);
            if let Some((callback, progress)) =
                msg.progress(ProgressState::Complete, Some(Arc::clone(&msg)))
            {
                effects.push(Effect::Progress(callback, progress));
            }
            if let Some(provider) = st.reply_providers.remove(&number) {
                effects.push(Effect::Resolve(provider, Ok(Arc::clone(&msg))));
            }
            effects.push(Effect::Response(msg));
        } else if let Some((callback, progress)) =
            msg.progress(ProgressState::ReceivingReply, None)
        {
            effects.push(Effect::Progress(callback, progress));
        }
        Ok(())
    }

    /// Tear down after a fatal protocol or internal error. The disconnect
    /// fanout follows when the transport confirms the close.
    fn fail(&self, st: &mut MuxState, err: BlipError) {
        log::error!("connection failing: {err}");
        st.writeable = false;
        let code = match err {
            BlipError::DataSourceFailed(_) | BlipError::CompressionOverflow => {
                CloseCode::UnexpectedCondition
            }
            _ => CloseCode::ProtocolError,
        };
        st.transport.close(code, &err.to_string());
    }

    /// Fan the disconnect out to every pending message and the delegate.
    fn disconnect(&self, st: &mut MuxState, status: CloseStatus, effects: &mut Vec<Effect>) {
        if st.closed {
            return;
        }
        st.closed = true;
        st.connected = false;
        st.writeable = false;
        self.closed.store(true, Ordering::SeqCst);

        for msg in st
            .urgent_queue
            .drain(..)
            .chain(st.normal_queue.drain(..))
            .chain(st.icebox.drain().map(|(_, msg)| msg))
        {
            if msg.expects_reply() {
                if let Some((callback, progress)) = msg.progress(ProgressState::Disconnected) {
                    effects.push(Effect::Progress(callback, progress));
                }
            }
        }
        for (_, msg) in st.pending_responses.drain() {
            if let Some((callback, progress)) = msg.progress(ProgressState::Disconnected, None) {
                effects.push(Effect::Progress(callback, progress));
            }
        }
        st.pending_requests.clear();
        for (_, provider) in st.reply_providers.drain() {
            effects.push(Effect::Resolve(provider, Err(ReplyFailure::Disconnected)));
        }

        let elapsed = st.connected_at.map(|at| at.elapsed());
        log::info!(
            "connection closed ({status}); sent {} bytes, received {} bytes, connected {:?}",
            st.total_bytes_sent,
            st.total_bytes_received,
            elapsed
        );
        effects.push(Effect::Closed(status));
    }
}

/// Transport delegate translating socket events into mailbox thunks. Holds
/// the weak handle: the transport must not keep a dropped connection's
/// state alive.
struct TransportEvents {
    mux: MuxRef,
}

impl WebSocketDelegate for TransportEvents {
    fn on_connect(&self) {
        let this = self.mux.clone();
        self.mux.mailbox.enqueue("mux.on_connect", move || {
            let Some(mux) = this.upgrade() else { return };
            mux.with_state(|st, effects| {
                st.connected = true;
                st.writeable = true;
                st.connected_at = Some(Instant::now());
                mux.feed(st, effects);
            });
        });
        let this = self.mux.clone();
        self.mux.mailbox.enqueue("mux.notify_connect", move || {
            let Some(mux) = this.upgrade() else { return };
            let delegate = mux.lock_state().delegate.clone();
            if let Some(delegate) = delegate {
                delegate.on_connect();
            }
        });
    }

    fn on_message(&self, message: Bytes, binary: bool) {
        if !binary {
            log::warn!("ignoring non-binary transport message");
            return;
        }
        let this = self.mux.clone();
        self.mux.mailbox.enqueue("mux.on_frame", move || {
            let Some(mux) = this.upgrade() else { return };
            mux.with_state(|st, effects| {
                if st.closed {
                    return;
                }
                match mux.handle_frame(st, &message, effects) {
                    Ok(()) => mux.feed(st, effects),
                    Err(err) => mux.fail(st, err),
                }
            });
        });
    }

    fn on_writeable(&self) {
        let this = self.mux.clone();
        self.mux.mailbox.enqueue("mux.on_writeable", move || {
            let Some(mux) = this.upgrade() else { return };
            mux.with_state(|st, effects| {
                st.writeable = true;
                mux.feed(st, effects);
            });
        });
    }

    fn on_close(&self, status: CloseStatus) {
        let this = self.mux.clone();
        self.mux.mailbox.enqueue("mux.on_close", move || {
            let Some(mux) = this.upgrade() else { return };
            mux.with_state(|st, effects| {
                mux.disconnect(st, status, effects);
            });
        });
    }
}

fn enqueue_outgoing(st: &mut MuxState, msg: MessageOut, effects: &mut Vec<Effect>) {
    if let Some((callback, progress)) = msg.progress(ProgressState::Queued) {
        effects.push(Effect::Progress(callback, progress));
    }
    if msg.urgent() {
        st.urgent_queue.push_back(msg);
    } else {
        st.normal_queue.push_back(msg);
    }
}

/// Acks jump the queue: they cost a few bytes and unblock the peer.
fn queue_ack(st: &mut MuxState, acked: MessageType, number: MessageNo, received: u64) {
    st.urgent_queue
        .push_front(MessageOut::new_ack(acked, number, received));
}

/// Pick the next message to transmit a frame for.
///
/// Urgent goes first, yielding one normal frame after every
/// `URGENT_YIELD_EVERY` urgent frames. Within a tier, messages whose
/// unacked window is full rotate to the tail and are skipped.
fn next_message(st: &mut MuxState) -> Option<MessageOut> {
    let max_unacked = st.options.max_unacked;
    let prefer_normal =
        st.urgent_streak >= URGENT_YIELD_EVERY && !st.normal_queue.is_empty();
    let order = if prefer_normal {
        [false, true]
    } else {
        [true, false]
    };
    for urgent_tier in order {
        let queue = if urgent_tier {
            &mut st.urgent_queue
        } else {
            &mut st.normal_queue
        };
        let mut chosen = None;
        for _ in 0..queue.len() {
            let Some(msg) = queue.pop_front() else { break };
            if msg.is_ack() || msg.unacked_bytes() < max_unacked {
                chosen = Some(msg);
                break;
            }
            queue.push_back(msg);
        }
        if let Some(msg) = chosen {
            if urgent_tier {
                st.urgent_streak += 1;
            } else {
                st.urgent_streak = 0;
            }
            return Some(msg);
        }
    }
    None
}

fn ack_matches(kind: MessageType, acked: Option<MessageType>) -> bool {
    match acked {
        Some(MessageType::Request) => kind == MessageType::Request,
        Some(MessageType::Response) => {
            matches!(kind, MessageType::Response | MessageType::Error)
        }
        _ => false,
    }
}

fn run_effects(delegate: Option<Arc<dyn ConnectionDelegate>>, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Progress(callback, progress) => callback(&progress),
            Effect::Request(msg) => match &delegate {
                Some(delegate) => delegate.on_request(msg),
                None => log::warn!("request {} dropped: no delegate", msg.number()),
            },
            Effect::Response(msg) => {
                if let Some(delegate) = &delegate {
                    delegate.on_response(msg);
                }
            }
            Effect::Resolve(provider, result) => provider.resolve(result),
            Effect::Closed(status) => {
                if let Some(delegate) = &delegate {
                    delegate.on_close(status);
                }
            }
        }
    }
}
