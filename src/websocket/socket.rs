//! Transport-agnostic WebSocket protocol handling.
//!
//! [`FramedWebSocket`] layers RFC 6455 framing, ping/pong, the close
//! handshake, and a keepalive heartbeat over a raw byte socket supplied
//! through the [`SocketIo`] seam. It neither dials nor performs the HTTP
//! upgrade; the socket owner does both and then drives this type with
//! received bytes, write completions, and the final socket teardown.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, Weak,
    atomic::{AtomicU64, Ordering},
};

use bytes::{Bytes, BytesMut};

use super::{
    CloseCode, CloseReason, CloseStatus, WebSocket, WebSocketDelegate, WebSocketOptions,
    framing::{
        FrameDecoder, Opcode, WsFrame, decode_close_payload, encode_close_payload, encode_frame,
    },
};
use crate::mailbox::Mailbox;

/// Send-buffer high-water mark; `send` reports backpressure beyond it.
pub(crate) const SEND_BUFFER_SIZE: usize = 32 * 1024;

/// Raw byte sink under a [`FramedWebSocket`].
pub trait SocketIo: Send + Sync {
    /// Queue already-framed bytes for transmission. The socket owner calls
    /// [`FramedWebSocket::on_write_complete`] as they flush.
    fn send_bytes(&self, bytes: Bytes);

    /// Tear the socket down. The owner must eventually call
    /// [`FramedWebSocket::on_socket_closed`].
    fn close_socket(&self);
}

/// Which side of the connection this endpoint is. Clients mask outgoing
/// frames; servers do not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

struct FramedState {
    delegate: Option<Arc<dyn WebSocketDelegate>>,
    decoder: FrameDecoder,
    inbox: BytesMut,
    partial: Option<(Opcode, BytesMut)>,
    buffered_bytes: usize,
    connected: bool,
    close_sent: bool,
    close_received: bool,
    close_payload: Option<Bytes>,
    bytes_sent: u64,
    bytes_received: u64,
}

/// Deliveries collected under the lock and run after it drops.
enum Deliver {
    Message(Bytes, bool),
    Pong(Bytes),
    Writeable,
    Disconnect,
}

/// RFC 6455 protocol state over a raw socket.
pub struct FramedWebSocket<S: SocketIo> {
    socket: Arc<S>,
    role: Role,
    options: WebSocketOptions,
    mailbox: Mailbox,
    weak: Weak<Self>,
    state: Mutex<FramedState>,
    /// Bumped by every inbound frame; the heartbeat compares generations to
    /// detect a silent peer.
    liveness: AtomicU64,
}

impl<S: SocketIo + 'static> FramedWebSocket<S> {
    #[must_use]
    pub fn new(socket: Arc<S>, role: Role, options: WebSocketOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            socket,
            role,
            options,
            mailbox: Mailbox::new("websocket"),
            weak: weak.clone(),
            state: Mutex::new(FramedState {
                delegate: None,
                decoder: FrameDecoder::new(),
                inbox: BytesMut::new(),
                partial: None,
                buffered_bytes: 0,
                connected: false,
                close_sent: false,
                close_received: false,
                close_payload: None,
                bytes_sent: 0,
                bytes_received: 0,
            }),
            liveness: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FramedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delegate(&self) -> Option<Arc<dyn WebSocketDelegate>> { self.lock().delegate.clone() }

    /// The socket owner reports the HTTP upgrade response.
    pub fn on_http_response(&self, status: u16, headers: &[(String, String)]) {
        if let Some(delegate) = self.delegate() {
            delegate.on_http_response(status, headers);
        }
    }

    /// The socket owner reports the transport open. Starts the heartbeat.
    pub fn on_socket_connected(&self) {
        {
            let mut st = self.lock();
            st.connected = true;
        }
        if let Some(delegate) = self.delegate() {
            delegate.on_connect();
        }
        if !self.options.heartbeat.is_zero() {
            self.schedule_ping();
        }
    }

    /// The socket owner feeds received wire bytes.
    pub fn on_receive(&self, bytes: &[u8]) {
        self.liveness.fetch_add(1, Ordering::SeqCst);
        let mut deliveries = Vec::new();
        let (delegate, failure) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            st.bytes_received += bytes.len() as u64;
            st.inbox.extend_from_slice(bytes);
            let failure = loop {
                match st.decoder.decode(&mut st.inbox) {
                    Ok(Some(frame)) => {
                        if let Err(status) = self.handle_frame(st, frame, &mut deliveries) {
                            break Some(status);
                        }
                    }
                    Ok(None) => break None,
                    Err(err) => {
                        break Some(CloseStatus::new(
                            CloseReason::WebSocket,
                            CloseCode::ProtocolError.code(),
                            err.to_string(),
                        ));
                    }
                }
            };
            (st.delegate.clone(), failure)
        };
        self.run_deliveries(&delegate, deliveries);
        if let Some(status) = failure {
            log::warn!("websocket protocol failure: {status}");
            self.socket.close_socket();
            self.on_socket_closed(status);
        }
    }

    /// The socket owner reports `n` bytes flushed to the wire.
    pub fn on_write_complete(&self, n: usize) {
        let mut deliveries = Vec::new();
        let delegate = {
            let mut st = self.lock();
            st.bytes_sent += n as u64;
            let was_blocked = st.buffered_bytes > SEND_BUFFER_SIZE;
            st.buffered_bytes = st.buffered_bytes.saturating_sub(n);
            if st.close_sent && st.close_received && st.buffered_bytes == 0 {
                deliveries.push(Deliver::Disconnect);
            } else if was_blocked && st.buffered_bytes <= SEND_BUFFER_SIZE {
                deliveries.push(Deliver::Writeable);
            }
            st.delegate.clone()
        };
        self.run_deliveries(&delegate, deliveries);
    }

    /// The socket owner reports the socket gone. Normalizes the status the
    /// way the close handshake expects and tells the delegate.
    pub fn on_socket_closed(&self, mut status: CloseStatus) {
        let delegate = {
            let mut st = self.lock();
            if !st.connected && st.delegate.is_none() {
                return;
            }
            st.connected = false;
            let expected = st.close_sent && st.close_received;
            let clean = status.code == 0
                || (status.reason == CloseReason::WebSocket
                    && status.code == CloseCode::Normal.code());
            if clean {
                status.reason = CloseReason::WebSocket;
                if !expected {
                    status.code = CloseCode::Abnormal.code();
                } else if let Some(payload) = &st.close_payload {
                    let (code, message) = decode_close_payload(payload);
                    status.code = code.unwrap_or(CloseCode::StatusCodeExpected.code());
                    status.message = message;
                } else {
                    status.code = CloseCode::Normal.code();
                }
            }
            log::info!(
                "websocket closed ({status}); sent {} bytes, received {} bytes",
                st.bytes_sent,
                st.bytes_received
            );
            st.delegate.take()
        };
        if let Some(delegate) = delegate {
            delegate.on_close(status);
        }
    }

    fn handle_frame(
        &self,
        st: &mut FramedState,
        frame: WsFrame,
        deliveries: &mut Vec<Deliver>,
    ) -> Result<(), CloseStatus> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                self.assemble(st, frame, deliveries)
            }
            Opcode::Ping => {
                deliveries.push(Deliver::Pong(frame.payload));
                Ok(())
            }
            Opcode::Pong => {
                log::trace!("received PONG");
                Ok(())
            }
            Opcode::Close => {
                self.received_close(st, &frame.payload, deliveries);
                Ok(())
            }
        }
    }

    fn assemble(
        &self,
        st: &mut FramedState,
        frame: WsFrame,
        deliveries: &mut Vec<Deliver>,
    ) -> Result<(), CloseStatus> {
        let protocol_error = |message: &str| {
            CloseStatus::new(
                CloseReason::WebSocket,
                CloseCode::ProtocolError.code(),
                message,
            )
        };
        if frame.opcode == Opcode::Continuation {
            let Some((opcode, mut buffer)) = st.partial.take() else {
                return Err(protocol_error("continuation without start"));
            };
            buffer.extend_from_slice(&frame.payload);
            if frame.fin {
                deliveries.push(Deliver::Message(buffer.freeze(), opcode == Opcode::Binary));
            } else {
                st.partial = Some((opcode, buffer));
            }
            return Ok(());
        }
        if st.partial.is_some() {
            return Err(protocol_error("new message inside fragmented message"));
        }
        if frame.fin {
            deliveries.push(Deliver::Message(frame.payload, frame.opcode == Opcode::Binary));
        } else {
            let mut buffer = BytesMut::new();
            buffer.extend_from_slice(&frame.payload);
            st.partial = Some((frame.opcode, buffer));
        }
        Ok(())
    }

    fn received_close(
        &self,
        st: &mut FramedState,
        payload: &Bytes,
        deliveries: &mut Vec<Deliver>,
    ) {
        if st.close_received {
            return;
        }
        st.close_received = true;
        if st.close_sent {
            // We initiated; the peer confirmed. Disconnect once drained.
            if st.buffered_bytes == 0 {
                deliveries.push(Deliver::Disconnect);
            }
        } else {
            // Peer initiated: remember and echo its payload.
            let (code, message) = decode_close_payload(payload);
            log::debug!(
                "peer requested close ({} '{message}'); echoing",
                code.unwrap_or_default()
            );
            st.close_payload = Some(payload.clone());
            st.close_sent = true;
            let frame = self.encode_op(st, Opcode::Close, payload);
            self.socket.send_bytes(frame);
            self.schedule_close_timeout();
        }
    }

    fn encode_op(&self, st: &mut FramedState, opcode: Opcode, payload: &[u8]) -> Bytes {
        let mask = match self.role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        };
        let mut frame = BytesMut::new();
        encode_frame(opcode, payload, mask, &mut frame);
        st.buffered_bytes += frame.len();
        frame.freeze()
    }

    fn send_op(&self, opcode: Opcode, payload: &[u8]) -> bool {
        let (frame, writeable) = {
            let mut st = self.lock();
            if st.close_sent && opcode != Opcode::Close {
                return false;
            }
            let frame = self.encode_op(&mut st, opcode, payload);
            (frame, st.buffered_bytes <= SEND_BUFFER_SIZE)
        };
        self.socket.send_bytes(frame);
        writeable
    }

    fn run_deliveries(&self, delegate: &Option<Arc<dyn WebSocketDelegate>>, deliveries: Vec<Deliver>) {
        for delivery in deliveries {
            match delivery {
                Deliver::Message(payload, binary) => {
                    if let Some(delegate) = delegate {
                        delegate.on_message(payload, binary);
                    }
                }
                Deliver::Pong(payload) => {
                    self.send_op(Opcode::Pong, &payload);
                }
                Deliver::Writeable => {
                    if let Some(delegate) = delegate {
                        delegate.on_writeable();
                    }
                }
                Deliver::Disconnect => {
                    log::debug!("close handshake finished; disconnecting socket");
                    self.socket.close_socket();
                }
            }
        }
    }

    fn schedule_ping(&self) {
        let Some(this) = self.weak.upgrade() else { return };
        self.mailbox
            .enqueue_after(self.options.heartbeat, "websocket.ping", move || {
                this.send_ping();
            });
    }

    fn send_ping(&self) {
        {
            let st = self.lock();
            if !st.connected || st.close_sent {
                return;
            }
        }
        log::trace!("sending PING");
        self.send_op(Opcode::Ping, b"");
        let generation = self.liveness.load(Ordering::SeqCst);
        let Some(this) = self.weak.upgrade() else { return };
        self.mailbox.enqueue_after(
            self.options.response_timeout,
            "websocket.response_timeout",
            move || this.check_liveness(generation),
        );
        self.schedule_ping();
    }

    fn check_liveness(&self, generation: u64) {
        {
            let st = self.lock();
            if !st.connected {
                return;
            }
        }
        if self.liveness.load(Ordering::SeqCst) == generation {
            log::warn!("no traffic since PING; failing connection");
            self.socket.close_socket();
            self.on_socket_closed(CloseStatus::new(
                CloseReason::Timeout,
                0,
                "peer stopped responding",
            ));
        }
    }

    fn schedule_close_timeout(&self) {
        let Some(this) = self.weak.upgrade() else { return };
        self.mailbox.enqueue_after(
            self.options.close_timeout,
            "websocket.close_timeout",
            move || {
                let pending = {
                    let st = this.lock();
                    st.connected && !(st.close_sent && st.close_received)
                };
                if pending {
                    log::warn!("peer never completed the close handshake; disconnecting");
                    this.socket.close_socket();
                }
            },
        );
    }
}

impl<S: SocketIo + 'static> WebSocket for FramedWebSocket<S> {
    fn connect(&self, delegate: Arc<dyn WebSocketDelegate>) {
        let mut st = self.lock();
        st.delegate = Some(delegate);
    }

    fn send(&self, message: Bytes, binary: bool) -> bool {
        let opcode = if binary { Opcode::Binary } else { Opcode::Text };
        self.send_op(opcode, &message)
    }

    fn close(&self, code: CloseCode, message: &str) {
        let payload = {
            let mut st = self.lock();
            if st.close_sent || st.close_received {
                return;
            }
            st.close_sent = true;
            let payload = encode_close_payload(code.code(), message);
            st.close_payload = Some(payload.clone());
            payload
        };
        log::debug!("requesting close with status {} '{message}'", code.code());
        self.send_op(Opcode::Close, &payload);
        self.schedule_close_timeout();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::time::{self, Duration};

    use super::*;

    /// Captures framed bytes; tests pump them into the peer by hand.
    #[derive(Default)]
    struct RecordingSocket {
        sent: StdMutex<Vec<Bytes>>,
        closed: StdMutex<bool>,
    }

    impl SocketIo for RecordingSocket {
        fn send_bytes(&self, bytes: Bytes) { self.sent.lock().unwrap().push(bytes); }

        fn close_socket(&self) { *self.closed.lock().unwrap() = true; }
    }

    impl RecordingSocket {
        fn drain(&self) -> Vec<u8> {
            let mut all = Vec::new();
            for chunk in self.sent.lock().unwrap().drain(..) {
                all.extend_from_slice(&chunk);
            }
            all
        }

        fn is_closed(&self) -> bool { *self.closed.lock().unwrap() }
    }

    #[derive(Default)]
    struct RecordingDelegate {
        messages: StdMutex<Vec<(Bytes, bool)>>,
        closes: StdMutex<Vec<CloseStatus>>,
        writeables: StdMutex<usize>,
    }

    impl WebSocketDelegate for RecordingDelegate {
        fn on_message(&self, message: Bytes, binary: bool) {
            self.messages.lock().unwrap().push((message, binary));
        }

        fn on_writeable(&self) { *self.writeables.lock().unwrap() += 1; }

        fn on_close(&self, status: CloseStatus) {
            self.closes.lock().unwrap().push(status);
        }
    }

    fn server_socket() -> (
        Arc<FramedWebSocket<RecordingSocket>>,
        Arc<RecordingSocket>,
        Arc<RecordingDelegate>,
    ) {
        let io = Arc::new(RecordingSocket::default());
        let ws = FramedWebSocket::new(Arc::clone(&io), Role::Server, WebSocketOptions::default());
        let delegate = Arc::new(RecordingDelegate::default());
        ws.connect(Arc::clone(&delegate) as Arc<dyn WebSocketDelegate>);
        (ws, io, delegate)
    }

    #[tokio::test]
    async fn delivers_messages_from_client_and_server_framing() {
        let (ws, _io, delegate) = server_socket();
        ws.on_socket_connected();

        let mut wire = BytesMut::new();
        encode_frame(Opcode::Binary, b"masked", Some([9, 9, 9, 9]), &mut wire);
        encode_frame(Opcode::Binary, b"clear", None, &mut wire);
        ws.on_receive(&wire);

        let messages = delegate.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[0].0[..], b"masked");
        assert_eq!(&messages[1].0[..], b"clear");
        assert!(messages.iter().all(|(_, binary)| *binary));
    }

    #[tokio::test]
    async fn fragmented_messages_reassemble() {
        let (ws, _io, delegate) = server_socket();
        ws.on_socket_connected();

        let mut part1 = BytesMut::new();
        part1.extend_from_slice(&[0x02, 0x03]); // Binary, no FIN, len 3
        part1.extend_from_slice(b"abc");
        let mut part2 = BytesMut::new();
        part2.extend_from_slice(&[0x80, 0x03]); // Continuation, FIN, len 3
        part2.extend_from_slice(b"def");

        ws.on_receive(&part1);
        assert!(delegate.messages.lock().unwrap().is_empty());
        ws.on_receive(&part2);
        let messages = delegate.messages.lock().unwrap();
        assert_eq!(&messages[0].0[..], b"abcdef");
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (ws, io, _delegate) = server_socket();
        ws.on_socket_connected();
        io.drain();

        let mut wire = BytesMut::new();
        encode_frame(Opcode::Ping, b"tick", None, &mut wire);
        ws.on_receive(&wire);

        let reply = io.drain();
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&reply[..]);
        let frame = decoder.decode(&mut buf).unwrap().expect("pong sent");
        assert_eq!(frame.opcode, Opcode::Pong);
        assert_eq!(&frame.payload[..], b"tick");
    }

    #[tokio::test]
    async fn send_reports_backpressure_past_high_water() {
        let (ws, _io, _delegate) = server_socket();
        ws.on_socket_connected();

        let big = Bytes::from(vec![0u8; SEND_BUFFER_SIZE]);
        assert!(!ws.send(big, true));
        // Draining the buffer notifies writeable.
        ws.on_write_complete(SEND_BUFFER_SIZE + 14);
        assert!(ws.send(Bytes::from_static(b"small"), true));
    }

    #[tokio::test]
    async fn close_initiator_disconnects_after_peer_echo() {
        let (ws, io, delegate) = server_socket();
        ws.on_socket_connected();
        ws.close(CloseCode::Normal, "bye");
        let request = io.drain();
        assert!(!request.is_empty());
        assert!(!io.is_closed());

        // Peer echoes the close; write buffer drains; socket disconnects.
        ws.on_write_complete(request.len());
        let mut echo = BytesMut::new();
        encode_frame(Opcode::Close, &encode_close_payload(1000, "bye"), None, &mut echo);
        ws.on_receive(&echo);
        assert!(io.is_closed());

        ws.on_socket_closed(CloseStatus::new(CloseReason::Posix, 0, ""));
        let closes = delegate.closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].code, 1000);
        assert_eq!(closes[0].message, "bye");
        assert!(closes[0].is_normal());
    }

    #[tokio::test]
    async fn close_receiver_echoes_the_peer_request() {
        let (ws, io, _delegate) = server_socket();
        ws.on_socket_connected();
        io.drain();

        let mut wire = BytesMut::new();
        encode_frame(
            Opcode::Close,
            &encode_close_payload(1001, "going away"),
            None,
            &mut wire,
        );
        ws.on_receive(&wire);

        let reply = io.drain();
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&reply[..]);
        let frame = decoder.decode(&mut buf).unwrap().expect("close echoed");
        assert_eq!(frame.opcode, Opcode::Close);
        let (code, message) = decode_close_payload(&frame.payload);
        assert_eq!(code, Some(1001));
        assert_eq!(message, "going away");
    }

    #[tokio::test]
    async fn unexpected_disconnect_maps_to_abnormal() {
        let (ws, _io, delegate) = server_socket();
        ws.on_socket_connected();
        ws.on_socket_closed(CloseStatus::new(CloseReason::WebSocket, 0, ""));
        let closes = delegate.closes.lock().unwrap();
        assert_eq!(closes[0].code, CloseCode::Abnormal.code());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_after_ping() {
        let io = Arc::new(RecordingSocket::default());
        let options = WebSocketOptions {
            heartbeat: Duration::from_secs(15),
            response_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(5),
        };
        let ws = FramedWebSocket::new(Arc::clone(&io), Role::Server, options);
        let delegate = Arc::new(RecordingDelegate::default());
        ws.connect(Arc::clone(&delegate) as Arc<dyn WebSocketDelegate>);
        ws.on_socket_connected();

        // First ping fires at 15s; the response timeout lapses at 75s.
        time::sleep(Duration::from_secs(16)).await;
        tokio::task::yield_now().await;
        time::sleep(Duration::from_secs(61)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert!(io.is_closed());
        let closes = delegate.closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].reason, CloseReason::Timeout);
    }

    #[tokio::test]
    async fn framing_violation_fails_the_connection() {
        let (ws, io, delegate) = server_socket();
        ws.on_socket_connected();
        // Reserved bits set.
        ws.on_receive(&[0xC2, 0x00]);
        assert!(io.is_closed());
        let closes = delegate.closes.lock().unwrap();
        assert_eq!(closes[0].code, CloseCode::ProtocolError.code());
    }
}
