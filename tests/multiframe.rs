//! Multi-frame transmission: compression, flow control, and priority.

mod common;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use blipwire::{
    ConnectionOptions, MessageBuilder, ProgressState,
    websocket::{CloseStatus, WebSocket, WebSocketDelegate},
};
use bytes::Bytes;
use common::{Behavior, echo_harness, harness, scrambled_body};
use tokio::time::{Duration, sleep, timeout};

const WAIT: Duration = Duration::from_secs(10);

/// Counts the binary transport frames delivered to the wrapped delegate.
struct FrameCountingSocket {
    inner: Arc<dyn WebSocket>,
    delivered: Arc<AtomicUsize>,
}

struct FrameCountingDelegate {
    inner: Arc<dyn WebSocketDelegate>,
    delivered: Arc<AtomicUsize>,
}

impl WebSocket for FrameCountingSocket {
    fn connect(&self, delegate: Arc<dyn WebSocketDelegate>) {
        self.inner.connect(Arc::new(FrameCountingDelegate {
            inner: delegate,
            delivered: Arc::clone(&self.delivered),
        }));
    }

    fn send(&self, message: Bytes, binary: bool) -> bool { self.inner.send(message, binary) }

    fn close(&self, code: blipwire::CloseCode, message: &str) { self.inner.close(code, message) }
}

impl WebSocketDelegate for FrameCountingDelegate {
    fn on_http_response(&self, status: u16, headers: &[(String, String)]) {
        self.inner.on_http_response(status, headers);
    }

    fn on_connect(&self) { self.inner.on_connect(); }

    fn on_message(&self, message: Bytes, binary: bool) {
        if binary {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.on_message(message, binary);
    }

    fn on_writeable(&self) { self.inner.on_writeable(); }

    fn on_close(&self, status: CloseStatus) { self.inner.on_close(status); }
}

#[tokio::test]
async fn large_compressed_body_spans_many_frames_and_reassembles() {
    use blipwire::{Connection, websocket::LoopbackWebSocket};
    use common::TestDelegate;

    let (client_socket, server_socket) = LoopbackWebSocket::pair();
    let delivered = Arc::new(AtomicUsize::new(0));
    let counting = Arc::new(FrameCountingSocket {
        inner: server_socket as Arc<dyn WebSocket>,
        delivered: Arc::clone(&delivered),
    });

    let client = Connection::new(
        client_socket as Arc<dyn WebSocket>,
        ConnectionOptions::default(),
    );
    let (delegate, _events) = TestDelegate::new(Behavior::Echo);
    let _server = Connection::with_delegate(
        counting as Arc<dyn WebSocket>,
        ConnectionOptions::default(),
        delegate,
    );

    let body = scrambled_body(200 * 1024);
    let reply = timeout(
        WAIT,
        client
            .send_request(MessageBuilder::new().body(&body).compressed(true))
            .expect("connection open"),
    )
    .await
    .expect("reply in time")
    .expect("reply delivered");

    assert_eq!(reply.body().len(), body.len());
    assert_eq!(&reply.body()[..], &body[..]);
    // 200 KiB at a 16 KiB frame budget: at least 13 request frames reach the
    // server (acks ride alongside).
    assert!(
        delivered.load(Ordering::SeqCst) >= 13,
        "expected >= 13 frames, saw {}",
        delivered.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn uncompressed_large_body_round_trips() {
    let fixture = echo_harness();
    let body = scrambled_body(150 * 1024);
    let reply = timeout(
        WAIT,
        fixture
            .client
            .send_request(MessageBuilder::new().body(&body))
            .expect("connection open"),
    )
    .await
    .expect("reply in time")
    .expect("reply delivered");
    assert_eq!(&reply.body()[..], &body[..]);
}

#[tokio::test]
async fn sender_stalls_when_the_peer_never_acks() {
    let client_options = ConnectionOptions {
        max_unacked: 64 * 1024,
        ..Default::default()
    };
    let server_options = ConnectionOptions {
        // Never cross the ack threshold.
        ack_threshold: u64::MAX,
        ..Default::default()
    };
    let fixture = harness(Behavior::Silent, client_options, server_options);

    let sent = Arc::new(Mutex::new(0u64));
    let complete = Arc::new(Mutex::new(false));
    let sent_probe = Arc::clone(&sent);
    let complete_probe = Arc::clone(&complete);

    let body = scrambled_body(1024 * 1024);
    let _pending = fixture
        .client
        .send_request(
            MessageBuilder::new()
                .body(&body)
                .no_reply(true)
                .on_progress(move |progress| {
                    *sent_probe.lock().unwrap() = progress.bytes_sent;
                    if progress.state == ProgressState::Complete {
                        *complete_probe.lock().unwrap() = true;
                    }
                }),
        )
        .expect("connection open");

    // Give the scheduler ample time to run dry against the unacked cap.
    sleep(Duration::from_millis(300)).await;

    assert!(!*complete.lock().unwrap(), "sender should stall unacked");
    let sent = *sent.lock().unwrap();
    assert!(sent > 0, "some frames must go out");
    assert!(
        sent < 256 * 1024,
        "sender ran far past the unacked cap: {sent} bytes"
    );
}

#[tokio::test]
async fn acks_resume_the_sender_until_transmission_completes() {
    let client_options = ConnectionOptions {
        max_unacked: 64 * 1024,
        ..Default::default()
    };
    // Server acks normally at the default 50 KB threshold.
    let fixture = harness(Behavior::Echo, client_options, ConnectionOptions::default());

    let body = scrambled_body(512 * 1024);
    let reply = timeout(
        WAIT,
        fixture
            .client
            .send_request(MessageBuilder::new().body(&body))
            .expect("connection open"),
    )
    .await
    .expect("reply in time")
    .expect("reply delivered");
    assert_eq!(&reply.body()[..], &body[..]);
}

#[tokio::test]
async fn urgent_request_overtakes_a_large_normal_request() {
    let fixture = echo_harness();
    let order = Arc::new(Mutex::new(Vec::new()));

    let big = fixture
        .client
        .send_request(MessageBuilder::new().body(scrambled_body(512 * 1024)))
        .expect("connection open");
    let small = fixture
        .client
        .send_request(
            MessageBuilder::new()
                .body(b"jump the queue")
                .urgent(true),
        )
        .expect("connection open");

    let big_order = Arc::clone(&order);
    let big_task = tokio::spawn(async move {
        let reply = big.await.expect("big reply");
        big_order.lock().unwrap().push("normal");
        reply
    });
    let small_order = Arc::clone(&order);
    let small_task = tokio::spawn(async move {
        let reply = small.await.expect("small reply");
        small_order.lock().unwrap().push("urgent");
        reply
    });

    let small_reply = timeout(WAIT, small_task).await.expect("in time").unwrap();
    assert!(small_reply.urgent());
    assert_eq!(&small_reply.body()[..], b"jump the queue");
    timeout(WAIT, big_task).await.expect("in time").unwrap();

    let order = order.lock().unwrap();
    assert_eq!(order.as_slice(), ["urgent", "normal"]);
}
