//! Shared fixtures for the scenario tests: loopback connection pairs and a
//! scriptable peer delegate.
#![allow(dead_code)]

use std::sync::Arc;

use blipwire::{
    CloseStatus, Connection, ConnectionDelegate, ConnectionOptions, MessageBuilder, MessageIn,
    websocket::LoopbackWebSocket,
};
use tokio::sync::mpsc;

/// How the peer side answers incoming requests.
#[derive(Clone, Copy)]
pub enum Behavior {
    /// Respond with the request's own properties and body.
    Echo,
    /// Receive but never respond.
    Silent,
    /// Reject every request with the standard not-handled error.
    Reject,
}

/// Observable peer-side events.
pub enum PeerEvent {
    Request(Arc<MessageIn>),
    Close(CloseStatus),
}

pub struct TestDelegate {
    behavior: Behavior,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl TestDelegate {
    pub fn new(behavior: Behavior) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { behavior, events }), rx)
    }
}

impl ConnectionDelegate for TestDelegate {
    fn on_request(&self, request: Arc<MessageIn>) {
        match self.behavior {
            Behavior::Echo => {
                let mut reply = MessageBuilder::new();
                for (key, value) in request.properties().iter() {
                    reply = reply.property(key, value);
                }
                request
                    .respond(reply.body(request.body()))
                    .expect("echo response accepted");
            }
            Behavior::Silent => {}
            Behavior::Reject => {
                request.not_handled().expect("error response accepted");
            }
        }
        let _ = self.events.send(PeerEvent::Request(request));
    }

    fn on_close(&self, status: CloseStatus) {
        let _ = self.events.send(PeerEvent::Close(status));
    }
}

pub struct Harness {
    pub client: Arc<Connection>,
    pub server: Arc<Connection>,
    pub client_socket: Arc<LoopbackWebSocket>,
    pub server_socket: Arc<LoopbackWebSocket>,
    pub server_events: mpsc::UnboundedReceiver<PeerEvent>,
}

/// A connected loopback pair: `client` sends, `server` answers per
/// `behavior`.
pub fn harness(
    behavior: Behavior,
    client_options: ConnectionOptions,
    server_options: ConnectionOptions,
) -> Harness {
    let (client_socket, server_socket) = LoopbackWebSocket::pair();
    let client = Connection::new(
        Arc::clone(&client_socket) as Arc<dyn blipwire::websocket::WebSocket>,
        client_options,
    );
    let (delegate, server_events) = TestDelegate::new(behavior);
    let server = Connection::with_delegate(
        Arc::clone(&server_socket) as Arc<dyn blipwire::websocket::WebSocket>,
        server_options,
        delegate,
    );
    Harness {
        client,
        server,
        client_socket,
        server_socket,
        server_events,
    }
}

pub fn echo_harness() -> Harness {
    harness(
        Behavior::Echo,
        ConnectionOptions::default(),
        ConnectionOptions::default(),
    )
}

/// Deterministic pseudo-random body for round-trip checks.
pub fn scrambled_body(len: usize) -> Vec<u8> {
    let mut state = 0x2545F491_4F6CDD1D_u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}
