//! In-memory WebSocket pairs.
//!
//! A loopback pair relays whole messages between two bound endpoints, each
//! running its delegate callbacks on its own mailbox. Delivery latency is
//! simulated, and a 32 KiB send buffer models transport backpressure: the
//! buffer drains as the peer consumes messages, firing `on_writeable` when
//! it crosses back under the high-water mark.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use bytes::Bytes;

use super::{
    CloseCode, CloseReason, CloseStatus, WebSocket, WebSocketDelegate,
    socket::SEND_BUFFER_SIZE,
};
use crate::mailbox::Mailbox;

struct LoopbackState {
    peer: Option<Weak<LoopbackWebSocket>>,
    delegate: Option<Arc<dyn WebSocketDelegate>>,
    connected: bool,
    closed: bool,
    buffered_bytes: usize,
}

/// One endpoint of an in-memory WebSocket pair.
pub struct LoopbackWebSocket {
    name: &'static str,
    mailbox: Mailbox,
    latency: Duration,
    weak: Weak<Self>,
    state: Mutex<LoopbackState>,
}

impl LoopbackWebSocket {
    /// Create two endpoints bound to each other with no latency.
    #[must_use]
    pub fn pair() -> (Arc<Self>, Arc<Self>) { Self::pair_with_latency(Duration::ZERO) }

    /// Create a bound pair whose deliveries lag by `latency`.
    #[must_use]
    pub fn pair_with_latency(latency: Duration) -> (Arc<Self>, Arc<Self>) {
        let a = Self::endpoint("loopback-a", latency);
        let b = Self::endpoint("loopback-b", latency);
        a.lock().peer = Some(Arc::downgrade(&b));
        b.lock().peer = Some(Arc::downgrade(&a));
        (a, b)
    }

    fn endpoint(name: &'static str, latency: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name,
            mailbox: Mailbox::new(name),
            latency,
            weak: weak.clone(),
            state: Mutex::new(LoopbackState {
                peer: None,
                delegate: None,
                connected: false,
                closed: false,
                buffered_bytes: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peer(&self) -> Option<Arc<Self>> {
        self.lock().peer.as_ref().and_then(Weak::upgrade)
    }

    fn delegate(&self) -> Option<Arc<dyn WebSocketDelegate>> { self.lock().delegate.clone() }

    /// Sever both endpoints without a close handshake, as a failing network
    /// would.
    pub fn disconnect(&self) {
        let status = CloseStatus::new(CloseReason::Network, 0, "connection severed");
        if let Some(peer) = self.peer() {
            peer.remote_closed(status.clone());
        }
        if let Some(this) = self.weak.upgrade() {
            this.remote_closed(status);
        }
    }

    /// Peer-side entry: schedule `message` for delivery here.
    fn deliver(self: &Arc<Self>, message: Bytes, binary: bool, sender: Arc<Self>) {
        let this = Arc::clone(self);
        let deliver = move || {
            let open = {
                let st = this.lock();
                !st.closed
            };
            if open {
                if let Some(delegate) = this.delegate() {
                    delegate.on_message(message.clone(), binary);
                }
            }
            // Consumption acknowledged: drain the sender's buffer.
            sender.consumed(message.len());
        };
        if self.latency.is_zero() {
            self.mailbox.enqueue("loopback.deliver", deliver);
        } else {
            self.mailbox
                .enqueue_after(self.latency, "loopback.deliver", deliver);
        }
    }

    /// The peer consumed `len` bytes of ours; update buffering and notify
    /// writeable when crossing back under the high-water mark.
    fn consumed(self: Arc<Self>, len: usize) {
        let this = Arc::clone(&self);
        self.mailbox.enqueue("loopback.consumed", move || {
            let crossed = {
                let mut st = this.lock();
                if st.closed {
                    return;
                }
                let before = st.buffered_bytes;
                st.buffered_bytes = before.saturating_sub(len);
                before > SEND_BUFFER_SIZE && st.buffered_bytes <= SEND_BUFFER_SIZE
            };
            if crossed {
                log::trace!("{} writeable again", this.name);
                if let Some(delegate) = this.delegate() {
                    delegate.on_writeable();
                }
            }
        });
    }

    fn remote_closed(self: Arc<Self>, status: CloseStatus) {
        let this = Arc::clone(&self);
        self.mailbox.enqueue("loopback.closed", move || {
            let delegate = {
                let mut st = this.lock();
                if st.closed {
                    return;
                }
                st.closed = true;
                st.connected = false;
                st.peer = None;
                st.delegate.take()
            };
            if let Some(delegate) = delegate {
                delegate.on_close(status);
            }
        });
    }
}

impl WebSocket for LoopbackWebSocket {
    fn connect(&self, delegate: Arc<dyn WebSocketDelegate>) {
        {
            let mut st = self.lock();
            st.delegate = Some(delegate);
        }
        let Some(this) = self.weak.upgrade() else { return };
        self.mailbox.enqueue("loopback.connect", move || {
            {
                let mut st = this.lock();
                if st.closed {
                    return;
                }
                st.connected = true;
            }
            if let Some(delegate) = this.delegate() {
                delegate.on_http_response(200, &[]);
                delegate.on_connect();
            }
        });
    }

    fn send(&self, message: Bytes, binary: bool) -> bool {
        let writeable = {
            let mut st = self.lock();
            if st.closed {
                return false;
            }
            st.buffered_bytes += message.len();
            st.buffered_bytes <= SEND_BUFFER_SIZE
        };
        let Some(this) = self.weak.upgrade() else { return false };
        self.mailbox.enqueue("loopback.send", move || {
            let peer = this.peer();
            match peer {
                Some(peer) => peer.deliver(message, binary, Arc::clone(&this)),
                None => log::debug!("{}: send dropped, socket is closed", this.name),
            }
        });
        writeable
    }

    fn close(&self, code: CloseCode, message: &str) {
        log::debug!("{}: close with status {}", self.name, code.code());
        let status = CloseStatus::new(CloseReason::WebSocket, code.code(), message);
        if let Some(peer) = self.peer() {
            peer.remote_closed(status.clone());
        }
        if let Some(this) = self.weak.upgrade() {
            this.remote_closed(status);
        }
    }
}
