//! Deferred results that resume observers on their own actor.
//!
//! An [`AsyncProvider`] produces a value at some later point; an [`Async`]
//! is the consumer's view of it. Observers registered from inside a mailbox
//! thunk are resumed by a thunk on that same mailbox, preserving the
//! single-threaded discipline of actor state. An `Async` is also a standard
//! [`Future`], so plain tokio tasks can simply `.await` it.
//!
//! Cancellation is not first-class: on disconnect the owner resolves its
//! providers with a disconnection marker value.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use crate::mailbox::Mailbox;

struct Observer<T> {
    mailbox: Option<Mailbox>,
    run: Box<dyn FnOnce(T) + Send + 'static>,
}

enum State<T> {
    Pending {
        observers: Vec<Observer<T>>,
        wakers: Vec<Waker>,
    },
    Ready(T),
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

/// The producing side of a deferred result.
pub struct AsyncProvider<T> {
    inner: Arc<Inner<T>>,
}

/// The consuming side of a deferred result.
pub struct Async<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Async<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> AsyncProvider<T> {
    /// Create a provider with no value yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending {
                    observers: Vec::new(),
                    wakers: Vec::new(),
                }),
            }),
        }
    }

    /// The consumer view of this provider's eventual value.
    #[must_use]
    pub fn value(&self) -> Async<T> {
        Async {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Resolve with `value`, waking every observer. A second resolution is
    /// ignored.
    pub fn resolve(&self, value: T) {
        let previous = {
            let Ok(mut state) = self.inner.state.lock() else { return };
            if matches!(*state, State::Ready(_)) {
                log::debug!("async provider resolved twice; keeping first value");
                return;
            }
            std::mem::replace(&mut *state, State::Ready(value.clone()))
        };
        let State::Pending { observers, wakers } = previous else {
            return;
        };
        for observer in observers {
            let value = value.clone();
            match observer.mailbox {
                Some(mailbox) => {
                    mailbox.enqueue("async.observer", move || (observer.run)(value));
                }
                None => (observer.run)(value),
            }
        }
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T: Clone + Send + 'static> Default for AsyncProvider<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Clone + Send + 'static> Async<T> {
    /// Whether the provider has resolved.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| matches!(*state, State::Ready(_)))
            .unwrap_or(false)
    }

    /// The resolved value, or `None` while still pending.
    #[must_use]
    pub fn result(&self) -> Option<T> {
        self.inner.state.lock().ok().and_then(|state| match &*state {
            State::Ready(value) => Some(value.clone()),
            State::Pending { .. } => None,
        })
    }

    /// Run `observer` once the value is available.
    ///
    /// When registered from inside a mailbox thunk, the observer is resumed
    /// by a thunk on that mailbox; otherwise it runs on whichever context
    /// resolves the provider. If the value is already present the observer
    /// runs immediately on the calling context.
    pub fn on_ready(&self, observer: impl FnOnce(T) + Send + 'static) {
        let run: Box<dyn FnOnce(T) + Send> = Box::new(observer);
        let immediate = {
            let Ok(mut state) = self.inner.state.lock() else { return };
            match &mut *state {
                State::Ready(value) => Some((run, value.clone())),
                State::Pending { observers, .. } => {
                    observers.push(Observer {
                        mailbox: Mailbox::current(),
                        run,
                    });
                    None
                }
            }
        };
        if let Some((run, value)) = immediate {
            run(value);
        }
    }
}

impl<T: Clone + Send + 'static> Future for Async<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let Ok(mut state) = self.inner.state.lock() else {
            return Poll::Pending;
        };
        match &mut *state {
            State::Ready(value) => Poll::Ready(value.clone()),
            State::Pending { wakers, .. } => {
                wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
