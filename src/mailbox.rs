//! Serial actor execution contexts.
//!
//! A [`Mailbox`] is a FIFO queue of named thunks drained by a single tokio
//! task, giving the owner of the queued state mutual exclusion without locks
//! being contended. A mailbox may target a parent mailbox instead of owning
//! a drain task, in which case its thunks are serialized with everything
//! else the parent runs, mirroring hierarchical dispatch queues.
//!
//! Each thunk runs with a task-local current-actor context, so code can ask
//! [`Mailbox::current`] which queue it is running on, and enqueues performed
//! inside a thunk inherit the caller's [`ChannelManifest`], a diagnostic ring
//! buffer that is dumped to the log when a thunk panics.

use std::{
    collections::VecDeque,
    fmt::Write as _,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

tokio::task_local! {
    static CURRENT_ACTOR: ActorContext;
}

#[derive(Clone)]
struct ActorContext {
    mailbox: Mailbox,
    manifest: ChannelManifest,
}

/// Hook invoked when a thunk panics; receives the formatted panic message.
pub type PanicHook = dyn Fn(&str) + Send + Sync;

type Thunk = Box<dyn FnOnce() + Send + 'static>;

struct Job {
    name: &'static str,
    actor: Mailbox,
    manifest: ChannelManifest,
    thunk: Thunk,
}

enum Route {
    /// This mailbox owns a drain task.
    Own {
        tx: mpsc::UnboundedSender<Job>,
        stop: CancellationToken,
    },
    /// Thunks are serialized through the parent's queue.
    Parent(Mailbox),
}

struct Shared {
    name: String,
    route: Route,
    panic_hook: Option<Box<PanicHook>>,
}

/// A serial FIFO executor of named thunks.
///
/// Cloning a `Mailbox` clones a handle to the same queue. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct Mailbox {
    shared: Arc<Shared>,
}

impl Mailbox {
    /// Create a mailbox with its own drain task.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self { Self::build(name.into(), None, None) }

    /// Create a mailbox with its own drain task and a panic hook that runs
    /// after a thunk panic has been caught and logged.
    #[must_use]
    pub fn with_panic_hook(name: impl Into<String>, hook: Box<PanicHook>) -> Self {
        Self::build(name.into(), None, Some(hook))
    }

    /// Create a mailbox whose thunks run on `parent`'s queue. FIFO order is
    /// preserved per child, and all children of one parent are mutually
    /// serialized.
    #[must_use]
    pub fn with_parent(name: impl Into<String>, parent: &Mailbox) -> Self {
        Self::build(name.into(), Some(parent.clone()), None)
    }

    fn build(name: String, parent: Option<Mailbox>, panic_hook: Option<Box<PanicHook>>) -> Self {
        let route = match parent {
            Some(parent) => Route::Parent(parent),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                let stop = CancellationToken::new();
                spawn_drain(rx, stop.clone());
                Route::Own { tx, stop }
            }
        };
        Self {
            shared: Arc::new(Shared {
                name,
                route,
                panic_hook,
            }),
        }
    }

    /// Name given at construction.
    #[must_use]
    pub fn name(&self) -> &str { &self.shared.name }

    /// The mailbox whose thunk the calling code is executing inside, if any.
    #[must_use]
    pub fn current() -> Option<Mailbox> {
        CURRENT_ACTOR.try_with(|ctx| ctx.mailbox.clone()).ok()
    }

    /// Queue `thunk` for serial execution. Two enqueues from the same thread
    /// run in the order they were issued; enqueuing from inside a thunk
    /// schedules, never recurses.
    pub fn enqueue(&self, name: &'static str, thunk: impl FnOnce() + Send + 'static) {
        let manifest = inherited_manifest();
        manifest.record_enqueue(name, None);
        self.submit(Job {
            name,
            actor: self.clone(),
            manifest,
            thunk: Box::new(thunk),
        });
    }

    /// Queue `thunk` to run no earlier than `delay` from now. Delayed thunks
    /// are ordered only against other delayed thunks that have already fired.
    pub fn enqueue_after(
        &self,
        delay: Duration,
        name: &'static str,
        thunk: impl FnOnce() + Send + 'static,
    ) {
        let manifest = inherited_manifest();
        manifest.record_enqueue(name, Some(delay));
        let job = Job {
            name,
            actor: self.clone(),
            manifest,
            thunk: Box::new(thunk),
        };
        let target = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            target.submit(job);
        });
    }

    /// Stop the drain task. Queued thunks that have not started are dropped.
    /// For a mailbox targeting a parent this is a no-op.
    pub fn stop(&self) {
        if let Route::Own { stop, .. } = &self.shared.route {
            stop.cancel();
        }
    }

    fn submit(&self, job: Job) {
        match &self.shared.route {
            Route::Own { tx, .. } => {
                if tx.send(job).is_err() {
                    log::debug!("mailbox {}: dropping job after stop", self.shared.name);
                }
            }
            Route::Parent(parent) => parent.submit(job),
        }
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

fn spawn_drain(mut rx: mpsc::UnboundedReceiver<Job>, stop: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => run_job(job),
                    None => break,
                },
            }
        }
    });
}

fn run_job(job: Job) {
    let Job {
        name,
        actor,
        manifest,
        thunk,
    } = job;
    manifest.record_execution(name);
    let ctx = ActorContext {
        mailbox: actor.clone(),
        manifest: manifest.clone(),
    };
    let outcome = CURRENT_ACTOR.sync_scope(ctx, || panic::catch_unwind(AssertUnwindSafe(thunk)));
    if let Err(payload) = outcome {
        let message = panic_message(payload.as_ref());
        log::error!(
            "mailbox {}: thunk '{name}' panicked: {message}\n{}",
            actor.shared.name,
            manifest.dump()
        );
        if let Some(hook) = &actor.shared.panic_hook {
            hook(message);
        }
    }
}

/// Text of a panic payload, for the manifest dump. Only string payloads
/// carry a message worth reporting.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn inherited_manifest() -> ChannelManifest {
    CURRENT_ACTOR
        .try_with(|ctx| ctx.manifest.clone())
        .unwrap_or_default()
}

const MANIFEST_LIMIT: usize = 100;

#[derive(Clone)]
struct ManifestEntry {
    elapsed: Duration,
    name: String,
}

struct ManifestInner {
    start: Instant,
    limit: usize,
    enqueues: VecDeque<ManifestEntry>,
    executions: VecDeque<ManifestEntry>,
    truncated_enqueues: u32,
    truncated_executions: u32,
}

/// Diagnostic breadcrumb of enqueue/execute pairs.
///
/// Thunks inherit the manifest of the code that enqueued them, so a dump
/// reconstructs the causal chain leading up to a panic. Purely diagnostic;
/// nothing reads it on the happy path.
#[derive(Clone)]
pub struct ChannelManifest {
    inner: Arc<Mutex<ManifestInner>>,
}

impl Default for ChannelManifest {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManifestInner {
                start: Instant::now(),
                limit: MANIFEST_LIMIT,
                enqueues: VecDeque::new(),
                executions: VecDeque::new(),
                truncated_enqueues: 0,
                truncated_executions: 0,
            })),
        }
    }
}

impl ChannelManifest {
    fn record_enqueue(&self, name: &str, delay: Option<Duration>) {
        let Ok(mut inner) = self.inner.lock() else { return };
        let elapsed = inner.start.elapsed();
        let name = match delay {
            Some(delay) => format!("{name} [after {:.3} secs]", delay.as_secs_f64()),
            None => name.to_owned(),
        };
        inner.enqueues.push_back(ManifestEntry { elapsed, name });
        while inner.enqueues.len() > inner.limit {
            inner.enqueues.pop_front();
            inner.truncated_enqueues += 1;
        }
    }

    fn record_execution(&self, name: &str) {
        let Ok(mut inner) = self.inner.lock() else { return };
        let elapsed = inner.start.elapsed();
        inner.executions.push_back(ManifestEntry {
            elapsed,
            name: name.to_owned(),
        });
        while inner.executions.len() > inner.limit {
            inner.executions.pop_front();
            inner.truncated_executions += 1;
        }
    }

    /// Render the manifest for logging.
    #[must_use]
    pub fn dump(&self) -> String {
        let Ok(inner) = self.inner.lock() else {
            return String::from("channel manifest unavailable");
        };
        let mut out = String::from("List of enqueue calls:\n");
        if inner.truncated_enqueues > 0 {
            let _ = writeln!(out, "\t...{} truncated...", inner.truncated_enqueues);
        }
        for entry in &inner.enqueues {
            let _ = writeln!(out, "\t[{} ms] {}", entry.elapsed.as_millis(), entry.name);
        }
        out.push_str("Resulting execution calls:\n");
        if inner.truncated_executions > 0 {
            let _ = writeln!(out, "\t...{} truncated...", inner.truncated_executions);
        }
        for entry in &inner.executions {
            let _ = writeln!(out, "\t[{} ms] {}", entry.elapsed.as_millis(), entry.name);
        }
        out
    }
}
