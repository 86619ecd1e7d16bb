//! Single-threaded execution contexts
//!
//! Each [`Context`] owns one OS thread running a run loop that executes
//! posted tasks in order. [`ContextHandle::invoke`] is the blocking RPC used
//! to marshal work onto a context: it runs inline when the caller is already
//! on that context, otherwise it queues the closure and waits for the result.
//!
//! A context thread that is blocked in `invoke` keeps executing `invoke`
//! requests addressed to itself, so a chain like
//! worker -> network -> worker completes instead of deadlocking. Plain posted
//! tasks that arrive during such a wait are deferred until the outer task
//! returns.

use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::DispatchError;

type Task = Box<dyn FnOnce() + Send>;

/// The three execution contexts of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Network,
    Worker,
    Signaling,
}

impl ContextKind {
    pub const ALL: [ContextKind; 3] = [
        ContextKind::Network,
        ContextKind::Worker,
        ContextKind::Signaling,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ContextKind::Network => "network",
            ContextKind::Worker => "worker",
            ContextKind::Signaling => "signaling",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum Envelope {
    /// Fire-and-forget task, always run from the top-level loop
    Post(Task),
    /// Blocking request; may run nested while this context waits on another
    Invoke(Task),
    /// Nudge the loop to recompute its timer deadline
    Wake,
    Quit,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

static NEXT_CONTEXT_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Inner>>> = const { RefCell::new(None) };
}

struct Inner {
    id: usize,
    kind: ContextKind,
    name: String,
    /// `None` once the context has shut down; sends happen under this lock
    tx: Mutex<Option<Sender<Envelope>>>,
    rx: Receiver<Envelope>,
    timers: Mutex<BinaryHeap<Timer>>,
    timer_seq: AtomicU64,
    deferred: Mutex<VecDeque<Task>>,
    quit_requested: AtomicBool,
    tasks_run: AtomicU64,
}

impl Inner {
    fn send(&self, envelope: Envelope) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    fn is_current(&self) -> bool {
        CURRENT.with(|c| c.borrow().as_ref().map(|i| i.id) == Some(self.id))
    }

    fn next_timer_delay(&self) -> Option<Duration> {
        self.timers
            .lock()
            .peek()
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
    }

    fn run_task(&self, task: Task) {
        task();
        self.tasks_run.fetch_add(1, Ordering::Relaxed);
    }

    fn run_due_timers(&self) {
        loop {
            let task = {
                let mut timers = self.timers.lock();
                match timers.peek() {
                    Some(t) if t.deadline <= Instant::now() => timers.pop().map(|t| t.task),
                    _ => None,
                }
            };
            match task {
                Some(task) => self.run_task(task),
                None => break,
            }
        }
    }

    fn run_deferred(&self) {
        loop {
            let task = self.deferred.lock().pop_front();
            match task {
                Some(task) => self.run_task(task),
                None => break,
            }
        }
    }

    /// Handle one envelope received while blocked in a nested wait
    fn handle_nested(&self, envelope: Envelope) {
        match envelope {
            Envelope::Invoke(task) => self.run_task(task),
            Envelope::Post(task) => self.deferred.lock().push_back(task),
            Envelope::Wake => {}
            Envelope::Quit => self.quit_requested.store(true, Ordering::SeqCst),
        }
    }

    fn shutdown(&self) {
        // Dropping the queued tasks drops their reply senders, which fails
        // any caller still waiting in `invoke`.
        self.tx.lock().take();
        while self.rx.try_recv().is_ok() {}
        self.timers.lock().clear();
        self.deferred.lock().clear();
    }
}

/// Cloneable handle used to post work to a context
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<Inner>,
}

impl ContextHandle {
    pub fn kind(&self) -> ContextKind {
        self.inner.kind
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the calling thread is this context's thread
    pub fn is_current(&self) -> bool {
        self.inner.is_current()
    }

    /// Whether the context still accepts work
    pub fn is_running(&self) -> bool {
        self.inner.tx.lock().is_some()
    }

    /// Number of tasks executed so far
    pub fn tasks_run(&self) -> u64 {
        self.inner.tasks_run.load(Ordering::Relaxed)
    }

    /// Queue a task without waiting for it. Returns false if the context is stopped.
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.send(Envelope::Post(Box::new(f)))
    }

    /// Queue a task to run after `delay`
    pub fn post_delayed<F>(&self, delay: Duration, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_running() {
            return false;
        }
        let seq = self.inner.timer_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.timers.lock().push(Timer {
            deadline: Instant::now() + delay,
            seq,
            task: Box::new(f),
        });
        self.inner.send(Envelope::Wake)
    }

    /// Run `f` on this context and return its result.
    ///
    /// Runs inline if already on this context. Otherwise blocks the caller
    /// until the context has executed `f`. A panic inside `f` is re-raised on
    /// the caller.
    pub fn invoke<R, F>(&self, f: F) -> Result<R, DispatchError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }

        let (reply_tx, reply_rx) = bounded::<thread::Result<R>>(1);
        let task: Task = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = reply_tx.send(result);
        });

        if !self.inner.send(Envelope::Invoke(task)) {
            return Err(DispatchError::ContextStopped(self.inner.kind));
        }

        let own = CURRENT.with(|c| c.borrow().clone());
        let reply = match own {
            Some(own) => wait_pumping(&own, &reply_rx),
            None => reply_rx.recv().ok(),
        };

        match reply {
            Some(Ok(value)) => Ok(value),
            Some(Err(payload)) => resume_panic(payload),
            None => Err(DispatchError::ContextStopped(self.inner.kind)),
        }
    }

    /// Run any immediately runnable work when called on this context's thread.
    ///
    /// Used by polling loops that execute on the context itself and would
    /// otherwise starve it. Returns the number of tasks executed.
    pub fn process_pending(&self) -> usize {
        if !self.is_current() {
            return 0;
        }
        let before = self.tasks_run();
        self.inner.run_deferred();
        while let Ok(envelope) = self.inner.rx.try_recv() {
            match envelope {
                Envelope::Post(task) | Envelope::Invoke(task) => self.inner.run_task(task),
                Envelope::Wake => {}
                Envelope::Quit => self.inner.quit_requested.store(true, Ordering::SeqCst),
            }
        }
        self.inner.run_due_timers();
        (self.tasks_run() - before) as usize
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("kind", &self.inner.kind)
            .field("name", &self.inner.name)
            .finish()
    }
}

fn resume_panic(payload: Box<dyn Any + Send>) -> ! {
    panic::resume_unwind(payload)
}

/// Wait for a reply while still serving invokes addressed to `own`.
///
/// Timers and posts stay queued until the outer task returns, so only an
/// envelope or the reply can wake this wait.
fn wait_pumping<R>(own: &Arc<Inner>, reply_rx: &Receiver<R>) -> Option<R> {
    loop {
        select! {
            recv(reply_rx) -> reply => return reply.ok(),
            recv(own.rx) -> envelope => match envelope {
                Ok(envelope) => own.handle_nested(envelope),
                Err(_) => return reply_rx.recv().ok(),
            },
        }
    }
}

/// An owned execution context. Dropping it stops and joins the thread.
pub struct Context {
    handle: ContextHandle,
    thread: Option<JoinHandle<()>>,
}

impl Context {
    /// Spawn a new context thread
    pub fn spawn(kind: ContextKind) -> Result<Self, DispatchError> {
        Self::spawn_named(kind, kind.name())
    }

    pub fn spawn_named(kind: ContextKind, name: &str) -> Result<Self, DispatchError> {
        let (tx, rx) = unbounded();
        let inner = Arc::new(Inner {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            name: name.to_string(),
            tx: Mutex::new(Some(tx)),
            rx,
            timers: Mutex::new(BinaryHeap::new()),
            timer_seq: AtomicU64::new(0),
            deferred: Mutex::new(VecDeque::new()),
            quit_requested: AtomicBool::new(false),
            tasks_run: AtomicU64::new(0),
        });

        let loop_inner = inner.clone();
        let thread = thread::Builder::new()
            .name(format!("ctx-{}", name))
            .spawn(move || run_loop(loop_inner))
            .map_err(|e| DispatchError::Spawn(kind, e.to_string()))?;

        tracing::debug!(context = %name, "Context started");

        Ok(Self {
            handle: ContextHandle { inner },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    /// Stop the run loop and wait for the thread to exit
    pub fn stop(&mut self) {
        self.handle.inner.send(Envelope::Quit);

        if let Some(thread) = self.thread.take() {
            if self.handle.is_current() {
                // Cannot join ourselves; the loop exits after the current task.
                return;
            }
            if thread.join().is_err() {
                tracing::error!(context = %self.handle.name(), "Context thread panicked");
            }
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::ops::Deref for Context {
    type Target = ContextHandle;

    fn deref(&self) -> &ContextHandle {
        &self.handle
    }
}

fn run_loop(inner: Arc<Inner>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(inner.clone()));

    loop {
        inner.run_deferred();
        if inner.quit_requested.load(Ordering::SeqCst) {
            break;
        }

        let envelope = match inner.next_timer_delay() {
            Some(delay) => match inner.rx.recv_timeout(delay) {
                Ok(envelope) => Some(envelope),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match inner.rx.recv() {
                Ok(envelope) => Some(envelope),
                Err(_) => break,
            },
        };

        match envelope {
            Some(Envelope::Post(task)) | Some(Envelope::Invoke(task)) => {
                if panic::catch_unwind(AssertUnwindSafe(|| inner.run_task(task))).is_err() {
                    tracing::error!(context = %inner.name, "Posted task panicked");
                }
            }
            Some(Envelope::Quit) => break,
            Some(Envelope::Wake) | None => {}
        }

        inner.run_due_timers();
    }

    inner.shutdown();
    CURRENT.with(|c| c.borrow_mut().take());
    tracing::debug!(context = %inner.name, "Context stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_invoke_runs_on_context_thread() {
        let ctx = Context::spawn(ContextKind::Worker).unwrap();
        let handle = ctx.handle();

        assert!(!ctx.is_current());
        let on_ctx = ctx.invoke(move || handle.is_current()).unwrap();
        assert!(on_ctx);

        let name = ctx
            .invoke(|| thread::current().name().map(str::to_string))
            .unwrap();
        assert_eq!(name.as_deref(), Some("ctx-worker"));
    }

    #[test]
    fn test_invoke_inline_when_current() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let handle = ctx.handle();

        // A nested invoke on the same context must not deadlock.
        let value = ctx
            .invoke(move || handle.invoke(|| 41 + 1).unwrap())
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_two_hop_cycle_completes() {
        let worker = Context::spawn(ContextKind::Worker).unwrap();
        let network = Context::spawn(ContextKind::Network).unwrap();
        let w = worker.handle();
        let n = network.handle();

        let result = worker
            .invoke(move || {
                let w2 = w.clone();
                n.invoke(move || w2.invoke(|| "back on worker").unwrap())
                    .unwrap()
            })
            .unwrap();

        assert_eq!(result, "back on worker");
    }

    #[test]
    fn test_posts_run_in_order() {
        let ctx = Context::spawn(ContextKind::Signaling).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = log.clone();
            ctx.post(move || log.lock().push(i));
        }
        ctx.invoke(|| ()).unwrap();

        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_post_delayed_runs_after_delay() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let (tx, rx) = bounded(1);
        let start = Instant::now();

        ctx.post_delayed(Duration::from_millis(20), move || {
            let _ = tx.send(Instant::now());
        });

        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(20));
    }

    #[test]
    fn test_due_timer_waits_for_nested_invoke() {
        let worker = Context::spawn(ContextKind::Worker).unwrap();
        let network = Context::spawn(ContextKind::Network).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let w = worker.handle();
        let n = network.handle();
        let l = log.clone();
        worker
            .invoke(move || {
                let timer_log = l.clone();
                w.post_delayed(Duration::ZERO, move || timer_log.lock().push("timer"));
                let before = w.tasks_run();

                n.invoke(|| thread::sleep(Duration::from_millis(100))).unwrap();

                assert_eq!(w.tasks_run(), before);
                l.lock().push("invoke");
            })
            .unwrap();
        worker.invoke(|| ()).unwrap();

        assert_eq!(*log.lock(), vec!["invoke", "timer"]);
    }

    #[test]
    fn test_stopped_context_rejects_invoke() {
        let mut ctx = Context::spawn(ContextKind::Worker).unwrap();
        let handle = ctx.handle();
        ctx.stop();

        assert!(!handle.is_running());
        assert_eq!(
            handle.invoke(|| 1),
            Err(DispatchError::ContextStopped(ContextKind::Worker))
        );
        assert!(!handle.post(|| {}));
    }

    #[test]
    fn test_panic_is_reraised_on_caller() {
        let ctx = Context::spawn(ContextKind::Worker).unwrap();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = ctx.invoke(|| panic!("boom"));
        }));
        assert!(result.is_err());

        // The context survives the panic.
        assert_eq!(ctx.invoke(|| 5).unwrap(), 5);
    }

    #[test]
    fn test_process_pending_only_on_own_thread() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let handle = ctx.handle();
        let counter = Arc::new(AtomicUsize::new(0));

        assert_eq!(ctx.process_pending(), 0);

        let c = counter.clone();
        let ran = ctx
            .invoke(move || {
                let c2 = c.clone();
                handle.post(move || {
                    c2.fetch_add(1, Ordering::SeqCst);
                });
                handle.process_pending()
            })
            .unwrap();

        assert_eq!(ran, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
