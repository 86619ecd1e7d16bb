//! Thread affinity dispatcher
//!
//! Owns the network, worker and signaling contexts and routes a closure to
//! the one it belongs on.

use crate::error::DispatchError;
use crate::thread::context::{Context, ContextHandle, ContextKind};

/// The engine's three execution contexts
pub struct Dispatcher {
    network: Context,
    worker: Context,
    signaling: Context,
}

impl Dispatcher {
    /// Spawn all three context threads
    pub fn new() -> Result<Self, DispatchError> {
        Ok(Self {
            network: Context::spawn(ContextKind::Network)?,
            worker: Context::spawn(ContextKind::Worker)?,
            signaling: Context::spawn(ContextKind::Signaling)?,
        })
    }

    pub fn context(&self, kind: ContextKind) -> ContextHandle {
        match kind {
            ContextKind::Network => self.network.handle(),
            ContextKind::Worker => self.worker.handle(),
            ContextKind::Signaling => self.signaling.handle(),
        }
    }

    pub fn network(&self) -> ContextHandle {
        self.network.handle()
    }

    pub fn worker(&self) -> ContextHandle {
        self.worker.handle()
    }

    pub fn signaling(&self) -> ContextHandle {
        self.signaling.handle()
    }

    /// Which of the three contexts the caller is on, if any
    pub fn current(&self) -> Option<ContextKind> {
        ContextKind::ALL
            .into_iter()
            .find(|kind| self.context(*kind).is_current())
    }

    /// Run `f` on `kind`, inline if already there, and return its result
    pub fn run_on<R, F>(&self, kind: ContextKind, f: F) -> Result<R, DispatchError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let target = self.context(kind);
        if !target.is_current() {
            tracing::trace!(target_context = %kind, from = ?self.current(), "Marshaling call");
        }
        target.invoke(f)
    }

    /// Stop contexts in reverse dependency order: signaling, worker, network
    pub fn stop(&mut self) {
        self.signaling.stop();
        self.worker.stop();
        self.network.stop();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_run_on_reports_current_context() {
        let dispatcher = Arc::new(Dispatcher::new().unwrap());
        assert_eq!(dispatcher.current(), None);

        for kind in ContextKind::ALL {
            let d = dispatcher.clone();
            let seen = dispatcher.run_on(kind, move || d.current()).unwrap();
            assert_eq!(seen, Some(kind));
        }
    }

    #[test]
    fn test_foreign_dispatch_matches_direct_result() {
        let dispatcher = Arc::new(Dispatcher::new().unwrap());
        let counter = Arc::new(AtomicUsize::new(10));

        let c = counter.clone();
        let direct = dispatcher
            .run_on(ContextKind::Worker, move || c.fetch_add(1, Ordering::SeqCst) * 2)
            .unwrap();

        let d = dispatcher.clone();
        let c = counter.clone();
        let via_network = dispatcher
            .run_on(ContextKind::Network, move || {
                d.run_on(ContextKind::Worker, move || c.fetch_add(1, Ordering::SeqCst) * 2)
            })
            .unwrap()
            .unwrap();

        assert_eq!(direct, 20);
        assert_eq!(via_network, 22);
    }

    #[test]
    fn test_stop_rejects_further_work() {
        let mut dispatcher = Dispatcher::new().unwrap();
        dispatcher.stop();

        for kind in ContextKind::ALL {
            assert_eq!(
                dispatcher.run_on(kind, || ()),
                Err(DispatchError::ContextStopped(kind))
            );
        }
    }
}
