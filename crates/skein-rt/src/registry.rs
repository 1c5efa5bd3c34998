// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime registry: active listeners and stop handlers.
//!
//! Lives as long as its scheduler, independent of any single call. All
//! mutation goes through mutexes, so registration is safe from any thread.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::error::DomainError;
use crate::future::{callback_fn, FutureHandle};
use crate::runtime::Isolation;
use crate::scheduler::{Lane, Scheduler, UnitOfWork};
use crate::strand::{Strand, StrandMetadata};
use crate::value::{ObjectId, ObjectRef, TypeTag, Value};

/// Method invoked on every registered listener during graceful stop.
pub const GRACEFUL_STOP_METHOD: &str = "gracefulStop";

/// A shutdown hook.
pub type StopHandler = Arc<dyn Fn(&Strand) -> Result<(), DomainError> + Send + Sync>;

/// Which part of graceful stop failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStage {
    /// Stop handler, by registration index.
    Handler(usize),
    Listener(ObjectId),
}

impl fmt::Display for StopStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopStage::Handler(i) => write!(f, "stop handler {}", i),
            StopStage::Listener(id) => write!(f, "listener {}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopFailure {
    pub stage: StopStage,
    pub error: DomainError,
}

/// Outcome of a graceful stop. Failures never stop later steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopReport {
    pub handlers_run: usize,
    pub listeners_stopped: usize,
    pub failures: Vec<StopFailure>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
pub struct RuntimeRegistry {
    listeners: Mutex<Vec<ObjectRef>>,
    stop_handlers: Mutex<Vec<StopHandler>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same listener twice keeps one entry.
    pub fn register_listener(&self, listener: ObjectRef) {
        let mut listeners = self.listeners.lock().unwrap();
        if !listeners.iter().any(|l| l.ptr_eq(&listener)) {
            tracing::debug!(listener = %listener.id(), "listener registered");
            listeners.push(listener);
        }
    }

    /// Remove exactly this listener. Unknown listeners are ignored.
    pub fn deregister_listener(&self, listener: &ObjectRef) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(pos) = listeners.iter().position(|l| l.ptr_eq(listener)) {
            listeners.remove(pos);
            tracing::debug!(listener = %listener.id(), "listener deregistered");
        }
    }

    pub fn register_stop_handler<F>(&self, handler: F)
    where
        F: Fn(&Strand) -> Result<(), DomainError> + Send + Sync + 'static,
    {
        self.stop_handlers.lock().unwrap().push(Arc::new(handler));
    }

    pub fn listeners(&self) -> Vec<ObjectRef> {
        self.listeners.lock().unwrap().clone()
    }

    pub fn stop_handler_count(&self) -> usize {
        self.stop_handlers.lock().unwrap().len()
    }

    /// Run every stop handler in registration order, then ask every
    /// listener to stop gracefully.
    ///
    /// Handlers run on the calling thread. A listener's `gracefulStop` is
    /// scheduled like any other call: on the listener's group lane unless
    /// the method is isolated, so it never overlaps the listener's other
    /// non-isolated calls. Every listener is asked before any is waited on.
    ///
    /// Handlers are consumed; a second call only revisits listeners still
    /// registered. Each step's error or panic is recorded and the next
    /// step runs regardless. Blocks on the listener calls, so it must not
    /// run inside a unit of work.
    pub fn graceful_stop(&self, scheduler: &Scheduler) -> StopReport {
        let handlers: Vec<StopHandler> = std::mem::take(&mut *self.stop_handlers.lock().unwrap());
        let listeners = self.listeners();
        let mut report = StopReport::default();

        for (index, handler) in handlers.iter().enumerate() {
            let strand = Strand::detached(format!("stop-handler-{}", index));
            report.handlers_run += 1;
            if let Err(error) = contained(|| handler(&strand)) {
                tracing::warn!(handler = index, error = %error, "stop handler failed");
                report.failures.push(StopFailure {
                    stage: StopStage::Handler(index),
                    error,
                });
            }
        }

        let mut stopping = Vec::new();
        for listener in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| stop_listener(scheduler, &listener))) {
                Ok(Some(future)) => stopping.push((listener.id(), future)),
                Ok(None) => {}
                Err(payload) => stopping_failed(
                    &mut report,
                    listener.id(),
                    DomainError::from_panic(payload),
                ),
            }
        }

        for (id, future) in stopping {
            report.listeners_stopped += 1;
            if let Err(error) = future.wait() {
                stopping_failed(&mut report, id, error);
            }
        }

        report
    }
}

/// Schedule `gracefulStop` on `listener`. `None` if it has no such method.
fn stop_listener(scheduler: &Scheduler, listener: &ObjectRef) -> Option<FutureHandle> {
    let ty = listener.object_type();
    ty.get_method(GRACEFUL_STOP_METHOD)?;
    let lane = Isolation::of(ty, GRACEFUL_STOP_METHOD).lane();

    let future = scheduler.create_future(
        None,
        callback_fn(|_| {}),
        None,
        TypeTag::Nil,
        Some(format!("listener-stop-{}", listener.id())),
        StrandMetadata::new(ty.name.clone(), GRACEFUL_STOP_METHOD),
    );
    let target = listener.clone();
    let unit: UnitOfWork =
        Box::new(move |strand| target.call(strand, GRACEFUL_STOP_METHOD, &[]).map(|_| Value::Nil));
    let placed = match lane {
        Lane::Free => scheduler.schedule(unit, &future),
        Lane::Group => scheduler.schedule_to_object_group(listener, unit, &future),
    };
    // A refusal has already failed the future.
    if let Err(e) = placed {
        tracing::debug!(listener = %listener.id(), error = %e, "graceful stop not scheduled");
    }
    Some(future)
}

fn stopping_failed(report: &mut StopReport, listener: ObjectId, error: DomainError) {
    tracing::warn!(%listener, error = %error, "listener failed to stop");
    report.failures.push(StopFailure {
        stage: StopStage::Listener(listener),
        error,
    });
}

/// Run `f`, turning a panic into a runtime error.
fn contained<F>(f: F) -> Result<(), DomainError>
where
    F: FnOnce() -> Result<(), DomainError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(DomainError::from_panic(payload)),
    }
}

impl fmt::Debug for RuntimeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeRegistry")
            .field("listeners", &self.listeners.lock().unwrap().len())
            .field("stop_handlers", &self.stop_handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{MethodType, ObjectType, RuntimeObject, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Listener {
        ty: ObjectType,
        stops: Arc<AtomicUsize>,
        fail: bool,
    }

    impl RuntimeObject for Listener {
        fn object_type(&self) -> &ObjectType {
            &self.ty
        }

        fn call(&self, _: &Strand, method: &str, _: &[Value]) -> Result<Value, DomainError> {
            assert_eq!(method, GRACEFUL_STOP_METHOD);
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DomainError::new("port still busy"))
            } else {
                Ok(Value::Nil)
            }
        }
    }

    fn listener(stops: &Arc<AtomicUsize>, fail: bool) -> ObjectRef {
        ObjectRef::new(Listener {
            ty: ObjectType::new("Listener").method(MethodType::new(GRACEFUL_STOP_METHOD)),
            stops: stops.clone(),
            fail,
        })
    }

    fn isolated_listener(stops: &Arc<AtomicUsize>) -> ObjectRef {
        ObjectRef::new(Listener {
            ty: ObjectType::new("Listener")
                .isolated()
                .method(MethodType::new(GRACEFUL_STOP_METHOD).isolated()),
            stops: stops.clone(),
            fail: false,
        })
    }

    #[test]
    fn deregister_unknown_listener_is_noop() {
        let registry = RuntimeRegistry::new();
        let stops = Arc::new(AtomicUsize::new(0));
        let known = listener(&stops, false);
        registry.register_listener(known.clone());
        registry.deregister_listener(&listener(&stops, false));
        assert_eq!(registry.listeners().len(), 1);
        registry.deregister_listener(&known);
        registry.deregister_listener(&known);
        assert!(registry.listeners().is_empty());
    }

    #[test]
    fn register_is_idempotent() {
        let registry = RuntimeRegistry::new();
        let stops = Arc::new(AtomicUsize::new(0));
        let l = listener(&stops, false);
        registry.register_listener(l.clone());
        registry.register_listener(l.clone());
        assert_eq!(registry.listeners(), vec![l]);
    }

    #[test]
    fn handlers_run_in_order_and_failures_are_contained() {
        let registry = RuntimeRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        registry.register_stop_handler(move |_| {
            o.lock().unwrap().push("A");
            Ok(())
        });
        let o = order.clone();
        registry.register_stop_handler(move |_| {
            o.lock().unwrap().push("B");
            Err(DomainError::new("B failed"))
        });
        let o = order.clone();
        registry.register_stop_handler(move |_| {
            o.lock().unwrap().push("C");
            Ok(())
        });

        let sched = Scheduler::with_pool_size(2);
        let report = registry.graceful_stop(&sched);
        assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(report.handlers_run, 3);
        assert_eq!(
            report.failures,
            vec![StopFailure {
                stage: StopStage::Handler(1),
                error: DomainError::new("B failed"),
            }]
        );
        assert_eq!(registry.stop_handler_count(), 0);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let registry = RuntimeRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));
        registry.register_stop_handler(|_| panic!("handler exploded"));
        let r = ran.clone();
        registry.register_stop_handler(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let sched = Scheduler::with_pool_size(2);
        let report = registry.graceful_stop(&sched);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.is_runtime());
        assert_eq!(report.failures[0].error.message, "handler exploded");
    }

    #[test]
    fn listeners_are_stopped_after_handlers() {
        let registry = RuntimeRegistry::new();
        let stops = Arc::new(AtomicUsize::new(0));
        let bad = listener(&stops, true);
        registry.register_listener(bad.clone());
        registry.register_listener(listener(&stops, false));

        let sched = Scheduler::with_pool_size(2);
        let report = registry.graceful_stop(&sched);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert_eq!(report.listeners_stopped, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, StopStage::Listener(bad.id()));
        assert_eq!(report.failures[0].error, DomainError::new("port still busy"));
    }

    #[test]
    fn listener_stop_follows_method_isolation() {
        let sched = Scheduler::with_pool_size(2);
        let registry = RuntimeRegistry::new();
        let stops = Arc::new(AtomicUsize::new(0));
        registry.register_listener(isolated_listener(&stops));
        assert!(registry.graceful_stop(&sched).is_clean());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(sched.group_count(), 0);

        registry.register_listener(listener(&stops, false));
        assert!(registry.graceful_stop(&sched).is_clean());
        assert_eq!(stops.load(Ordering::SeqCst), 3);
        assert_eq!(sched.group_count(), 1);
    }

    #[test]
    fn listeners_without_graceful_stop_are_skipped() {
        let sched = Scheduler::with_pool_size(1);
        let registry = RuntimeRegistry::new();
        let stops = Arc::new(AtomicUsize::new(0));
        registry.register_listener(ObjectRef::new(Listener {
            ty: ObjectType::new("Quiet"),
            stops: stops.clone(),
            fail: false,
        }));
        let report = registry.graceful_stop(&sched);
        assert_eq!(report.listeners_stopped, 0);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stopping_after_shutdown_is_reported() {
        let sched = Scheduler::with_pool_size(1);
        sched.shutdown();
        let registry = RuntimeRegistry::new();
        let stops = Arc::new(AtomicUsize::new(0));
        registry.register_listener(listener(&stops, false));
        let report = registry.graceful_stop(&sched);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.is_runtime());
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_registration() {
        let registry = Arc::new(RuntimeRegistry::new());
        let stops = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let stops = stops.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        let l = listener(&stops, false);
                        registry.register_listener(l.clone());
                        registry.register_stop_handler(|_| Ok(()));
                        registry.deregister_listener(&l);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(registry.listeners().is_empty());
        assert_eq!(registry.stop_handler_count(), 200);
    }
}
