// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Futures and the two-outcome callback protocol.
//!
//! A future is write-once. The first completion decides the outcome and
//! fires the callback; any later completion is rejected with
//! `FutureError::AlreadyCompleted` and the callback is left alone.
//! Callbacks run on whichever thread completes the future.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{panic_message, DomainError, FutureError};
use crate::strand::Strand;
use crate::value::{TypeTag, Value};

/// Completion notification for one scheduled unit of work.
///
/// Methods take `self: Box<Self>`: a callback is consumed by the single
/// notification it receives.
pub trait Callback: Send {
    fn notify_success(self: Box<Self>, value: Value);
    fn notify_failure(self: Box<Self>, error: DomainError);
}

/// Callback built from a single closure over the outcome.
pub struct FnCallback<F>(F);

impl<F> Callback for FnCallback<F>
where
    F: FnOnce(Result<Value, DomainError>) + Send,
{
    fn notify_success(self: Box<Self>, value: Value) {
        (self.0)(Ok(value))
    }

    fn notify_failure(self: Box<Self>, error: DomainError) {
        (self.0)(Err(error))
    }
}

/// Wrap a closure as a boxed callback.
pub fn callback_fn<F>(f: F) -> Box<dyn Callback>
where
    F: FnOnce(Result<Value, DomainError>) + Send + 'static,
{
    Box::new(FnCallback(f))
}

/// Typed pipeline stage: receives the previous stage's outcome exactly once.
pub type Continuation<T> = Box<dyn FnOnce(Result<T, DomainError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FutureId(pub(crate) u64);

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Observable future state.
#[derive(Debug, Clone, PartialEq)]
pub enum FutureState {
    Pending,
    Succeeded(Value),
    Failed(DomainError),
}

impl FutureState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FutureState::Pending)
    }
}

struct Slot {
    state: FutureState,
    callback: Option<Box<dyn Callback>>,
    /// Set once the callback has returned; `wait` blocks on this.
    notified: bool,
}

/// Completion handle for one unit of work.
pub struct FutureValue {
    id: FutureId,
    strand: Strand,
    return_type: TypeTag,
    slot: Mutex<Slot>,
    done: Condvar,
    /// A future may be placed on a lane once.
    claimed: AtomicBool,
}

/// Shared future handle returned to callers.
pub type FutureHandle = Arc<FutureValue>;

impl FutureValue {
    pub(crate) fn new(
        id: FutureId,
        strand: Strand,
        callback: Box<dyn Callback>,
        return_type: TypeTag,
    ) -> FutureHandle {
        Arc::new(Self {
            id,
            strand,
            return_type,
            slot: Mutex::new(Slot {
                state: FutureState::Pending,
                callback: Some(callback),
                notified: false,
            }),
            done: Condvar::new(),
            claimed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> FutureId {
        self.id
    }

    pub fn strand(&self) -> &Strand {
        &self.strand
    }

    pub fn return_type(&self) -> &TypeTag {
        &self.return_type
    }

    pub fn state(&self) -> FutureState {
        self.slot.lock().unwrap().state.clone()
    }

    pub fn is_done(&self) -> bool {
        self.slot.lock().unwrap().state.is_terminal()
    }

    /// Block until the future completes and its callback has run.
    pub fn wait(&self) -> Result<Value, DomainError> {
        let mut slot = self.slot.lock().unwrap();
        while !slot.notified {
            slot = self.done.wait(slot).unwrap();
        }
        outcome_of(&slot.state)
    }

    /// Like `wait`, giving up after `timeout`. The unit of work keeps
    /// running; a late result still reaches the callback.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Value, DomainError>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap();
        while !slot.notified {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self.done.wait_timeout(slot, deadline - now).unwrap().0;
        }
        Some(outcome_of(&slot.state))
    }

    /// Mark the future as placed on a lane. False if it already was.
    pub(crate) fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub(crate) fn succeed(&self, value: Value) -> Result<(), FutureError> {
        self.complete(Ok(value))
    }

    pub(crate) fn fail(&self, error: DomainError) -> Result<(), FutureError> {
        self.complete(Err(error))
    }

    /// Transition Pending -> terminal and fire the callback once.
    ///
    /// The callback runs outside the slot lock. A panicking callback is
    /// logged and does not unwind into the completing thread.
    pub(crate) fn complete(&self, outcome: Result<Value, DomainError>) -> Result<(), FutureError> {
        let callback = {
            let mut slot = self.slot.lock().unwrap();
            if slot.state.is_terminal() {
                return Err(FutureError::AlreadyCompleted { future: self.id });
            }
            slot.state = match &outcome {
                Ok(v) => FutureState::Succeeded(v.clone()),
                Err(e) => FutureState::Failed(e.clone()),
            };
            slot.callback.take()
        };

        tracing::debug!(
            future = %self.id,
            strand = %self.strand.display_name(),
            ok = outcome.is_ok(),
            "future completed"
        );

        if let Some(cb) = callback {
            let fired = panic::catch_unwind(AssertUnwindSafe(move || match outcome {
                Ok(v) => cb.notify_success(v),
                Err(e) => cb.notify_failure(e),
            }));
            if let Err(payload) = fired {
                tracing::error!(
                    future = %self.id,
                    panic = %panic_message(payload.as_ref()),
                    "callback panicked"
                );
            }
        }

        let mut slot = self.slot.lock().unwrap();
        slot.notified = true;
        self.done.notify_all();
        Ok(())
    }
}

fn outcome_of(state: &FutureState) -> Result<Value, DomainError> {
    match state {
        FutureState::Succeeded(v) => Ok(v.clone()),
        FutureState::Failed(e) => Err(e.clone()),
        FutureState::Pending => unreachable!("notified future is terminal"),
    }
}

impl fmt::Debug for FutureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureValue")
            .field("id", &self.id)
            .field("strand", &self.strand.display_name())
            .field("return_type", &self.return_type)
            .field("state", &self.state())
            .finish()
    }
}
