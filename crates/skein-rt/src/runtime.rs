// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Invocation entry points.
//!
//! A call goes through four stages: validate, create the future, resolve
//! default arguments, place the call on a lane. The explicit modes pick
//! the lane themselves; the deprecated `invoke` asks the receiver's type.
//! Every failure, including a panic in the receiver's collaborator code
//! anywhere in the pipeline, reaches the caller through its callback. An
//! invocation missing its receiver or method is also returned as `Err`,
//! and no future is created for it.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::error::{ConfigError, DomainError, ValidationError};
use crate::future::{Callback, Continuation, FutureHandle};
use crate::registry::StopReport;
use crate::resolver::resolve_arguments;
use crate::scheduler::{Lane, Scheduler, UnitOfWork};
use crate::strand::{Properties, Strand, StrandMetadata};
use crate::value::{ObjectRef, ObjectType, TypeTag, Value};

/// One method call, before it is dispatched.
///
/// `receiver` and `method` are optional so an incomplete call can be
/// described; dispatch rejects it with a `ValidationError`.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub receiver: Option<ObjectRef>,
    pub method: Option<String>,
    pub strand_name: Option<String>,
    /// Defaults to the receiver's type name and the method name.
    pub metadata: Option<StrandMetadata>,
    pub properties: Option<Properties>,
    pub return_type: TypeTag,
    pub args: Vec<Value>,
    /// Strand this call is made from, if any.
    pub parent: Option<Strand>,
}

impl Invocation {
    pub fn new(receiver: ObjectRef, method: impl Into<String>) -> Self {
        Self {
            receiver: Some(receiver),
            method: Some(method.into()),
            ..Self::default()
        }
    }

    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn args(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(values);
        self
    }

    pub fn strand_name(mut self, name: impl Into<String>) -> Self {
        self.strand_name = Some(name.into());
        self
    }

    pub fn metadata(mut self, metadata: StrandMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn return_type(mut self, return_type: TypeTag) -> Self {
        self.return_type = return_type;
        self
    }

    pub fn parent(mut self, parent: &Strand) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Check receiver and method are present.
    pub fn validate(&self) -> Result<(&ObjectRef, &str), ValidationError> {
        let receiver = self.receiver.as_ref().ok_or(ValidationError::NullObject)?;
        let method = self.method.as_deref().ok_or(ValidationError::NullMethodName)?;
        Ok((receiver, method))
    }

    /// Isolation of the target method, queried once.
    pub fn isolation(&self) -> Result<Isolation, ValidationError> {
        let (receiver, method) = self.validate()?;
        Ok(Isolation::of(receiver.object_type(), method))
    }
}

/// Whether a call may skip its receiver's group lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Isolation {
    pub type_isolated: bool,
    pub method_isolated: bool,
}

impl Isolation {
    pub fn of(ty: &ObjectType, method: &str) -> Self {
        Self {
            type_isolated: ty.is_isolated(),
            method_isolated: ty.is_method_isolated(method),
        }
    }

    pub fn is_isolated(self) -> bool {
        self.type_isolated && self.method_isolated
    }

    pub fn lane(self) -> Lane {
        if self.is_isolated() {
            Lane::Free
        } else {
            Lane::Group
        }
    }
}

/// Public runtime surface: invocation, listener and stop-handler
/// registration, graceful stop.
///
/// Cheap to clone; clones share one scheduler.
#[derive(Clone)]
pub struct Runtime {
    scheduler: Arc<Scheduler>,
}

impl Runtime {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_scheduler(Arc::new(Scheduler::new(config)))
    }

    /// Configure from the environment (`SKEIN_MAX_POOL_SIZE`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(SchedulerConfig::from_env()?))
    }

    pub fn with_scheduler(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Run the call on the receiver's group lane, after and never
    /// alongside earlier calls on the same receiver.
    pub fn invoke_sequentially(
        &self,
        invocation: Invocation,
        callback: Box<dyn Callback>,
    ) -> Result<FutureHandle, ValidationError> {
        self.dispatch(invocation, callback, LaneChoice::Fixed(Lane::Group))
    }

    /// Run the call on the free lane. The caller vouches that the method is
    /// safe to run concurrently; nothing here checks it.
    pub fn invoke_concurrently(
        &self,
        invocation: Invocation,
        callback: Box<dyn Callback>,
    ) -> Result<FutureHandle, ValidationError> {
        self.dispatch(invocation, callback, LaneChoice::Fixed(Lane::Free))
    }

    /// Pick the lane from the receiver's type: free only when both the
    /// type and the method are isolated.
    #[deprecated(note = "use invoke_sequentially or invoke_concurrently")]
    pub fn invoke(
        &self,
        invocation: Invocation,
        callback: Box<dyn Callback>,
    ) -> Result<FutureHandle, ValidationError> {
        self.dispatch(invocation, callback, LaneChoice::ByIsolation)
    }

    /// A missing receiver or method is reported twice: as the returned
    /// `Err`, and through `callback` as a runtime error. No future is
    /// created for it.
    fn dispatch(
        &self,
        invocation: Invocation,
        callback: Box<dyn Callback>,
        choice: LaneChoice,
    ) -> Result<FutureHandle, ValidationError> {
        let Invocation {
            receiver,
            method,
            strand_name,
            metadata,
            properties,
            return_type,
            args,
            parent,
        } = invocation;
        let (receiver, method) = match (receiver, method) {
            (Some(receiver), Some(method)) => (receiver, method),
            (None, _) => return Err(reject(callback, ValidationError::NullObject)),
            (_, None) => return Err(reject(callback, ValidationError::NullMethodName)),
        };

        // The receiver's type is only consulted under `catch_unwind`.
        let (metadata, fault) = match metadata {
            Some(metadata) => (metadata, None),
            None => match guarded(|| receiver.object_type().name.clone()) {
                Ok(type_name) => (StrandMetadata::new(type_name, method.clone()), None),
                Err(e) => (
                    StrandMetadata {
                        parent_function: Some(method.clone()),
                        ..StrandMetadata::default()
                    },
                    Some(e),
                ),
            },
        };
        let future = self.scheduler.create_future(
            parent.as_ref(),
            callback,
            properties,
            return_type,
            strand_name,
            metadata,
        );
        if let Some(e) = fault {
            fail(&future, e);
            return Ok(future);
        }

        let pipeline = guarded(|| {
            let lane = match choice {
                LaneChoice::Fixed(lane) => lane,
                LaneChoice::ByIsolation => Isolation::of(receiver.object_type(), &method).lane(),
            };
            let next = placement(
                self.scheduler.clone(),
                lane,
                receiver.clone(),
                method.clone(),
                future.clone(),
            );
            resolve_arguments(
                &self.scheduler,
                &receiver,
                &method,
                Some(future.strand()),
                args,
                next,
            );
        });
        if let Err(e) = pipeline {
            fail(&future, e);
        }
        Ok(future)
    }

    pub fn register_listener(&self, listener: ObjectRef) {
        self.scheduler.registry().register_listener(listener);
    }

    pub fn deregister_listener(&self, listener: &ObjectRef) {
        self.scheduler.registry().deregister_listener(listener);
    }

    pub fn register_stop_handler<F>(&self, handler: F)
    where
        F: Fn(&Strand) -> Result<(), DomainError> + Send + Sync + 'static,
    {
        self.scheduler.registry().register_stop_handler(handler);
    }

    /// Run stop handlers, stop listeners, then shut the scheduler down.
    ///
    /// Blocks until every listener has stopped and in-flight work is done,
    /// so it must not be called from a unit of work.
    pub fn stop(&self) -> StopReport {
        let report = self.scheduler.registry().graceful_stop(&self.scheduler);
        if !report.is_clean() {
            tracing::warn!(
                failures = report.failures.len(),
                "graceful stop finished with failures"
            );
        }
        self.scheduler.shutdown();
        report
    }
}

/// How `dispatch` picks a lane.
#[derive(Clone, Copy)]
enum LaneChoice {
    Fixed(Lane),
    /// Ask the receiver's type, inside the guarded pipeline.
    ByIsolation,
}

/// Report a validation failure through the callback and hand it back.
fn reject(callback: Box<dyn Callback>, error: ValidationError) -> ValidationError {
    tracing::debug!(%error, "invocation rejected");
    let notified = panic::catch_unwind(AssertUnwindSafe(move || {
        callback.notify_failure(DomainError::runtime(error.to_string()))
    }));
    if notified.is_err() {
        tracing::error!(%error, "callback panicked on a rejected invocation");
    }
    error
}

/// Run `f`, turning a panic into a runtime error.
fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, DomainError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(DomainError::from_panic)
}

/// Second pipeline stage: take the resolved arguments and place the call.
///
/// Holds the scheduler open until the call is placed or has failed.
fn placement(
    scheduler: Arc<Scheduler>,
    lane: Lane,
    receiver: ObjectRef,
    method: String,
    future: FutureHandle,
) -> Continuation<Vec<Value>> {
    let activity = scheduler.track();
    Box::new(move |resolved| {
        let placed = guarded(|| match resolved {
            Ok(args) => place(&scheduler, lane, receiver, method, args, &future),
            Err(e) => {
                tracing::debug!(future = %future.id(), error = %e, "argument resolution failed");
                fail(&future, e);
            }
        });
        if let Err(e) = placed {
            fail(&future, e);
        }
        drop(activity);
    })
}

fn place(
    scheduler: &Scheduler,
    lane: Lane,
    receiver: ObjectRef,
    method: String,
    args: Vec<Value>,
    future: &FutureHandle,
) {
    let target = receiver.clone();
    let unit: UnitOfWork = Box::new(move |strand| target.call(strand, &method, &args));
    let placed = match lane {
        Lane::Free => scheduler.schedule(unit, future),
        Lane::Group => scheduler.schedule_to_object_group(&receiver, unit, future),
    };
    // A refusal has already failed the future.
    if let Err(e) = placed {
        tracing::debug!(future = %future.id(), error = %e, "call not scheduled");
    }
}

fn fail(future: &FutureHandle, error: DomainError) {
    if let Err(e) = future.fail(error) {
        tracing::debug!(error = %e, "failure after completion dropped");
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").field("scheduler", &self.scheduler).finish()
    }
}
