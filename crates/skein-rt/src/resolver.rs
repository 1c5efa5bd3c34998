// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Default-argument resolution.
//!
//! Parameters the caller omitted are filled from their default
//! expressions before a call can be scheduled. Defaults are arbitrary
//! managed code, so each one runs as its own unit of work on the free
//! lane, in parameter order, each seeing the arguments resolved before it.
//! The chain reports exactly once through its continuation: the full
//! argument list, or the first error.

use std::sync::Arc;

use crate::error::DomainError;
use crate::future::{callback_fn, Continuation};
use crate::scheduler::Scheduler;
use crate::strand::{Strand, StrandMetadata};
use crate::value::{DefaultValue, ObjectRef, ObjectType, TypeTag, Value};

/// A default still to be evaluated.
struct Pending {
    param: String,
    default: DefaultValue,
}

/// Resolve omitted defaults for `receiver.method(args..)` and pass the
/// complete argument list to `next`.
///
/// Calls `next` synchronously when nothing needs resolving. Arity errors
/// and default-expression failures go to `next` as `Err` and nothing
/// further is scheduled.
pub fn resolve_arguments(
    scheduler: &Arc<Scheduler>,
    receiver: &ObjectRef,
    method: &str,
    parent: Option<&Strand>,
    args: Vec<Value>,
    next: Continuation<Vec<Value>>,
) {
    let pending = match plan(receiver.object_type(), method, args.len()) {
        Ok(pending) => pending,
        Err(e) => return next(Err(e)),
    };
    if pending.is_empty() {
        return next(Ok(args));
    }

    let metadata = StrandMetadata::new(receiver.object_type().name.clone(), method.to_string());
    let chain = Arc::new(Chain {
        scheduler: scheduler.clone(),
        pending,
        parent: parent.cloned(),
        metadata,
    });
    step(chain, 0, args, next);
}

/// Work out which defaults must run. Unknown methods pass their arguments
/// through untouched; the object's own dispatch decides what to do.
fn plan(ty: &ObjectType, method: &str, given: usize) -> Result<Vec<Pending>, DomainError> {
    let Some(sig) = ty.get_method(method) else {
        return Ok(Vec::new());
    };

    if given > sig.params.len() && !sig.rest {
        return Err(DomainError::new(format!(
            "too many arguments in call to '{}.{}': expected at most {}, found {}",
            ty.name,
            method,
            sig.params.len(),
            given
        )));
    }

    sig.params
        .iter()
        .skip(given)
        .map(|p| match &p.default {
            Some(default) => Ok(Pending {
                param: p.name.clone(),
                default: default.clone(),
            }),
            None => Err(DomainError::new(format!(
                "missing required argument '{}' in call to '{}.{}'",
                p.name, ty.name, method
            ))),
        })
        .collect()
}

struct Chain {
    scheduler: Arc<Scheduler>,
    pending: Vec<Pending>,
    parent: Option<Strand>,
    metadata: StrandMetadata,
}

/// Evaluate default `index`, then continue from its callback.
fn step(chain: Arc<Chain>, index: usize, mut args: Vec<Value>, next: Continuation<Vec<Value>>) {
    let Some(pending) = chain.pending.get(index) else {
        return next(Ok(args));
    };

    let default = pending.default.clone();
    let so_far = args.clone();
    let continue_with = chain.clone();
    let future = chain.scheduler.create_future(
        chain.parent.as_ref(),
        callback_fn(move |outcome| match outcome {
            Ok(value) => {
                args.push(value);
                step(continue_with, index + 1, args, next);
            }
            Err(e) => next(Err(e)),
        }),
        None,
        TypeTag::Any,
        Some(format!("default:{}", pending.param)),
        chain.metadata.clone(),
    );

    tracing::trace!(param = %pending.param, future = %future.id(), "resolving default");
    // A refused schedule has already failed the future, which reports
    // through the callback above.
    if let Err(e) = chain
        .scheduler
        .schedule(Box::new(move |strand| default(strand, &so_far)), &future)
    {
        tracing::debug!(error = %e, "default argument not scheduled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{MethodType, Param, RuntimeObject};
    use std::sync::mpsc;
    use std::time::Duration;

    struct Greeter(ObjectType);

    impl RuntimeObject for Greeter {
        fn object_type(&self) -> &ObjectType {
            &self.0
        }

        fn call(&self, _: &Strand, _: &str, _: &[Value]) -> Result<Value, DomainError> {
            Ok(Value::Nil)
        }
    }

    fn greeter() -> ObjectRef {
        let greet = MethodType::new("greet")
            .param(Param::required("name"))
            .param(Param::with_default("greeting", |_, _| Ok(Value::string("hello"))))
            .param(Param::with_default("times", |_, args| {
                // Depends on the earlier argument.
                Ok(Value::Int(args[1].as_str().map_or(0, |s| s.len() as i64)))
            }));
        let fail = MethodType::new("fail")
            .param(Param::with_default("x", |_, _| Err(DomainError::new("no default today"))));
        let log = MethodType::new("log").param(Param::required("line")).rest();
        ObjectRef::new(Greeter(
            ObjectType::new("Greeter").method(greet).method(fail).method(log),
        ))
    }

    fn resolve(
        sched: &Arc<Scheduler>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, DomainError> {
        let (tx, rx) = mpsc::channel();
        let done: Continuation<Vec<Value>> = Box::new(move |r| tx.send(r).unwrap());
        resolve_arguments(sched, &greeter(), method, None, args, done);
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn fills_defaults_in_order() {
        let sched = Arc::new(Scheduler::with_pool_size(2));
        let args = resolve(&sched, "greet", vec![Value::string("ann")]).unwrap();
        assert_eq!(args, vec![Value::string("ann"), Value::string("hello"), Value::Int(5)]);
    }

    #[test]
    fn explicit_arguments_skip_defaults() {
        let sched = Arc::new(Scheduler::with_pool_size(1));
        let given = vec![Value::string("ann"), Value::string("hi"), Value::Int(1)];
        assert_eq!(resolve(&sched, "greet", given.clone()).unwrap(), given);
    }

    #[test]
    fn no_defaults_needed_is_synchronous() {
        let sched = Arc::new(Scheduler::with_pool_size(1));
        let (tx, rx) = mpsc::channel();
        resolve_arguments(
            &sched,
            &greeter(),
            "unknown",
            None,
            vec![Value::Int(1)],
            Box::new(move |r| tx.send(r).unwrap()),
        );
        // Delivered before resolve_arguments returned.
        assert_eq!(rx.try_recv().ok(), Some(Ok(vec![Value::Int(1)])));
    }

    #[test]
    fn failing_default_short_circuits() {
        let sched = Arc::new(Scheduler::with_pool_size(1));
        assert_eq!(resolve(&sched, "fail", vec![]), Err(DomainError::new("no default today")));
    }

    #[test]
    fn arity_errors() {
        let sched = Arc::new(Scheduler::with_pool_size(1));
        let err = resolve(&sched, "greet", vec![]).unwrap_err();
        assert!(err.message.contains("missing required argument 'name'"));

        let err = resolve(&sched, "fail", vec![Value::Nil, Value::Nil]).unwrap_err();
        assert!(err.message.contains("too many arguments"));

        let args = vec![Value::string("a"), Value::string("b"), Value::string("c")];
        assert_eq!(resolve(&sched, "log", args.clone()).unwrap(), args);
    }

    #[test]
    fn resolution_after_shutdown_fails() {
        let sched = Arc::new(Scheduler::with_pool_size(1));
        sched.shutdown();
        let err = resolve(&sched, "greet", vec![Value::string("ann")]).unwrap_err();
        assert!(err.is_runtime());
    }
}
