// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use skein_rt::{
    callback_fn, Callback, DomainError, MethodType, ObjectRef, ObjectType, Param, RuntimeObject,
    Strand, Value,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init() {
    skein_rt::logging::init_test_logging();
}

/// Callback that forwards its outcome to a channel.
pub fn channel() -> (Box<dyn Callback>, mpsc::Receiver<Result<Value, DomainError>>) {
    let (tx, rx) = mpsc::channel();
    (
        callback_fn(move |outcome| {
            let _ = tx.send(outcome);
        }),
        rx,
    )
}

/// Records what ran on an object and whether two calls ever overlapped.
#[derive(Default)]
pub struct Probe {
    pub order: Mutex<Vec<i64>>,
    pub calls: AtomicUsize,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub overlapped: AtomicBool,
}

impl Probe {
    fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        if now > 1 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.max_running.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn order(&self) -> Vec<i64> {
        self.order.lock().unwrap().clone()
    }
}

/// A stateful service object.
///
/// - `work(tag, ms = 0)`: sleeps `ms`, records `tag`, returns it.
/// - `bump()`: unsynchronized read-modify-write on a counter.
/// - `fail(msg)`: raises a domain error.
/// - `crash()`: panics.
/// - `needs(x = <failing default>)`: never reached without `x`.
pub struct Service {
    ty: ObjectType,
    probe: Arc<Probe>,
    counter: Mutex<i64>,
}

impl Service {
    fn service_type(isolated: bool) -> ObjectType {
        let work = MethodType::new("work")
            .param(Param::required("tag"))
            .param(Param::with_default("ms", |_, _| Ok(Value::Int(0))));
        let (ty, work) = if isolated {
            (ObjectType::new("Service").isolated(), work.isolated())
        } else {
            (ObjectType::new("Service"), work)
        };
        ty.method(work)
            .method(MethodType::new("bump"))
            .method(MethodType::new("fail").param(Param::required("msg")))
            .method(MethodType::new("crash"))
            .method(
                MethodType::new("needs")
                    .param(Param::with_default("x", |_, _| {
                        Err(DomainError::new("no value for x"))
                    })),
            )
    }

    pub fn new(probe: &Arc<Probe>) -> ObjectRef {
        Self::build(probe, false)
    }

    /// Isolated type whose `work` method is isolated.
    pub fn isolated(probe: &Arc<Probe>) -> ObjectRef {
        Self::build(probe, true)
    }

    fn build(probe: &Arc<Probe>, isolated: bool) -> ObjectRef {
        ObjectRef::new(Service {
            ty: Self::service_type(isolated),
            probe: probe.clone(),
            counter: Mutex::new(0),
        })
    }
}

impl RuntimeObject for Service {
    fn object_type(&self) -> &ObjectType {
        &self.ty
    }

    fn call(&self, _strand: &Strand, method: &str, args: &[Value]) -> Result<Value, DomainError> {
        self.probe.enter();
        let result = match method {
            "work" => {
                let ms = args.get(1).and_then(Value::as_int).unwrap_or(0);
                thread::sleep(Duration::from_millis(ms as u64));
                let tag = args[0].as_int().unwrap_or(-1);
                self.probe.order.lock().unwrap().push(tag);
                Ok(Value::Int(tag))
            }
            "bump" => {
                let seen = *self.counter.lock().unwrap();
                thread::yield_now();
                *self.counter.lock().unwrap() = seen + 1;
                Ok(Value::Int(seen + 1))
            }
            "fail" => Err(DomainError::new(args[0].as_str().unwrap_or("failed"))),
            "crash" => {
                self.probe.leave();
                panic!("service crashed");
            }
            other => Err(DomainError::new(format!("unknown method '{}'", other))),
        };
        self.probe.leave();
        result
    }
}
