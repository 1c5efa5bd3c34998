// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Skein runtime: strand scheduling for a managed language.
//!
//! Method calls become units of work on a fixed worker pool. Calls that
//! are not proven isolated run on their receiver's object group, one at a
//! time and in submission order. Isolated calls run on the free lane with
//! no ordering. Every scheduled call reports exactly once through its
//! future's callback.
//!
//! ```no_run
//! use skein_rt::{callback_fn, Invocation, Runtime, SchedulerConfig};
//! # fn receiver() -> skein_rt::ObjectRef { unimplemented!() }
//!
//! let rt = Runtime::new(SchedulerConfig::default());
//! let future = rt
//!     .invoke_sequentially(
//!         Invocation::new(receiver(), "handle"),
//!         callback_fn(|outcome| println!("{:?}", outcome)),
//!     )
//!     .expect("receiver and method are set");
//! let _ = future.wait();
//! rt.stop();
//! ```

pub mod config;
pub mod error;
pub mod future;
mod group;
pub mod logging;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod scheduler;
pub mod strand;
pub mod value;

pub use config::SchedulerConfig;
pub use error::{
    ConfigError, DomainError, DomainErrorKind, FutureError, ScheduleError, ValidationError,
};
pub use future::{
    callback_fn, Callback, Continuation, FutureHandle, FutureId, FutureState, FutureValue,
};
pub use registry::{RuntimeRegistry, StopFailure, StopReport, StopStage};
pub use runtime::{Invocation, Isolation, Runtime};
pub use scheduler::{Lane, Scheduler, UnitOfWork};
pub use strand::{Properties, Strand, StrandId, StrandMetadata};
pub use value::{MethodType, ObjectId, ObjectRef, ObjectType, Param, RuntimeObject, TypeTag, Value};
