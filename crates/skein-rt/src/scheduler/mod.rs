// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand scheduler.
//!
//! A fixed pool of worker threads pulls from one run queue. Work lands
//! there two ways:
//! - `schedule`: free lane. Any worker, no ordering. Only for calls known
//!   to be isolated.
//! - `schedule_to_object_group`: the receiver's group lane. Jobs for one
//!   receiver run one at a time in submission order.
//!
//! Scheduling never blocks; results come back through the future's
//! callback on the worker that ran the job.

mod queue;
mod worker;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::config::SchedulerConfig;
use crate::error::{DomainError, ScheduleError};
use crate::future::{Callback, FutureHandle, FutureId, FutureValue};
use crate::group::{GroupTable, ObjectGroup};
use crate::registry::RuntimeRegistry;
use crate::strand::{Properties, Strand, StrandId, StrandMetadata};
use crate::value::{ObjectRef, TypeTag, Value};

use queue::{RunQueue, Runnable};

/// A runnable unit: receives the strand it runs on.
pub type UnitOfWork = Box<dyn FnOnce(&Strand) -> Result<Value, DomainError> + Send>;

/// Which lane a job was placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Free,
    Group,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Free => write!(f, "free"),
            Lane::Group => write!(f, "group"),
        }
    }
}

/// Count of in-flight work. Shutdown waits for it to reach zero.
pub(crate) struct Activity {
    count: AtomicUsize,
    idle: (Mutex<()>, Condvar),
}

impl Activity {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            idle: (Mutex::new(()), Condvar::new()),
        }
    }

    fn wait_idle(&self) {
        let (lock, cvar) = &self.idle;
        let mut guard = lock.lock().unwrap();
        while self.count.load(Ordering::Acquire) > 0 {
            guard = cvar.wait(guard).unwrap();
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// Keeps the scheduler from shutting down while held.
pub(crate) struct ActivityGuard {
    activity: Arc<Activity>,
}

impl ActivityGuard {
    pub(crate) fn new(activity: &Arc<Activity>) -> Self {
        activity.count.fetch_add(1, Ordering::AcqRel);
        Self {
            activity: activity.clone(),
        }
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let prev = self.activity.count.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            let (lock, cvar) = &self.activity.idle;
            let _guard = lock.lock().unwrap();
            cvar.notify_all();
        }
    }
}

/// A unit of work bound to its future.
pub(crate) struct Job {
    pub unit: UnitOfWork,
    pub future: FutureHandle,
    pub lane: Lane,
    pub activity: ActivityGuard,
}

/// State shared between workers and schedulers.
pub(crate) struct SharedState {
    pub run_queue: RunQueue,
    pub groups: GroupTable,
    pub activity: Arc<Activity>,
    /// Shutdown flag for workers.
    pub shutdown: AtomicBool,
    /// Notify idle workers that new work is available.
    pub work_available: (Mutex<bool>, Condvar),
    pub config: SchedulerConfig,
}

impl SharedState {
    fn wake_one(&self) {
        let (lock, cvar) = &self.work_available;
        let mut ready = lock.lock().unwrap();
        *ready = true;
        cvar.notify_one();
    }

    fn wake_all(&self) {
        let (lock, cvar) = &self.work_available;
        let mut ready = lock.lock().unwrap();
        *ready = true;
        cvar.notify_all();
    }

    /// Put a group holding its drain token on the run queue. If the queue
    /// is closed, every job waiting in the group is failed instead.
    pub(crate) fn enqueue_group(&self, group: Arc<ObjectGroup>) -> bool {
        match self.run_queue.push(Runnable::Group(group)) {
            Ok(()) => {
                self.wake_one();
                true
            }
            Err(refused) => {
                refuse(refused);
                false
            }
        }
    }
}

fn refuse(item: Runnable) {
    match item {
        Runnable::Free(job) => refuse_all(vec![job]),
        Runnable::Group(group) => refuse_all(group.drain()),
    }
}

/// Fail jobs the scheduler can no longer run.
fn refuse_all(jobs: Vec<Job>) {
    for job in jobs {
        let err = DomainError::runtime(ScheduleError::ShutDown.to_string());
        if let Err(e) = job.future.fail(err) {
            tracing::error!(error = %e, "refused job had a completed future");
        }
    }
}

/// Scheduler runtime.
///
/// Owns the worker threads, the run queue, the object group table and the
/// runtime registry. Shuts down on `shutdown()` or drop.
pub struct Scheduler {
    /// Worker handles for join-on-shutdown.
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shared: Arc<SharedState>,
    registry: Arc<RuntimeRegistry>,
    next_id: AtomicU64,
}

impl Scheduler {
    /// Start the scheduler with the given configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        let pool_size = config.pool_size.max(1);
        let shared = Arc::new(SharedState {
            run_queue: RunQueue::new(),
            groups: GroupTable::new(),
            activity: Arc::new(Activity::new()),
            shutdown: AtomicBool::new(false),
            work_available: (Mutex::new(false), Condvar::new()),
            config,
        });

        let mut workers = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let shared = shared.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("{}-{}", shared.config.thread_name_prefix, id))
                    .spawn(move || worker::worker_loop(id, &shared))
                    .expect("failed to spawn worker thread"),
            );
        }
        tracing::debug!(pool_size, "scheduler started");

        Self {
            workers: Mutex::new(workers),
            shared,
            registry: Arc::new(RuntimeRegistry::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start with `n` workers and otherwise default settings.
    pub fn with_pool_size(n: usize) -> Self {
        Self::new(SchedulerConfig::default().with_pool_size(n))
    }

    pub fn pool_size(&self) -> usize {
        self.shared.config.pool_size.max(1)
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    /// Allocate a future bound to a fresh strand. Never fails.
    ///
    /// `parent` is the strand this call is made from, if any.
    pub fn create_future(
        &self,
        parent: Option<&Strand>,
        callback: Box<dyn Callback>,
        properties: Option<Properties>,
        return_type: TypeTag,
        strand_name: Option<String>,
        metadata: StrandMetadata,
    ) -> FutureHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let strand = Strand::new(
            StrandId(id),
            strand_name,
            metadata,
            properties.unwrap_or_default(),
            parent.map(Strand::id),
        );
        FutureValue::new(FutureId(id), strand, callback, return_type)
    }

    /// Free lane: any idle worker may run `unit`.
    ///
    /// On `Err(ShutDown)` the future has already been failed. On
    /// `Err(AlreadyScheduled)` the future is left to its first placement.
    pub fn schedule(&self, unit: UnitOfWork, future: &FutureHandle) -> Result<(), ScheduleError> {
        let job = self.job(unit, future, Lane::Free)?;
        tracing::debug!(
            future = %future.id(),
            strand = %future.strand().display_name(),
            lane = "free",
            "scheduled"
        );
        match self.shared.run_queue.push(Runnable::Free(job)) {
            Ok(()) => {
                self.shared.wake_one();
                Ok(())
            }
            Err(refused) => {
                refuse(refused);
                Err(ScheduleError::ShutDown)
            }
        }
    }

    /// Group lane: `unit` runs after every job previously submitted for
    /// `receiver`, never overlapping them.
    ///
    /// Error contract as for `schedule`.
    pub fn schedule_to_object_group(
        &self,
        receiver: &ObjectRef,
        unit: UnitOfWork,
        future: &FutureHandle,
    ) -> Result<(), ScheduleError> {
        let job = self.job(unit, future, Lane::Group)?;
        tracing::debug!(
            future = %future.id(),
            strand = %future.strand().display_name(),
            object = %receiver.id(),
            lane = "group",
            "scheduled"
        );
        if self.shared.run_queue.is_closed() {
            refuse_all(vec![job]);
            return Err(ScheduleError::ShutDown);
        }
        let group = self.shared.groups.group_for(receiver);
        if group.push(job) && !self.shared.enqueue_group(group) {
            return Err(ScheduleError::ShutDown);
        }
        Ok(())
    }

    fn job(
        &self,
        unit: UnitOfWork,
        future: &FutureHandle,
        lane: Lane,
    ) -> Result<Job, ScheduleError> {
        if !future.claim() {
            return Err(ScheduleError::AlreadyScheduled { future: future.id() });
        }
        Ok(Job {
            unit,
            future: future.clone(),
            lane,
            activity: ActivityGuard::new(&self.shared.activity),
        })
    }

    /// Hold the scheduler open across work that is not yet a job, such as
    /// argument resolution.
    pub(crate) fn track(&self) -> ActivityGuard {
        ActivityGuard::new(&self.shared.activity)
    }

    /// Jobs scheduled or tracked but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.activity.in_flight()
    }

    /// Number of live object groups.
    pub fn group_count(&self) -> usize {
        self.shared.groups.len()
    }

    /// Reclaim groups of dropped receivers now rather than on growth.
    pub fn sweep_groups(&self) -> usize {
        self.shared.groups.sweep()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Wait for in-flight work, then stop and join the workers.
    ///
    /// Called from one of this scheduler's own workers (for instance when
    /// a callback drops the last handle) it cannot wait on itself: queued
    /// work is refused instead.
    pub fn shutdown(&self) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        if worker::is_worker_of(&self.shared) {
            tracing::warn!("scheduler shut down from its own worker; refusing queued work");
        } else {
            self.shared.activity.wait_idle();
        }

        // Anything that slipped in after the wait is refused.
        for item in self.shared.run_queue.close() {
            refuse(item);
        }

        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_all();

        let current = thread::current().id();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        tracing::debug!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.shared.shutdown.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pool_size", &self.pool_size())
            .field("in_flight", &self.in_flight())
            .field("queued", &self.shared.run_queue.len())
            .field("groups", &self.group_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
