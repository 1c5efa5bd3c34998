// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker threads.
//!
//! Each worker pops from the shared run queue. A free job runs directly.
//! A group entry means this worker holds that group's drain token: it runs
//! the group's next job, then re-enqueues the group if more are waiting.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::queue::Runnable;
use super::{Job, SharedState};
use crate::error::DomainError;
use crate::group::ObjectGroup;

thread_local! {
    /// Address of the `SharedState` this thread works for, 0 elsewhere.
    static WORKER_OF: Cell<usize> = const { Cell::new(0) };
}

/// True when called on one of `shared`'s own worker threads.
pub(super) fn is_worker_of(shared: &SharedState) -> bool {
    WORKER_OF.with(|w| w.get() == shared as *const SharedState as usize)
}

/// Worker main loop.
pub(super) fn worker_loop(id: usize, shared: &SharedState) {
    WORKER_OF.with(|w| w.set(shared as *const SharedState as usize));
    tracing::trace!(worker = id, "worker started");
    loop {
        if let Some(item) = shared.run_queue.pop() {
            run(item, shared);
            continue;
        }

        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        // Park until new work arrives (avoids busy-spinning).
        let (lock, cvar) = &shared.work_available;
        let mut ready = lock.lock().unwrap();
        // Re-check: work may have arrived between the pop and locking.
        if !shared.run_queue.is_empty() {
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if !*ready {
            let result = cvar.wait_timeout(ready, shared.config.idle_park).unwrap();
            ready = result.0;
        }
        *ready = false;
    }
    tracing::trace!(worker = id, "worker stopped");
}

fn run(item: Runnable, shared: &SharedState) {
    match item {
        Runnable::Free(job) => run_job(job),
        Runnable::Group(group) => run_group_turn(group, shared),
    }
}

fn run_group_turn(group: Arc<ObjectGroup>, shared: &SharedState) {
    if let Some(job) = group.next_job() {
        tracing::trace!(object = %group.object(), "group turn");
        run_job(job);
        if group.finish_turn() {
            shared.enqueue_group(group);
        }
    }
}

/// Execute one unit of work and complete its future.
///
/// Domain errors pass through untouched; a panic is wrapped as a runtime
/// error. The job's activity guard is released after the callback ran.
pub(super) fn run_job(job: Job) {
    let Job {
        unit,
        future,
        lane,
        activity,
    } = job;

    tracing::trace!(
        future = %future.id(),
        strand = %future.strand().display_name(),
        %lane,
        "running"
    );

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| unit(future.strand()))) {
        Ok(result) => result,
        Err(payload) => Err(DomainError::from_panic(payload)),
    };

    if let Err(e) = future.complete(outcome) {
        tracing::error!(error = %e, "unit of work finished on a completed future");
    }
    drop(activity);
}
