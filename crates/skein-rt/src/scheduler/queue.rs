// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Global run queue.
//!
//! Holds free-lane jobs and object groups whose drain token was taken.
//! All workers pop from the front. Closing the queue refuses further
//! pushes and hands back whatever was left.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::Job;
use crate::group::ObjectGroup;

/// One entry on the run queue.
pub(crate) enum Runnable {
    /// Free-lane job: any worker, no ordering.
    Free(Job),
    /// A group to drain one job from. Only ever queued once at a time.
    Group(Arc<ObjectGroup>),
}

struct QueueState {
    items: VecDeque<Runnable>,
    closed: bool,
}

pub(crate) struct RunQueue {
    state: Mutex<QueueState>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Push to the back. Gives the item back if the queue is closed.
    pub fn push(&self, item: Runnable) -> Result<(), Runnable> {
        let mut q = self.state.lock().unwrap();
        if q.closed {
            return Err(item);
        }
        q.items.push_back(item);
        Ok(())
    }

    pub fn pop(&self) -> Option<Runnable> {
        self.state.lock().unwrap().items.pop_front()
    }

    /// Refuse further pushes and return the leftovers.
    pub fn close(&self) -> Vec<Runnable> {
        let mut q = self.state.lock().unwrap();
        q.closed = true;
        q.items.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}
