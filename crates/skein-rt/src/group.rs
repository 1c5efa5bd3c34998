// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Object groups: per-receiver serial lanes.
//!
//! Every non-isolated call against one receiver goes through that
//! receiver's group. A group holds a FIFO of jobs and a `scheduled` flag.
//! The flag is the drain token: whoever flips it false->true must put the
//! group on the run queue, and only the worker holding the token pops
//! jobs. So at most one job per group runs at any instant, in submission
//! order, on whatever worker happens to pick the group up.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use crate::scheduler::Job;
use crate::value::{ObjectCell, ObjectId, ObjectRef};

/// Table size that triggers the first sweep of dead receivers.
const INITIAL_HIGH_WATER: usize = 64;

struct Lane {
    jobs: VecDeque<Job>,
    scheduled: bool,
}

pub(crate) struct ObjectGroup {
    object: ObjectId,
    lane: Mutex<Lane>,
}

impl ObjectGroup {
    fn new(object: ObjectId) -> Self {
        Self {
            object,
            lane: Mutex::new(Lane {
                jobs: VecDeque::new(),
                scheduled: false,
            }),
        }
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Append a job. Returns true when the caller took the drain token and
    /// must enqueue the group.
    pub fn push(&self, job: Job) -> bool {
        let mut lane = self.lane.lock().unwrap();
        lane.jobs.push_back(job);
        if lane.scheduled {
            false
        } else {
            lane.scheduled = true;
            true
        }
    }

    /// Next job for the token holder. Releases the token if the lane is empty.
    pub fn next_job(&self) -> Option<Job> {
        let mut lane = self.lane.lock().unwrap();
        let job = lane.jobs.pop_front();
        if job.is_none() {
            lane.scheduled = false;
        }
        job
    }

    /// End of a turn. Returns true if more jobs are waiting and the holder
    /// must re-enqueue the group; otherwise the token is released.
    pub fn finish_turn(&self) -> bool {
        let mut lane = self.lane.lock().unwrap();
        if lane.jobs.is_empty() {
            lane.scheduled = false;
            false
        } else {
            true
        }
    }

    /// Take every pending job and release the token. Used on shutdown.
    pub fn drain(&self) -> Vec<Job> {
        let mut lane = self.lane.lock().unwrap();
        lane.scheduled = false;
        lane.jobs.drain(..).collect()
    }

    pub fn is_idle(&self) -> bool {
        let lane = self.lane.lock().unwrap();
        !lane.scheduled && lane.jobs.is_empty()
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.lane.lock().unwrap().jobs.len()
    }
}

struct GroupEntry {
    /// Tracks the receiver's lifetime without keeping it alive.
    owner: Weak<ObjectCell>,
    group: Arc<ObjectGroup>,
}

struct Table {
    groups: HashMap<ObjectId, GroupEntry>,
    high_water: usize,
}

/// Map from receiver token to its group, created lazily.
///
/// Entries are reclaimed by sweeping: once the table outgrows its
/// high-water mark, entries whose receiver has been dropped and whose lane
/// is idle are removed.
pub(crate) struct GroupTable {
    table: Mutex<Table>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                groups: HashMap::new(),
                high_water: INITIAL_HIGH_WATER,
            }),
        }
    }

    pub fn group_for(&self, receiver: &ObjectRef) -> Arc<ObjectGroup> {
        let mut table = self.table.lock().unwrap();
        if let Some(entry) = table.groups.get(&receiver.id()) {
            return entry.group.clone();
        }

        if table.groups.len() >= table.high_water {
            sweep(&mut table);
        }

        let group = Arc::new(ObjectGroup::new(receiver.id()));
        table.groups.insert(
            receiver.id(),
            GroupEntry {
                owner: Arc::downgrade(&receiver.cell),
                group: group.clone(),
            },
        );
        tracing::trace!(object = %receiver.id(), "object group created");
        group
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().groups.len()
    }

    /// Drop entries for receivers that no longer exist. Returns how many
    /// entries were removed.
    pub fn sweep(&self) -> usize {
        sweep(&mut self.table.lock().unwrap())
    }
}

fn sweep(table: &mut Table) -> usize {
    let before = table.groups.len();
    table
        .groups
        .retain(|_, entry| entry.owner.strong_count() > 0 || !entry.group.is_idle());
    let removed = before - table.groups.len();
    table.high_water = (table.groups.len() * 2).max(INITIAL_HIGH_WATER);
    if removed > 0 {
        tracing::debug!(removed, live = table.groups.len(), "swept object groups");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;
    use crate::scheduler::testing::job;
    use crate::strand::Strand;
    use crate::value::{ObjectType, RuntimeObject, Value};

    struct Plain(ObjectType);

    impl RuntimeObject for Plain {
        fn object_type(&self) -> &ObjectType {
            &self.0
        }

        fn call(&self, _: &Strand, _: &str, _: &[Value]) -> Result<Value, DomainError> {
            Ok(Value::Nil)
        }
    }

    fn receiver() -> ObjectRef {
        ObjectRef::new(Plain(ObjectType::new("Plain")))
    }

    #[test]
    fn first_push_takes_the_token() {
        let group = ObjectGroup::new(receiver().id());
        assert!(group.push(job()));
        assert!(!group.push(job()));
        assert_eq!(group.pending(), 2);
    }

    #[test]
    fn token_released_when_lane_empties() {
        let group = ObjectGroup::new(receiver().id());
        assert!(group.push(job()));
        assert!(group.next_job().is_some());
        assert!(!group.finish_turn());
        assert!(group.is_idle());
        // Next push must schedule the group again.
        assert!(group.push(job()));
    }

    #[test]
    fn token_kept_while_jobs_remain() {
        let group = ObjectGroup::new(receiver().id());
        group.push(job());
        group.push(job());
        assert!(group.next_job().is_some());
        assert!(group.finish_turn());
        assert!(!group.is_idle());
    }

    #[test]
    fn drain_takes_everything() {
        let group = ObjectGroup::new(receiver().id());
        group.push(job());
        group.push(job());
        assert_eq!(group.drain().len(), 2);
        assert!(group.is_idle());
    }

    #[test]
    fn same_receiver_same_group() {
        let table = GroupTable::new();
        let r = receiver();
        let a = table.group_for(&r);
        let b = table.group_for(&r.clone());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &table.group_for(&receiver())));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn sweep_reclaims_dropped_receivers() {
        let table = GroupTable::new();
        let kept = receiver();
        table.group_for(&kept);
        {
            let dropped = receiver();
            table.group_for(&dropped);
        }
        assert_eq!(table.len(), 2);
        assert_eq!(table.sweep(), 1);
        assert_eq!(table.len(), 1);
        table.group_for(&kept);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn sweep_keeps_busy_lanes_of_dropped_receivers() {
        let table = GroupTable::new();
        let group = {
            let dropped = receiver();
            table.group_for(&dropped)
        };
        group.push(job());
        assert_eq!(table.sweep(), 0);
        group.drain();
        assert_eq!(table.sweep(), 1);
    }
}
