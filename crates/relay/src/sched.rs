use std::collections::{BTreeMap, HashMap, VecDeque};

use bitflags::bitflags;
use relay_timing::Ticks;
use relay_utils::SlotId;

bitflags! {
    /// Why a task is being run. Accumulated between dispatches.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct WakeReasons: u8 {
        const INIT  = 1 << 0;
        const TIMER = 1 << 1;
        const IO    = 1 << 2;
        const OTHER = 1 << 3;
    }
}

/// Cooperative single-threaded scheduler: a runqueue of tasks to run
/// now plus an expiry wheel of tasks waiting on deadlines. Tasks are
/// session slots; all state they touch is their own.
#[derive(Debug, Default)]
pub struct Scheduler {
    runq: VecDeque<SlotId>,
    reasons: HashMap<SlotId, WakeReasons>,
    wheel: BTreeMap<(Ticks, SlotId), ()>,
    expires: HashMap<SlotId, Ticks>,
}

impl Scheduler {
    /// Queues `task` to run now. Reasons accumulate; a task already
    /// queued is not queued twice.
    pub fn wakeup(&mut self, task: SlotId, why: WakeReasons) {
        let entry = self.reasons.entry(task).or_default();
        let was_queued = !entry.is_empty();
        entry.insert(why);
        if !was_queued {
            self.runq.push_back(task);
        }
    }

    /// (Re)arms the task's deadline. `ETERNITY` parks it untimed.
    pub fn schedule(&mut self, task: SlotId, expire: Ticks) {
        if let Some(old) = self.expires.remove(&task) {
            self.wheel.remove(&(old, task));
        }
        if expire.is_set() {
            self.wheel.insert((expire, task), ());
            self.expires.insert(task, expire);
        }
    }

    /// Forgets the task entirely (teardown).
    pub fn cancel(&mut self, task: SlotId) {
        if let Some(old) = self.expires.remove(&task) {
            self.wheel.remove(&(old, task));
        }
        if self.reasons.remove(&task).is_some() {
            self.runq.retain(|t| *t != task);
        }
    }

    /// Earliest armed deadline, for the poll timeout.
    pub fn next_deadline(&self) -> Ticks {
        self.wheel.keys().next().map_or(Ticks::ETERNITY, |(t, _)| *t)
    }

    /// Moves every task whose deadline has passed onto the runqueue.
    pub fn expire(&mut self, now: Ticks) {
        loop {
            let Some(&(t, task)) = self.wheel.keys().next() else { break };
            if !t.expired(now) {
                break;
            }
            self.wheel.remove(&(t, task));
            self.expires.remove(&task);
            self.wakeup(task, WakeReasons::TIMER);
        }
    }

    /// Next task to dispatch, with its accumulated wake reasons.
    pub fn pop(&mut self) -> Option<(SlotId, WakeReasons)> {
        let task = self.runq.pop_front()?;
        let why = self.reasons.remove(&task).unwrap_or_default();
        Some((task, why))
    }

    pub fn has_runnable(&self) -> bool {
        !self.runq.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakeups_accumulate_reasons() {
        let mut s = Scheduler::default();
        s.wakeup(SlotId(1), WakeReasons::IO);
        s.wakeup(SlotId(1), WakeReasons::TIMER);
        let (task, why) = s.pop().unwrap();
        assert_eq!(task, SlotId(1));
        assert_eq!(why, WakeReasons::IO | WakeReasons::TIMER);
        assert!(s.pop().is_none(), "queued once despite two wakeups");
    }

    #[test]
    fn expiry_order_is_deadline_order() {
        let mut s = Scheduler::default();
        s.schedule(SlotId(1), Ticks(300));
        s.schedule(SlotId(2), Ticks(100));
        s.schedule(SlotId(3), Ticks(200));
        assert_eq!(s.next_deadline(), Ticks(100));
        s.expire(Ticks(250));
        let order: Vec<SlotId> = std::iter::from_fn(|| s.pop().map(|(t, _)| t)).collect();
        assert_eq!(order, vec![SlotId(2), SlotId(3)]);
        assert_eq!(s.next_deadline(), Ticks(300));
    }

    #[test]
    fn reschedule_replaces_deadline() {
        let mut s = Scheduler::default();
        s.schedule(SlotId(1), Ticks(100));
        s.schedule(SlotId(1), Ticks(500));
        s.expire(Ticks(200));
        assert!(s.pop().is_none());
        assert_eq!(s.next_deadline(), Ticks(500));
    }

    #[test]
    fn eternity_parks_untimed() {
        let mut s = Scheduler::default();
        s.schedule(SlotId(1), Ticks::ETERNITY);
        assert_eq!(s.next_deadline(), Ticks::ETERNITY);
        s.expire(Ticks(u64::MAX - 1));
        assert!(s.pop().is_none());
    }

    #[test]
    fn cancel_removes_everywhere() {
        let mut s = Scheduler::default();
        s.schedule(SlotId(1), Ticks(10));
        s.wakeup(SlotId(1), WakeReasons::IO);
        s.cancel(SlotId(1));
        s.expire(Ticks(100));
        assert!(s.pop().is_none());
    }
}
