//! # Tick Clock
//!
//! A 32-bit tick counter and a list of one-shot task timeouts. The kernel
//! advances it once per system tick; every timeout whose deadline equals
//! the new tick count fires, in the order the timeouts were registered.
//! Deadlines are absolute and wrap with the counter.

use alloc::vec::Vec;

use crate::task::TaskId;

/// Handle for a registered timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u32);

#[derive(Debug, Clone, Copy)]
struct Timeout {
    id: TimerId,
    deadline: u32,
    task: TaskId,
}

pub struct Clock {
    ticks: u32,
    next_id: u32,
    pending: Vec<Timeout>,
}

impl Clock {
    pub const fn new() -> Self {
        Self {
            ticks: 0,
            next_id: 0,
            pending: Vec::new(),
        }
    }

    /// Current tick count.
    #[inline]
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Wake `task` after `timeout` ticks. `timeout` must be non-zero.
    pub fn register(&mut self, task: TaskId, timeout: u32) -> TimerId {
        debug_assert!(timeout != 0);
        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.pending.push(Timeout {
            id,
            deadline: self.ticks.wrapping_add(timeout),
            task,
        });
        id
    }

    /// Drop a timeout that has not fired. Returns whether it was pending.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.pending.iter().position(|t| t.id == id) {
            Some(at) => {
                self.pending.remove(at);
                true
            }
            None => false,
        }
    }

    /// Advance one tick and hand each expired task to `expire`.
    pub fn advance<F: FnMut(TaskId, TimerId)>(&mut self, mut expire: F) {
        self.ticks = self.ticks.wrapping_add(1);
        let now = self.ticks;
        self.pending.retain(|t| {
            if t.deadline == now {
                expire(t.task, t.id);
                false
            } else {
                true
            }
        });
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
