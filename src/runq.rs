//! # Sorted Run-Queue
//!
//! One entry per core holding the priority of that core's current task
//! (`-1` while the core has nothing to run), kept in ascending priority
//! order. The head is always the lowest-priority core, the first one a
//! don't-care task should preempt.

use alloc::vec::Vec;

use crate::task::CoreId;

/// A core and the priority it is currently running at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunQEntry {
    pub core: CoreId,
    pub priority: i32,
}

pub(crate) struct SortedRunQueue {
    entries: Vec<RunQEntry>,
}

impl SortedRunQueue {
    /// Every core idle, in core order.
    pub(crate) fn new(num_cores: usize) -> Self {
        Self {
            entries: (0..num_cores)
                .map(|core| RunQEntry { core, priority: -1 })
                .collect(),
        }
    }

    /// Lowest-priority core.
    #[inline]
    pub(crate) fn head(&self) -> RunQEntry {
        self.entries[0]
    }

    #[inline]
    pub(crate) fn get(&self, position: usize) -> Option<RunQEntry> {
        self.entries.get(position).copied()
    }

    pub(crate) fn priority_of(&self, core: CoreId) -> i32 {
        self.entries
            .iter()
            .find(|entry| entry.core == core)
            .map_or(-1, |entry| entry.priority)
    }

    /// Move `core` to `priority`. It lands after every entry of equal
    /// priority and before the first strictly higher one.
    pub(crate) fn reorder(&mut self, core: CoreId, priority: i32) {
        let Some(from) = self.entries.iter().position(|entry| entry.core == core) else {
            return;
        };
        self.entries.remove(from);
        let at = self
            .entries
            .iter()
            .position(|entry| entry.priority > priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, RunQEntry { core, priority });
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[RunQEntry] {
        &self.entries
    }

    pub(crate) fn table_addr(&self) -> usize {
        self.entries.as_ptr() as usize
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
