//! # Ready-Queue Store
//!
//! One FIFO per (affinity class, priority), plus a priority bitmask per class
//! (`cur_set`) whose bit `p` is set exactly when queue `[class][p]` holds a
//! task. Class `num_cores` is the don't-care class shared by every core.
//!
//! ```text
//!            prio 0   prio 1   prio 2  ...        cur_set
//!  core 0  [ idle ] [      ] [ A  B ]            0b0000_0101
//!  core 1  [ idle ] [ C    ] [      ]            0b0000_0011
//!  any     [      ] [      ] [      ] [ D ]      0b0000_1000
//! ```
//!
//! Queues are intrusive: each task carries one [`Link`] (kept in the task
//! table), so a task is on at most one queue and every operation is O(1).
//! Two extra lists share the same links: the inactive list (priority `-1`)
//! and the terminated list awaiting reclamation.

use alloc::vec;
use alloc::vec::Vec;

/// Which list a task is (or will be) linked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueRef {
    Ready { class: usize, priority: usize },
    Inactive,
    Terminated,
}

impl QueueRef {
    /// Home queue for a task with this affinity class and priority.
    pub(crate) fn home(class: usize, priority: i32) -> Self {
        if priority < 0 {
            QueueRef::Inactive
        } else {
            QueueRef::Ready {
                class,
                priority: priority as usize,
            }
        }
    }
}

/// Queue linkage stored per task slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Link {
    prev: Option<u16>,
    next: Option<u16>,
    on: Option<QueueRef>,
}

impl Link {
    /// The list this task is currently linked on.
    #[inline]
    pub(crate) fn queue(&self) -> Option<QueueRef> {
        self.on
    }
}

/// Storage that owns the links for a set of slots.
pub(crate) trait Linked {
    fn link(&self, index: u16) -> &Link;
    fn link_mut(&mut self, index: u16) -> &mut Link;
}

/// Top set bit plus one; `0` for an empty mask.
#[inline]
pub(crate) const fn top_bit(mask: u32) -> u32 {
    32 - mask.leading_zeros()
}

// ---------------------------------------------------------------------------
// Intrusive FIFO
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TaskQueue {
    head: Option<u16>,
    tail: Option<u16>,
    len: usize,
}

impl TaskQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn push_back<L: Linked>(&mut self, tag: QueueRef, links: &mut L, index: u16) {
        debug_assert!(links.link(index).on.is_none(), "slot already queued");
        *links.link_mut(index) = Link {
            prev: self.tail,
            next: None,
            on: Some(tag),
        };
        match self.tail {
            Some(tail) => links.link_mut(tail).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    pub(crate) fn push_front<L: Linked>(&mut self, tag: QueueRef, links: &mut L, index: u16) {
        debug_assert!(links.link(index).on.is_none(), "slot already queued");
        *links.link_mut(index) = Link {
            prev: None,
            next: self.head,
            on: Some(tag),
        };
        match self.head {
            Some(head) => links.link_mut(head).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
        self.len += 1;
    }

    pub(crate) fn pop_front<L: Linked>(&mut self, links: &mut L) -> Option<u16> {
        let head = self.head?;
        self.unlink(links, head);
        Some(head)
    }

    /// Unlink `index`, which must be on this queue.
    pub(crate) fn unlink<L: Linked>(&mut self, links: &mut L, index: u16) {
        let link = *links.link(index);
        match link.prev {
            Some(prev) => links.link_mut(prev).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => links.link_mut(next).prev = link.prev,
            None => self.tail = link.prev,
        }
        *links.link_mut(index) = Link::default();
        self.len -= 1;
    }

    #[inline]
    pub(crate) fn head(&self) -> Option<u16> {
        self.head
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn iter<'a, L: Linked>(&self, links: &'a L) -> QueueIter<'a, L> {
        QueueIter {
            links,
            cursor: self.head,
        }
    }
}

pub(crate) struct QueueIter<'a, L> {
    links: &'a L,
    cursor: Option<u16>,
}

impl<L: Linked> Iterator for QueueIter<'_, L> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        let index = self.cursor?;
        self.cursor = self.links.link(index).next;
        Some(index)
    }
}

// ---------------------------------------------------------------------------
// Ready-queue store
// ---------------------------------------------------------------------------

pub(crate) struct ReadyQueues {
    num_priorities: usize,
    queues: Vec<TaskQueue>,
    cur_set: Vec<u32>,
    inactive: TaskQueue,
    terminated: TaskQueue,
}

impl ReadyQueues {
    /// `num_classes` is `num_cores + 1`.
    pub(crate) fn new(num_classes: usize, num_priorities: usize) -> Self {
        Self {
            num_priorities,
            queues: vec![TaskQueue::new(); num_classes * num_priorities],
            cur_set: vec![0; num_classes],
            inactive: TaskQueue::new(),
            terminated: TaskQueue::new(),
        }
    }

    pub(crate) fn queue(&self, queue: QueueRef) -> &TaskQueue {
        match queue {
            QueueRef::Ready { class, priority } => {
                &self.queues[class * self.num_priorities + priority]
            }
            QueueRef::Inactive => &self.inactive,
            QueueRef::Terminated => &self.terminated,
        }
    }

    fn queue_mut(&mut self, queue: QueueRef) -> &mut TaskQueue {
        match queue {
            QueueRef::Ready { class, priority } => {
                &mut self.queues[class * self.num_priorities + priority]
            }
            QueueRef::Inactive => &mut self.inactive,
            QueueRef::Terminated => &mut self.terminated,
        }
    }

    /// Append at the tail and publish the priority bit.
    pub(crate) fn push_back<L: Linked>(&mut self, links: &mut L, queue: QueueRef, index: u16) {
        self.queue_mut(queue).push_back(queue, links, index);
        self.publish(queue);
    }

    /// Insert at the head; used to put a preempted task back in front.
    pub(crate) fn push_front<L: Linked>(&mut self, links: &mut L, queue: QueueRef, index: u16) {
        self.queue_mut(queue).push_front(queue, links, index);
        self.publish(queue);
    }

    pub(crate) fn pop_front<L: Linked>(&mut self, links: &mut L, queue: QueueRef) -> Option<u16> {
        let index = self.queue_mut(queue).pop_front(links)?;
        self.retract(queue);
        Some(index)
    }

    /// Unlink `index` from whatever list holds it. No-op if it is on none.
    pub(crate) fn remove<L: Linked>(&mut self, links: &mut L, index: u16) -> bool {
        let Some(queue) = links.link(index).queue() else {
            return false;
        };
        self.queue_mut(queue).unlink(links, index);
        self.retract(queue);
        true
    }

    fn publish(&mut self, queue: QueueRef) {
        if let QueueRef::Ready { class, priority } = queue {
            self.cur_set[class] |= 1 << priority;
        }
    }

    fn retract(&mut self, queue: QueueRef) {
        if let QueueRef::Ready { class, priority } = queue {
            if self.queue(queue).is_empty() {
                self.cur_set[class] &= !(1 << priority);
            }
        }
    }

    #[inline]
    pub(crate) fn cur_set(&self, class: usize) -> u32 {
        self.cur_set[class]
    }

    /// Highest non-empty priority in `class` plus one; `0` when empty.
    #[inline]
    pub(crate) fn top(&self, class: usize) -> u32 {
        top_bit(self.cur_set[class])
    }

    /// Addresses of the fixed tables, for the state checksum.
    pub(crate) fn table_addrs(&self) -> [usize; 2] {
        [self.queues.as_ptr() as usize, self.cur_set.as_ptr() as usize]
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
