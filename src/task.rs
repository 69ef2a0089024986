//! # Task Objects
//!
//! The task model for the SMP scheduler: handles, affinity, creation
//! parameters, stacks, and the arena that owns every task object.
//!
//! Tasks never move once created. They live in a [`TaskTable`] whose slot
//! vector is sized from the configuration up front, and they are named from
//! outside by a generation-checked [`TaskId`]. Queue membership is stored
//! next to the slots as index links (see [`crate::queue`]), so enqueueing
//! and removal never allocate.

use alloc::vec::Vec;
use core::fmt;

use crate::clock::TimerId;
use crate::config::STACK_FILL;
use crate::error::KernelError;
use crate::port::Context;
use crate::queue::{Link, Linked, QueueRef};

/// Index of a core, `0..num_cores`.
pub type CoreId = usize;

/// Task entry point. Receives `arg0` and `arg1` from [`TaskParams`].
pub type TaskFn = fn(usize, usize);

/// Number of low stack bytes that must still hold [`STACK_FILL`].
const CANARY_LEN: usize = 4;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Handle to a task in one scheduler instance.
///
/// The generation changes every time a slot is reused, so a handle to a
/// deleted task never aliases its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    index: u16,
    generation: u16,
}

impl TaskId {
    pub(crate) const fn new(index: u16, generation: u16) -> Self {
        Self { index, generation }
    }

    /// Arena slot of this task.
    #[inline]
    pub const fn index(&self) -> usize {
        self.index as usize
    }

    #[inline]
    pub(crate) const fn slot(&self) -> u16 {
        self.index
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}.{}", self.index, self.generation)
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Observable mode of a task.
///
/// ```text
///   ┌──────────┐  setPri(>= 0)  ┌─────────┐  schedule  ┌─────────┐
///   │ Inactive ├───────────────►│  Ready  ├───────────►│ Running │
///   └──────────┘                └─────────┘◄───────────┴─┬──┬────┘
///                                    ▲      preempt/yield  │  │
///                                    │ unblock             │  │ exit
///                               ┌────┴────┐  block/sleep   │  ▼
///                               │ Blocked │◄───────────────┘ Terminated
///                               └─────────┘
/// ```
///
/// A task with priority `-1` is reported as `Inactive` whatever queue it
/// sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// Priority `-1`: parked on the inactive list, never scheduled.
    Inactive,
    /// Waiting on a ready queue.
    Ready,
    /// Current task of some core.
    Running,
    /// Waiting on a timeout or an external event.
    Blocked,
    /// Exited; waiting to be deleted.
    Terminated,
}

/// Where a task may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affinity {
    /// Only on this core.
    Core(CoreId),
    /// On whichever core has the lowest-priority work ("don't care").
    #[default]
    Any,
}

impl Affinity {
    /// Ready-queue class: the core id, or `num_cores` for `Any`.
    #[inline]
    pub(crate) fn class(self, num_cores: usize) -> usize {
        match self {
            Affinity::Core(core) => core,
            Affinity::Any => num_cores,
        }
    }

    #[inline]
    pub(crate) fn from_class(class: usize, num_cores: usize) -> Self {
        if class >= num_cores {
            Affinity::Any
        } else {
            Affinity::Core(class)
        }
    }

    /// Whether this names a core that exists.
    #[inline]
    pub fn is_valid(self, num_cores: usize) -> bool {
        match self {
            Affinity::Core(core) => core < num_cores,
            Affinity::Any => true,
        }
    }
}

/// Bit for `priority` in a priority mask, `0` for inactive.
#[inline]
pub(crate) const fn priority_mask(priority: i32) -> u32 {
    if priority < 0 {
        0
    } else {
        1 << priority
    }
}

// ---------------------------------------------------------------------------
// Creation parameters
// ---------------------------------------------------------------------------

/// Parameters for [`Kernel::create_task`](crate::kernel::Kernel::create_task).
///
/// ```
/// use smptask::task::{Affinity, TaskParams};
///
/// let params = TaskParams::new(4)
///     .with_name("net-rx")
///     .with_affinity(Affinity::Core(1))
///     .with_args(7, 0)
///     .vital(false);
/// assert_eq!(params.priority, 4);
/// ```
pub struct TaskParams {
    /// Label used in logs.
    pub name: &'static str,

    /// `-1` creates the task inactive; otherwise `1..num_priorities`.
    pub priority: i32,

    pub affinity: Affinity,

    /// Stack size in bytes; `0` selects the configured default. Ignored
    /// when `stack` is supplied.
    pub stack_size: usize,

    /// Caller-provided stack. Trimmed to the port's alignment.
    pub stack: Option<&'static mut [u8]>,

    pub arg0: usize,
    pub arg1: usize,

    /// Opaque per-task value for the application.
    pub env: usize,

    /// The system exits once every vital task has exited or been deleted.
    pub vital: bool,
}

impl TaskParams {
    pub fn new(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn with_stack(mut self, stack: &'static mut [u8]) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn with_args(mut self, arg0: usize, arg1: usize) -> Self {
        self.arg0 = arg0;
        self.arg1 = arg1;
        self
    }

    pub fn with_env(mut self, env: usize) -> Self {
        self.env = env;
        self
    }

    pub fn vital(mut self, vital: bool) -> Self {
        self.vital = vital;
        self
    }
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            name: "task",
            priority: 1,
            affinity: Affinity::Any,
            stack_size: 0,
            stack: None,
            arg0: 0,
            arg1: 0,
            env: 0,
            vital: true,
        }
    }
}

/// Snapshot returned by [`Kernel::stat`](crate::kernel::Kernel::stat).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStat {
    pub priority: i32,
    /// Lowest address of the stack.
    pub stack_base: usize,
    pub stack_size: usize,
    pub mode: TaskMode,
    /// Stack pointer saved at the last switch away from the task.
    pub sp: usize,
    /// Bytes of stack touched so far (high-water mark).
    pub used: usize,
}

// ---------------------------------------------------------------------------
// Stacks
// ---------------------------------------------------------------------------

/// Task stack memory, either allocated by the kernel or lent by the caller.
///
/// Owned stacks are backed by `u64` words so the base is 8-byte aligned.
pub(crate) enum Stack {
    Owned(Vec<u64>),
    External(&'static mut [u8]),
}

impl Stack {
    /// Allocate `size` bytes (rounded up to `align`) filled with [`STACK_FILL`].
    pub(crate) fn allocate(size: usize, align: usize) -> Result<Self, KernelError> {
        let size = (size + align - 1) & !(align - 1);
        let words = size.div_ceil(8);
        let mut buf = Vec::new();
        buf.try_reserve_exact(words)
            .map_err(|_| KernelError::StackAlloc)?;
        buf.resize(words, u64::from_ne_bytes([STACK_FILL; 8]));
        Ok(Stack::Owned(buf))
    }

    /// Adopt a caller stack: align the base up, trim the length down to a
    /// multiple of `align`, and fill it.
    pub(crate) fn external(stack: &'static mut [u8], align: usize) -> Result<Self, KernelError> {
        let offset = stack.as_ptr().align_offset(align);
        if offset >= stack.len() {
            return Err(KernelError::StackAlloc);
        }
        let usable = (stack.len() - offset) & !(align - 1);
        if usable == 0 {
            return Err(KernelError::StackAlloc);
        }
        let (_, rest) = stack.split_at_mut(offset);
        let (usable, _) = rest.split_at_mut(usable);
        usable.fill(STACK_FILL);
        Ok(Stack::External(usable))
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            Stack::Owned(words) => bytemuck::cast_slice(words),
            Stack::External(bytes) => bytes,
        }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Stack::Owned(words) => bytemuck::cast_slice_mut(words),
            Stack::External(bytes) => bytes,
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.bytes().as_ptr() as usize
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.bytes().len()
    }

    /// `addr` lies within `[base, base + len]`.
    pub(crate) fn contains(&self, addr: usize) -> bool {
        let base = self.base();
        addr >= base && addr <= base + self.len()
    }

    /// The low canary bytes are untouched.
    pub(crate) fn is_intact(&self) -> bool {
        self.bytes()
            .iter()
            .take(CANARY_LEN)
            .all(|b| *b == STACK_FILL)
    }

    /// Bytes between the top and the deepest byte no longer holding the fill.
    pub(crate) fn high_water(&self) -> usize {
        let untouched = self
            .bytes()
            .iter()
            .take_while(|b| **b == STACK_FILL)
            .count();
        self.len() - untouched
    }
}

/// One's-complement fold of `words` into 32 bits, inverted.
pub(crate) fn fold_checksum(words: &[usize]) -> u32 {
    let mut sum: u64 = 0;
    for word in words {
        sum = sum.wrapping_add(*word as u64);
    }
    let folded = (sum >> 32) + (sum & 0xFFFF_FFFF);
    let folded = (folded >> 32) + (folded & 0xFFFF_FFFF);
    !(folded as u32)
}

// ---------------------------------------------------------------------------
// Task object
// ---------------------------------------------------------------------------

/// Scheduler-owned task object.
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: &'static str,
    pub(crate) entry: TaskFn,
    pub(crate) arg0: usize,
    pub(crate) arg1: usize,
    pub(crate) env: usize,
    pub(crate) hook_context: usize,

    /// `-1` inactive, otherwise a ready-queue level.
    pub(crate) priority: i32,
    /// `1 << priority`, or `0` while inactive.
    pub(crate) mask: u32,
    /// Ready-queue class: a core id or the don't-care class.
    pub(crate) affinity: usize,
    pub(crate) mode: TaskMode,
    /// Core the task last ran on. Equal to `affinity` before first dispatch.
    pub(crate) cur_core: usize,
    /// Queue the task returns to when it becomes ready.
    pub(crate) ready_q: QueueRef,

    pub(crate) stack: Stack,
    pub(crate) context: Context,
    pub(crate) vital: bool,
    /// Pending timeout while sleeping.
    pub(crate) sleep_timer: Option<TimerId>,
    pub(crate) check_value: u32,
}

impl Task {
    /// Checksum over the fields that never change behind the kernel's back.
    pub(crate) fn compute_check_value(&self) -> u32 {
        fold_checksum(&[
            self.stack.len(),
            self.stack.base(),
            self.entry as usize,
            self.arg0,
            self.arg1,
            self.env,
            self.vital as usize,
        ])
    }

    #[inline]
    pub(crate) fn seal(&mut self) {
        self.check_value = self.compute_check_value();
    }

    #[inline]
    pub(crate) fn object_check(&self) -> bool {
        self.check_value == self.compute_check_value()
    }
}

// ---------------------------------------------------------------------------
// Task arena
// ---------------------------------------------------------------------------

struct Slot {
    generation: u16,
    task: Option<Task>,
}

/// Fixed-capacity arena of task objects plus their queue links.
///
/// The slot vectors are reserved at construction and never reallocate, so
/// a task's context stays at a stable address for the port.
pub(crate) struct TaskTable {
    slots: Vec<Slot>,
    links: Vec<Link>,
    free: Vec<u16>,
    capacity: usize,
    live: usize,
}

impl TaskTable {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            links: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            capacity,
            live: 0,
        }
    }

    /// Claim a slot and fill it with the task `build` returns.
    pub(crate) fn insert<F>(&mut self, build: F) -> Result<TaskId, KernelError>
    where
        F: FnOnce(TaskId) -> Result<Task, KernelError>,
    {
        let (index, generation) = match self.free.last() {
            Some(&index) => (index, self.slots[index as usize].generation),
            None if self.slots.len() < self.capacity => (self.slots.len() as u16, 0),
            None => return Err(KernelError::TaskLimit),
        };
        let id = TaskId::new(index, generation);
        let task = build(id)?;

        if self.free.last() == Some(&index) {
            self.free.pop();
            self.slots[index as usize].task = Some(task);
            self.links[index as usize] = Link::default();
        } else {
            self.slots.push(Slot {
                generation,
                task: Some(task),
            });
            self.links.push(Link::default());
        }
        self.live += 1;
        Ok(id)
    }

    /// Release the slot; the handle goes stale.
    pub(crate) fn remove(&mut self, id: TaskId) -> Option<Task> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation || slot.task.is_none() {
            return None;
        }
        let task = slot.task.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.links[id.index()] = Link::default();
        self.free.push(id.slot());
        self.live -= 1;
        task
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<&Task> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.task.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.task.as_mut()
    }

    /// Handle of the live task in slot `index`.
    pub(crate) fn id_at(&self, index: u16) -> Option<TaskId> {
        let slot = self.slots.get(index as usize)?;
        slot.task.as_ref().map(|task| task.id)
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.slots
            .iter()
            .filter_map(|slot| slot.task.as_ref().map(|task| task.id))
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Address of the slot vector, for the scheduler state checksum.
    pub(crate) fn table_addr(&self) -> usize {
        self.slots.as_ptr() as usize
    }
}

impl Linked for TaskTable {
    #[inline]
    fn link(&self, index: u16) -> &Link {
        &self.links[index as usize]
    }

    #[inline]
    fn link_mut(&mut self, index: u16) -> &mut Link {
        &mut self.links[index as usize]
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
