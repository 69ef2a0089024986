//! # SMP Scheduler Core
//!
//! All scheduling state for one kernel instance and the algorithms that
//! mutate it. Every method here runs inside the kernel's critical section
//! (interrupts masked, state lock held); [`crate::kernel`] owns the locking,
//! the scheduler-lock keys and the cross-core waits.
//!
//! ## State
//!
//! ```text
//!   ready queues [class][prio]    cur_set[class]      work_flag (bit/core)
//!   ┌──────────────────────┐     ┌────────────┐      ┌───────────────┐
//!   │ core 0 │ ...         │ ──► │ 0b0000_0101│      │ 0b01          │
//!   │ core 1 │ ...         │ ──► │ 0b0000_0011│      └───────────────┘
//!   │ any    │ ...         │ ──► │ 0b0010_0000│
//!   └──────────────────────┘     └────────────┘
//!
//!   per core: cur_task, cur_mask (1 << prio of cur_task, 0 if none)
//!   run-queue: [(core 1, 2), (core 0, 5)]   ascending by priority
//! ```
//!
//! ## Scheduling on one core
//!
//! 1. Compare the best don't-care priority `x` with this core's running
//!    priority and its best local priority.
//! 2. If `x` wins and this core is not already the lowest-priority core,
//!    hand the don't-care tasks to the lowest cores first by walking the
//!    run-queue. If the walk reaches this core it takes one itself;
//!    otherwise it leaves them to the cores it interrupted.
//! 3. Otherwise take the best local task if it out-ranks the running one.
//! 4. Switch: a preempted task goes back to the *head* of its queue.
//! 5. Repeat while this core's work flag was raised again meanwhile.
//! 6. Finally, if a don't-care task still out-ranks the lowest other core,
//!    interrupt that core.

use alloc::vec;
use alloc::vec::Vec;

use crate::clock::TimerId;
use crate::config::{KernelConfig, IDLE_PRIORITY};
use crate::error::{FatalError, KernelError};
use crate::hooks::SchedulerHooks;
use crate::port::Port;
use crate::queue::{top_bit, Linked, QueueRef, ReadyQueues};
use crate::runq::{RunQEntry, SortedRunQueue};
use crate::task::{
    fold_checksum, priority_mask, Affinity, CoreId, Stack, Task, TaskFn, TaskId, TaskMode,
    TaskParams, TaskStat, TaskTable,
};

#[inline]
const fn core_bit(core: CoreId) -> u32 {
    1 << core
}

/// Previous scheduler-lock state, returned by
/// [`Kernel::disable`](crate::kernel::Kernel::disable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "pass the key back to Kernel::restore"]
pub struct SchedulerKey(bool);

impl SchedulerKey {
    pub(crate) const UNLOCKED: Self = Self(false);

    /// Whether the scheduler was already disabled when this key was taken.
    #[inline]
    pub fn was_locked(&self) -> bool {
        self.0
    }
}

/// Result of one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The core has a current task (possibly unchanged).
    Busy,
    /// Nothing is ready anywhere for this core.
    Idle,
}

/// Result of an affinity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AffinityChange {
    Done(Affinity),
    /// The task was running on `remote` and has been blocked there; once
    /// `remote` has rescheduled, finish with
    /// [`SchedulerState::finish_migration`].
    Migrate { old: Affinity, remote: CoreId },
}

#[derive(Debug, Clone, Copy, Default)]
struct CoreState {
    /// Task whose context the core is executing. Stays set while the core
    /// idles after its task blocked.
    cur_task: Option<TaskId>,
    cur_mask: u32,
    started: bool,
    idle: bool,
}

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

/// Scheduling state of one kernel instance.
///
/// Read-only views are available through
/// [`Kernel::inspect`](crate::kernel::Kernel::inspect).
pub struct SchedulerState {
    config: KernelConfig,
    pub(crate) tasks: TaskTable,
    ready: ReadyQueues,
    run_queue: SortedRunQueue,
    cores: Vec<CoreState>,
    work_flag: u32,
    locked: bool,
    vital_tasks: usize,
    idle_tasks: Vec<Option<TaskId>>,
    state_check: u32,
}

impl SchedulerState {
    /// Allocate every table. The scheduler starts locked: tasks can be
    /// created, but nothing is dispatched until a core is started.
    pub(crate) fn new(config: KernelConfig) -> Self {
        let mut state = Self {
            config,
            tasks: TaskTable::with_capacity(config.max_tasks),
            ready: ReadyQueues::new(config.num_cores + 1, config.num_priorities),
            run_queue: SortedRunQueue::new(config.num_cores),
            cores: vec![CoreState::default(); config.num_cores],
            work_flag: 0,
            locked: true,
            vital_tasks: 0,
            idle_tasks: vec![None; config.num_cores],
            state_check: 0,
        };
        state.state_check = state.compute_state_check();
        state
    }

    #[inline]
    fn dont_care(&self) -> usize {
        self.config.num_cores
    }

    fn task(&self, id: TaskId) -> &Task {
        match self.tasks.get(id) {
            Some(task) => task,
            None => panic!("stale task handle {}", id),
        }
    }

    fn task_mut(&mut self, id: TaskId) -> &mut Task {
        match self.tasks.get_mut(id) {
            Some(task) => task,
            None => panic!("stale task handle {}", id),
        }
    }

    fn interrupt<P: Port>(&self, core: CoreId, port: &P) {
        // Cores still in their boot phase pick up their work flag at start.
        if self.cores[core].started {
            log::trace!("interrupt core {}", core);
            port.interrupt_core(core);
        }
    }

    fn assert_priority(&self, priority: i32, allow_idle: bool) {
        let idle_ok = allow_idle || !self.config.idle_tasks;
        assert!(
            (priority == -1 || priority > 0 || (priority == IDLE_PRIORITY && idle_ok))
                && priority < self.config.num_priorities as i32,
            "invalid task priority {}",
            priority
        );
    }

    // -----------------------------------------------------------------------
    // Integrity checks
    // -----------------------------------------------------------------------

    fn compute_state_check(&self) -> u32 {
        let [queues, cur_set] = self.ready.table_addrs();
        fold_checksum(&[
            queues,
            cur_set,
            self.run_queue.table_addr(),
            self.cores.as_ptr() as usize,
            self.tasks.table_addr(),
            self.idle_tasks.as_ptr() as usize,
        ])
    }

    fn object_check<H: SchedulerHooks>(&self, id: TaskId, hooks: &H) {
        if self.config.object_check && !self.task(id).object_check() {
            hooks.fatal(FatalError::ObjectCheckFailed(id));
        }
    }

    fn check_stacks<H: SchedulerHooks>(&self, from: Option<TaskId>, next: TaskId, hooks: &H) {
        self.object_check(next, hooks);
        let task = self.task(next);
        if !task.stack.is_intact() {
            hooks.fatal(FatalError::StackOverflow(next));
        }
        if !task.stack.contains(task.context.sp) {
            hooks.fatal(FatalError::SpOutOfBounds(next));
        }
        if let Some(from) = from {
            self.object_check(from, hooks);
            if !self.task(from).stack.is_intact() {
                hooks.fatal(FatalError::StackOverflow(from));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Scheduler lock
    // -----------------------------------------------------------------------

    /// Take the scheduler lock, returning the previous state.
    pub(crate) fn disable<H: SchedulerHooks>(&mut self, hooks: &H) -> SchedulerKey {
        if self.config.module_state_check && self.state_check != self.compute_state_check() {
            hooks.fatal(FatalError::ModuleStateCheckFailed);
        }
        let key = SchedulerKey(self.locked);
        self.locked = true;
        key
    }

    #[inline]
    pub(crate) fn unlock(&mut self) {
        self.locked = false;
    }

    #[inline]
    pub(crate) fn relock(&mut self) {
        self.locked = true;
    }

    /// `core` is running and has been asked to reschedule.
    #[inline]
    pub(crate) fn needs_schedule(&self, core: CoreId) -> bool {
        self.cores[core].started && self.work_pending(core)
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Run the scheduler on `core` until its work flag stays clear.
    pub(crate) fn schedule<P: Port, H: SchedulerHooks>(
        &mut self,
        core: CoreId,
        port: &P,
        hooks: &H,
    ) -> Outcome {
        let dc = self.dont_care();
        log::trace!("core {}: schedule", core);

        loop {
            self.work_flag &= !core_bit(core);

            let pri_x = self.ready.top(dc);
            let pri_cur = top_bit(self.cores[core].cur_mask);
            let pri_local = self.ready.top(core);

            let mut early_exit = false;
            let mut winner = None;

            if pri_x > pri_cur && pri_x > pri_local {
                let priority = pri_x - 1;
                winner = Some(QueueRef::Ready {
                    class: dc,
                    priority: priority as usize,
                });
                // Already the lowest core: take it without consulting others.
                if pri_cur as i32 != self.run_queue.head().priority + 1 {
                    early_exit = !self.claim_dont_care(core, priority as i32, port);
                    if early_exit {
                        winner = None;
                    }
                }
            }

            if winner.is_none() {
                if pri_local > pri_cur {
                    winner = Some(QueueRef::Ready {
                        class: core,
                        priority: (pri_local - 1) as usize,
                    });
                } else if early_exit {
                    return Outcome::Busy;
                } else if pri_local + pri_x + pri_cur == 0 {
                    log::trace!("core {}: all tasks blocked", core);
                    self.cores[core].idle = true;
                    return Outcome::Idle;
                }
            }

            match winner {
                Some(queue) => self.switch_to(core, queue, port, hooks),
                None => log::trace!("core {}: no work", core),
            }

            if self.work_flag & core_bit(core) == 0 {
                break;
            }
        }

        self.kick_lowest(core, port);
        Outcome::Busy
    }

    /// Pair the don't-care tasks waiting at `priority` with run-queue
    /// entries of started cores from the lowest up, flagging each core they
    /// out-rank. Returns `true` when the walk reaches `core`, which then
    /// takes one.
    fn claim_dont_care<P: Port>(&mut self, core: CoreId, priority: i32, port: &P) -> bool {
        let queue = QueueRef::Ready {
            class: self.dont_care(),
            priority: priority as usize,
        };
        let mut waiting = self.ready.queue(queue).len();
        let mut position = 0;
        while waiting > 0 {
            let Some(entry) = self.run_queue.get(position) else {
                break;
            };
            position += 1;
            if !self.cores[entry.core].started {
                continue;
            }
            if priority <= entry.priority {
                break;
            }
            waiting -= 1;
            self.work_flag |= core_bit(entry.core);
            if entry.core == core {
                return true;
            }
            self.interrupt(entry.core, port);
        }
        false
    }

    /// Interrupt the lowest started core other than `core` if a don't-care
    /// task out-ranks it.
    fn kick_lowest<P: Port>(&mut self, core: CoreId, port: &P) {
        let pri_x = self.ready.top(self.dont_care());
        if pri_x == 0 {
            return;
        }
        let lowest = self
            .run_queue
            .as_slice()
            .iter()
            .find(|entry| entry.core != core && self.cores[entry.core].started)
            .copied();
        let Some(lowest) = lowest else {
            return;
        };
        if pri_x as i32 > lowest.priority + 1 {
            self.work_flag |= core_bit(lowest.core);
            self.interrupt(lowest.core, port);
        }
    }

    /// Make the head of `queue` the current task of `core`.
    fn switch_to<P: Port, H: SchedulerHooks>(
        &mut self,
        core: CoreId,
        queue: QueueRef,
        port: &P,
        hooks: &H,
    ) {
        // The outgoing context, unless the task has since been deleted or
        // picked up by another core while this one idled.
        let from = self.cores[core].cur_task.filter(|id| {
            self.tasks
                .get(*id)
                .is_some_and(|t| !(t.mode == TaskMode::Running && t.cur_core != core))
        });

        if let Some(prev) = from {
            let task = self.task_mut(prev);
            if task.mode == TaskMode::Running {
                task.mode = TaskMode::Ready;
                let home = task.ready_q;
                self.ready.push_front(&mut self.tasks, home, prev.slot());
            }
        }

        let Some(next) = self
            .ready
            .pop_front(&mut self.tasks, queue)
            .and_then(|index| self.tasks.id_at(index))
        else {
            debug_assert!(false, "cur_set advertised an empty queue");
            return;
        };

        let task = self.task_mut(next);
        task.mode = TaskMode::Running;
        task.cur_core = core;
        let (priority, mask, to) = (task.priority, task.mask, task.context);

        let state = &mut self.cores[core];
        state.cur_task = Some(next);
        state.cur_mask = mask;
        state.idle = false;
        if self.run_queue.priority_of(core) != priority {
            self.run_queue.reorder(core, priority);
        }

        if self.config.check_stacks {
            self.check_stacks(from, next, hooks);
        }
        hooks.on_switch(core, from, next);
        log::debug!("core {}: switch {:?} -> {}", core, from, next);

        let from = from
            .and_then(|id| self.tasks.get_mut(id))
            .map(|task| (task.id, &mut task.context));
        port.swap(core, from, (next, to));
    }

    /// Dispatch the first task on a core that has never run. Returns
    /// `false` when nothing is ready for it.
    pub(crate) fn start_core<P: Port, H: SchedulerHooks>(
        &mut self,
        core: CoreId,
        port: &P,
        hooks: &H,
    ) -> bool {
        assert!(!self.cores[core].started, "core {} already started", core);
        let dc = self.dont_care();
        let pri_x = self.ready.top(dc);
        let pri_local = self.ready.top(core);

        self.cores[core].started = true;
        self.work_flag &= !core_bit(core);
        log::info!("core {} started", core);

        if pri_x == 0 && pri_local == 0 {
            self.cores[core].idle = true;
            return false;
        }
        let queue = if pri_local >= pri_x {
            QueueRef::Ready {
                class: core,
                priority: (pri_local - 1) as usize,
            }
        } else {
            QueueRef::Ready {
                class: dc,
                priority: (pri_x - 1) as usize,
            }
        };
        self.switch_to(core, queue, port, hooks);
        true
    }

    // -----------------------------------------------------------------------
    // Block / unblock
    // -----------------------------------------------------------------------

    /// Mark `id` blocked. A running task also gives up its core, which is
    /// flagged (and interrupted when it is not `core`).
    pub(crate) fn block_task<P: Port, H: SchedulerHooks>(
        &mut self,
        core: CoreId,
        id: TaskId,
        port: &P,
        hooks: &H,
    ) {
        self.object_check(id, hooks);
        let task = self.task_mut(id);
        let was_running = task.mode == TaskMode::Running;
        let on = task.cur_core;
        task.mode = TaskMode::Blocked;

        if was_running {
            self.cores[on].cur_mask = 0;
            self.run_queue.reorder(on, -1);
            self.work_flag |= core_bit(on);
            if on != core {
                self.interrupt(on, port);
            }
        }
        log::debug!("block {}", id);
    }

    /// Take a task that is not running off its queue, then block it.
    pub(crate) fn block<P: Port, H: SchedulerHooks>(
        &mut self,
        core: CoreId,
        id: TaskId,
        port: &P,
        hooks: &H,
    ) {
        if self.task(id).mode != TaskMode::Running {
            self.ready.remove(&mut self.tasks, id.slot());
        }
        self.block_task(core, id, port, hooks);
    }

    /// Append `id` to its ready queue and flag whichever core should look.
    pub(crate) fn unblock_task<P: Port, H: SchedulerHooks>(
        &mut self,
        core: CoreId,
        id: TaskId,
        port: &P,
        hooks: &H,
    ) {
        self.object_check(id, hooks);
        let task = self.task_mut(id);
        task.mode = TaskMode::Ready;
        let (home, class, mask) = (task.ready_q, task.affinity, task.mask);
        self.ready.push_back(&mut self.tasks, home, id.slot());
        self.flag_for(core, class, mask, port);
        hooks.on_ready(id);
        log::debug!("ready {}", id);
    }

    /// A task with `mask` became ready in `class`: don't-care work is
    /// looked at by the calling core, pinned work by its own core when it
    /// out-ranks what runs there.
    fn flag_for<P: Port>(&mut self, core: CoreId, class: usize, mask: u32, port: &P) {
        if class == self.dont_care() {
            self.work_flag |= core_bit(core);
        } else if mask > self.cores[class].cur_mask {
            self.work_flag |= core_bit(class);
            if class != core {
                self.interrupt(class, port);
            }
        }
    }

    /// The sleep timeout `timer` of `id` fired.
    pub(crate) fn sleep_expired<P: Port, H: SchedulerHooks>(
        &mut self,
        core: CoreId,
        id: TaskId,
        timer: TimerId,
        port: &P,
        hooks: &H,
    ) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        if task.sleep_timer != Some(timer) {
            return;
        }
        task.sleep_timer = None;
        if task.mode == TaskMode::Blocked {
            self.unblock_task(core, id, port, hooks);
        }
    }

    pub(crate) fn set_sleep_timer(&mut self, id: TaskId, timer: Option<TimerId>) {
        self.task_mut(id).sleep_timer = timer;
    }

    pub(crate) fn take_sleep_timer(&mut self, id: TaskId) -> Option<TimerId> {
        self.task_mut(id).sleep_timer.take()
    }

    // -----------------------------------------------------------------------
    // Priority and affinity
    // -----------------------------------------------------------------------

    /// Change the priority of `id`. Returns the old priority and, when the
    /// task is running on another core, that core: the caller must wait for
    /// it to reschedule.
    pub(crate) fn set_priority<P: Port>(
        &mut self,
        core: CoreId,
        id: TaskId,
        priority: i32,
        port: &P,
    ) -> (i32, Option<CoreId>) {
        self.assert_priority(priority, false);
        let task = self.task(id);
        let old = task.priority;
        if old == priority {
            return (old, None);
        }
        let (mode, class, on) = (task.mode, task.affinity, task.cur_core);
        let mask = priority_mask(priority);
        let home = QueueRef::home(class, priority);
        log::debug!("set priority {}: {} -> {}", id, old, priority);

        if mode == TaskMode::Ready {
            self.ready.remove(&mut self.tasks, id.slot());
            self.ready.push_back(&mut self.tasks, home, id.slot());
            self.flag_for(core, class, mask, port);
        }

        let task = self.task_mut(id);
        task.priority = priority;
        task.mask = mask;
        task.ready_q = home;

        if mode != TaskMode::Running {
            return (old, None);
        }
        self.run_queue.reorder(on, priority);
        self.cores[on].cur_mask = mask;
        self.work_flag |= core_bit(on);
        if on == core {
            (old, None)
        } else {
            self.interrupt(on, port);
            (old, Some(on))
        }
    }

    /// Change the affinity of `id`. See [`AffinityChange`].
    pub(crate) fn set_affinity<P: Port, H: SchedulerHooks>(
        &mut self,
        core: CoreId,
        id: TaskId,
        affinity: Affinity,
        port: &P,
        hooks: &H,
    ) -> AffinityChange {
        let num_cores = self.config.num_cores;
        assert!(affinity.is_valid(num_cores), "invalid affinity {:?}", affinity);
        let class = affinity.class(num_cores);
        let task = self.task(id);
        let old = Affinity::from_class(task.affinity, num_cores);
        if class == task.affinity {
            return AffinityChange::Done(old);
        }
        let (mode, on, priority, mask) = (task.mode, task.cur_core, task.priority, task.mask);
        let home = QueueRef::home(class, priority);
        log::debug!("set affinity {}: {:?} -> {:?}", id, old, affinity);

        let rehome = |state: &mut Self| {
            let task = state.task_mut(id);
            task.affinity = class;
            task.ready_q = home;
        };

        if priority < 0 {
            rehome(self);
            return AffinityChange::Done(old);
        }

        match mode {
            TaskMode::Running if class == on || class == self.dont_care() => rehome(self),
            TaskMode::Ready => {
                self.ready.remove(&mut self.tasks, id.slot());
                self.ready.push_back(&mut self.tasks, home, id.slot());
                rehome(self);
                self.flag_for(core, class, mask, port);
            }
            TaskMode::Running if on == core => {
                // Give up this core; the switch puts the task on its new queue.
                rehome(self);
                self.cores[core].cur_mask = 0;
                self.run_queue.reorder(core, -1);
                if mask > self.cores[class].cur_mask {
                    self.work_flag |= core_bit(class) | core_bit(core);
                    self.interrupt(class, port);
                } else {
                    self.work_flag |= core_bit(core);
                }
            }
            TaskMode::Running => {
                self.block_task(core, id, port, hooks);
                return AffinityChange::Migrate { old, remote: on };
            }
            _ => rehome(self),
        }
        AffinityChange::Done(old)
    }

    /// Complete an [`AffinityChange::Migrate`].
    pub(crate) fn finish_migration<P: Port, H: SchedulerHooks>(
        &mut self,
        core: CoreId,
        id: TaskId,
        affinity: Affinity,
        port: &P,
        hooks: &H,
    ) {
        let class = affinity.class(self.config.num_cores);
        let task = self.task_mut(id);
        task.affinity = class;
        task.ready_q = QueueRef::home(class, task.priority);
        self.unblock_task(core, id, port, hooks);
    }

    // -----------------------------------------------------------------------
    // Yield and exit
    // -----------------------------------------------------------------------

    /// Put the current task of `core` at the tail of its queue and flag the
    /// core.
    pub(crate) fn yield_core(&mut self, core: CoreId) {
        if let Some(id) = self.cores[core].cur_task {
            let running = self.cores[core].cur_mask != 0
                && self.tasks.get(id).is_some_and(|t| t.mode == TaskMode::Running);
            if running {
                let task = self.task_mut(id);
                task.mode = TaskMode::Ready;
                let home = task.ready_q;
                self.ready.push_back(&mut self.tasks, home, id.slot());
                log::debug!("core {}: yield {}", core, id);
            }
        }
        self.cores[core].cur_mask = 0;
        self.run_queue.reorder(core, -1);
        self.work_flag |= core_bit(core);
    }

    /// Take the exiting task `id` off `core` for good.
    pub(crate) fn terminate<P: Port, H: SchedulerHooks>(
        &mut self,
        core: CoreId,
        id: TaskId,
        port: &P,
        hooks: &H,
    ) {
        self.block_task(core, id, port, hooks);
        self.task_mut(id).mode = TaskMode::Terminated;
        log::debug!("exit {}", id);
        self.release_vital(id, hooks);
        if self.config.delete_terminated_tasks {
            self.ready
                .push_back(&mut self.tasks, QueueRef::Terminated, id.slot());
        }
    }

    fn release_vital<H: SchedulerHooks>(&mut self, id: TaskId, hooks: &H) {
        if self.task(id).vital {
            self.vital_tasks -= 1;
            if self.vital_tasks == 0 {
                hooks.system_exit(0);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Creation and deletion
    // -----------------------------------------------------------------------

    /// Build a task object: validate, obtain and fill its stack, lay out the
    /// first frame and run the create hook. The task is not yet queued.
    pub(crate) fn create<P: Port, H: SchedulerHooks>(
        &mut self,
        entry: TaskFn,
        params: TaskParams,
        allow_idle: bool,
        port: &P,
        hooks: &H,
    ) -> Result<TaskId, KernelError> {
        let TaskParams {
            name,
            priority,
            affinity,
            stack_size,
            stack,
            arg0,
            arg1,
            env,
            vital,
        } = params;
        self.assert_priority(priority, allow_idle);
        assert!(
            affinity.is_valid(self.config.num_cores),
            "invalid affinity {:?}",
            affinity
        );

        let class = affinity.class(self.config.num_cores);
        let align = port.stack_alignment();
        let size = if stack_size == 0 {
            self.config.default_stack_size
        } else {
            stack_size
        };

        let id = self.tasks.insert(|id| {
            let mut stack = match stack {
                Some(stack) => Stack::external(stack, align)?,
                None => Stack::allocate(size, align)?,
            };
            let context = port.init_context(id, entry, (arg0, arg1), stack.bytes_mut())?;
            let mut task = Task {
                id,
                name,
                entry,
                arg0,
                arg1,
                env,
                hook_context: 0,
                priority,
                mask: priority_mask(priority),
                affinity: class,
                mode: TaskMode::Ready,
                cur_core: class,
                ready_q: QueueRef::home(class, priority),
                stack,
                context,
                vital,
                sleep_timer: None,
                check_value: 0,
            };
            task.seal();
            Ok(task)
        })?;

        if let Err(err) = hooks.on_create(id) {
            self.tasks.remove(id);
            return Err(err);
        }
        if vital {
            self.vital_tasks += 1;
        }
        log::debug!("created {} '{}' priority {}", id, name, priority);
        Ok(id)
    }

    /// Queue a freshly created task: inactive list for priority `-1`,
    /// otherwise through the unblock path.
    pub(crate) fn admit<P: Port, H: SchedulerHooks>(
        &mut self,
        core: CoreId,
        id: TaskId,
        port: &P,
        hooks: &H,
    ) {
        if self.task(id).ready_q == QueueRef::Inactive {
            self.ready
                .push_back(&mut self.tasks, QueueRef::Inactive, id.slot());
        } else {
            self.unblock_task(core, id, port, hooks);
        }
    }

    /// Free `id`. The caller has cancelled its sleep timer. `reclaim` is set
    /// when the terminated-task reclaimer is the caller.
    pub(crate) fn delete<H: SchedulerHooks>(&mut self, id: TaskId, reclaim: bool, hooks: &H) {
        assert!(
            self.mode(id) != TaskMode::Running,
            "cannot delete running task {}",
            id
        );
        let task = self.task(id);
        let queued_for_reclaim = self.config.delete_terminated_tasks
            && task.mode == TaskMode::Terminated
            && self.tasks.link(id.slot()).queue() == Some(QueueRef::Terminated);
        if queued_for_reclaim && !reclaim {
            hooks.fatal(FatalError::DeleteNotAllowed(id));
        }
        let terminated = task.mode == TaskMode::Terminated;

        self.ready.remove(&mut self.tasks, id.slot());
        if !terminated {
            self.release_vital(id, hooks);
        }
        hooks.on_delete(id);
        for state in self.cores.iter_mut() {
            if state.cur_task == Some(id) {
                state.cur_task = None;
            }
        }
        self.tasks.remove(id);
        log::debug!("deleted {}", id);
    }

    /// Oldest task waiting on the terminated list.
    pub(crate) fn next_terminated(&self) -> Option<TaskId> {
        self.ready
            .queue(QueueRef::Terminated)
            .head()
            .and_then(|index| self.tasks.id_at(index))
    }

    pub(crate) fn set_idle_task(&mut self, core: CoreId, id: TaskId) {
        self.idle_tasks[core] = Some(id);
    }

    // -----------------------------------------------------------------------
    // Task fields
    // -----------------------------------------------------------------------

    pub(crate) fn stat(&self, id: TaskId) -> TaskStat {
        let task = self.task(id);
        TaskStat {
            priority: task.priority,
            stack_base: task.stack.base(),
            stack_size: task.stack.len(),
            mode: self.mode(id),
            sp: task.context.sp,
            used: task.stack.high_water(),
        }
    }

    pub(crate) fn name(&self, id: TaskId) -> &'static str {
        self.task(id).name
    }

    pub(crate) fn entry(&self, id: TaskId) -> TaskFn {
        self.task(id).entry
    }

    pub(crate) fn args(&self, id: TaskId) -> (usize, usize) {
        let task = self.task(id);
        (task.arg0, task.arg1)
    }

    pub(crate) fn set_args(&mut self, id: TaskId, arg0: usize, arg1: usize) {
        let task = self.task_mut(id);
        task.arg0 = arg0;
        task.arg1 = arg1;
        task.seal();
    }

    pub(crate) fn env(&self, id: TaskId) -> usize {
        self.task(id).env
    }

    pub(crate) fn set_env(&mut self, id: TaskId, env: usize) {
        let task = self.task_mut(id);
        task.env = env;
        task.seal();
    }

    pub(crate) fn hook_context(&self, id: TaskId) -> usize {
        self.task(id).hook_context
    }

    pub(crate) fn set_hook_context(&mut self, id: TaskId, context: usize) {
        self.task_mut(id).hook_context = context;
    }

    // -----------------------------------------------------------------------
    // Read-only views
    // -----------------------------------------------------------------------

    #[inline]
    pub fn num_cores(&self) -> usize {
        self.config.num_cores
    }

    #[inline]
    pub fn num_priorities(&self) -> usize {
        self.config.num_priorities
    }

    /// Task running on `core`; `None` before start and while idle.
    pub fn current(&self, core: CoreId) -> Option<TaskId> {
        let state = &self.cores[core];
        if state.idle {
            None
        } else {
            state.cur_task
        }
    }

    /// Priority bit of the task running on `core`, `0` if none.
    #[inline]
    pub fn cur_mask(&self, core: CoreId) -> u32 {
        self.cores[core].cur_mask
    }

    #[inline]
    pub fn is_started(&self, core: CoreId) -> bool {
        self.cores[core].started
    }

    #[inline]
    pub fn work_flag(&self) -> u32 {
        self.work_flag
    }

    #[inline]
    pub fn work_pending(&self, core: CoreId) -> bool {
        self.work_flag & core_bit(core) != 0
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Non-empty priorities of the ready queues for `affinity`.
    pub fn cur_set(&self, affinity: Affinity) -> u32 {
        self.ready.cur_set(affinity.class(self.config.num_cores))
    }

    /// Ready tasks of one queue, head first.
    pub fn ready_tasks(&self, affinity: Affinity, priority: usize) -> Vec<TaskId> {
        let queue = QueueRef::Ready {
            class: affinity.class(self.config.num_cores),
            priority,
        };
        self.ready
            .queue(queue)
            .iter(&self.tasks)
            .filter_map(|index| self.tasks.id_at(index))
            .collect()
    }

    /// Exited tasks awaiting reclamation, oldest first.
    pub fn terminated_tasks(&self) -> Vec<TaskId> {
        self.ready
            .queue(QueueRef::Terminated)
            .iter(&self.tasks)
            .filter_map(|index| self.tasks.id_at(index))
            .collect()
    }

    #[inline]
    pub fn run_queue(&self) -> &[RunQEntry] {
        self.run_queue.as_slice()
    }

    #[inline]
    pub fn vital_tasks(&self) -> usize {
        self.vital_tasks
    }

    #[inline]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.ids().collect()
    }

    pub fn idle_task(&self, core: CoreId) -> Option<TaskId> {
        self.idle_tasks[core]
    }

    pub(crate) fn is_blocked(&self, id: TaskId) -> bool {
        self.task(id).mode == TaskMode::Blocked
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.get(id).is_some()
    }

    pub fn priority(&self, id: TaskId) -> i32 {
        self.task(id).priority
    }

    pub fn affinity(&self, id: TaskId) -> Affinity {
        Affinity::from_class(self.task(id).affinity, self.config.num_cores)
    }

    /// Observable mode: the stored mode for blocked and terminated tasks,
    /// `Inactive` at priority `-1`, `Running` while some core executes it.
    pub fn mode(&self, id: TaskId) -> TaskMode {
        let task = self.task(id);
        match task.mode {
            TaskMode::Blocked | TaskMode::Terminated => return task.mode,
            _ if task.priority == -1 => return TaskMode::Inactive,
            _ => {}
        }
        match self.cores.get(task.cur_core) {
            Some(state) if !state.idle && state.cur_task == Some(id) => TaskMode::Running,
            _ => task.mode,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoHooks;
    use crate::sim::{SimPort, TraceHooks};

    fn body(_: usize, _: usize) {}

    struct Rig {
        state: SchedulerState,
        port: SimPort,
        hooks: NoHooks,
    }

    impl Rig {
        fn new(config: KernelConfig) -> Self {
            Self {
                state: SchedulerState::new(config),
                port: SimPort::new(),
                hooks: NoHooks,
            }
        }

        fn spawn(&mut self, core: CoreId, priority: i32, affinity: Affinity) -> TaskId {
            let params = TaskParams::new(priority)
                .with_affinity(affinity)
                .with_stack_size(256)
                .vital(false);
            let id = self
                .state
                .create(body, params, false, &self.port, &self.hooks)
                .unwrap();
            self.state.admit(core, id, &self.port, &self.hooks);
            id
        }

        fn start(&mut self, core: CoreId) {
            self.state.start_core(core, &self.port, &self.hooks);
            self.state.schedule(core, &self.port, &self.hooks);
            self.state.unlock();
        }

        fn schedule(&mut self, core: CoreId) -> Outcome {
            self.state.schedule(core, &self.port, &self.hooks)
        }

        /// Deliver queued inter-core interrupts until none are left.
        fn settle(&mut self) {
            while let Some(core) = self.port.take_interrupt() {
                if self.state.needs_schedule(core) {
                    self.schedule(core);
                }
            }
        }
    }

    fn bare(cores: usize) -> KernelConfig {
        KernelConfig::new(cores).with_idle_tasks(false)
    }

    #[test]
    fn test_starts_locked_and_empty() {
        let rig = Rig::new(bare(2));
        assert!(rig.state.is_locked());
        assert_eq!(rig.state.current(0), None);
        assert_eq!(rig.state.run_queue().len(), 2);
        assert!(rig.state.run_queue().iter().all(|e| e.priority == -1));
    }

    #[test]
    fn test_start_prefers_local_on_tie() {
        let mut rig = Rig::new(bare(1));
        let any = rig.spawn(0, 3, Affinity::Any);
        let local = rig.spawn(0, 3, Affinity::Core(0));
        rig.start(0);
        assert_eq!(rig.state.current(0), Some(local));
        assert_eq!(rig.state.mode(any), TaskMode::Ready);
    }

    #[test]
    fn test_start_takes_higher_dont_care() {
        let mut rig = Rig::new(bare(1));
        let any = rig.spawn(0, 5, Affinity::Any);
        rig.spawn(0, 3, Affinity::Core(0));
        rig.start(0);
        assert_eq!(rig.state.current(0), Some(any));
        assert_eq!(rig.state.run_queue()[0], RunQEntry { core: 0, priority: 5 });
    }

    #[test]
    fn test_preempted_task_goes_to_head() {
        let mut rig = Rig::new(bare(1));
        let a = rig.spawn(0, 3, Affinity::Core(0));
        let b = rig.spawn(0, 3, Affinity::Core(0));
        rig.start(0);
        assert_eq!(rig.state.current(0), Some(a));

        let c = rig.spawn(0, 5, Affinity::Core(0));
        assert!(rig.state.work_pending(0));
        rig.schedule(0);
        assert_eq!(rig.state.current(0), Some(c));
        assert_eq!(rig.state.ready_tasks(Affinity::Core(0), 3), vec![a, b]);
    }

    #[test]
    fn test_yield_goes_to_tail() {
        let mut rig = Rig::new(bare(1));
        let a = rig.spawn(0, 3, Affinity::Core(0));
        let b = rig.spawn(0, 3, Affinity::Core(0));
        rig.start(0);

        rig.state.yield_core(0);
        rig.schedule(0);
        assert_eq!(rig.state.current(0), Some(b));
        assert_eq!(rig.state.ready_tasks(Affinity::Core(0), 3), vec![a]);

        rig.state.yield_core(0);
        rig.schedule(0);
        assert_eq!(rig.state.current(0), Some(a));
    }

    #[test]
    fn test_lone_task_yield_keeps_running() {
        let mut rig = Rig::new(bare(1));
        let a = rig.spawn(0, 3, Affinity::Core(0));
        rig.start(0);
        rig.state.yield_core(0);
        assert_eq!(rig.schedule(0), Outcome::Busy);
        assert_eq!(rig.state.current(0), Some(a));
        assert_eq!(rig.state.cur_mask(0), 1 << 3);
    }

    #[test]
    fn test_all_blocked_reports_idle() {
        let mut rig = Rig::new(bare(1));
        let a = rig.spawn(0, 3, Affinity::Core(0));
        rig.start(0);
        rig.state.block(0, a, &rig.port, &rig.hooks);
        assert_eq!(rig.schedule(0), Outcome::Idle);
        assert_eq!(rig.state.current(0), None);
        assert_eq!(rig.state.mode(a), TaskMode::Blocked);

        rig.state.unblock_task(0, a, &rig.port, &rig.hooks);
        assert!(rig.state.work_pending(0));
        assert_eq!(rig.schedule(0), Outcome::Busy);
        assert_eq!(rig.state.current(0), Some(a));
    }

    #[test]
    fn test_dont_care_goes_to_lowest_core() {
        let mut rig = Rig::new(bare(2));
        let hi = rig.spawn(0, 6, Affinity::Core(0));
        let lo = rig.spawn(1, 2, Affinity::Core(1));
        rig.start(0);
        rig.start(1);
        rig.port.clear();

        // Core 0 is busy with higher work; core 1 is the lowest.
        let d = rig.spawn(0, 4, Affinity::Any);
        rig.schedule(0);
        assert_eq!(rig.state.current(0), Some(hi));
        assert_eq!(rig.port.interrupts_sent(), vec![1]);

        rig.settle();
        assert_eq!(rig.state.current(1), Some(d));
        assert_eq!(rig.state.mode(lo), TaskMode::Ready);
    }

    #[test]
    fn test_scan_adopts_when_reaching_own_core() {
        let mut rig = Rig::new(bare(2));
        rig.spawn(0, 3, Affinity::Core(0));
        rig.spawn(1, 1, Affinity::Core(1));
        rig.start(0);
        rig.start(1);
        rig.port.clear();

        // Two don't-care tasks: one for core 1 (lowest), one for core 0.
        let d1 = rig.spawn(0, 5, Affinity::Any);
        let d2 = rig.spawn(0, 5, Affinity::Any);
        rig.schedule(0);
        assert_eq!(rig.state.current(0), Some(d1));
        rig.settle();
        assert_eq!(rig.state.current(1), Some(d2));
        assert_eq!(rig.state.cur_set(Affinity::Any), 0);
    }

    #[test]
    fn test_set_priority_of_ready_pinned_task_flags_its_core() {
        let mut rig = Rig::new(bare(2));
        rig.spawn(0, 3, Affinity::Core(0));
        rig.spawn(1, 3, Affinity::Core(1));
        let waiting = rig.spawn(1, 2, Affinity::Core(1));
        rig.start(0);
        rig.start(1);
        rig.port.clear();

        let (old, remote) = rig.state.set_priority(0, waiting, 7, &rig.port);
        assert_eq!(old, 2);
        assert_eq!(remote, None);
        assert!(rig.state.work_pending(1));
        assert_eq!(rig.port.interrupts_sent(), vec![1]);
        rig.settle();
        assert_eq!(rig.state.current(1), Some(waiting));
    }

    #[test]
    fn test_set_priority_of_remote_running_task_reports_core() {
        let mut rig = Rig::new(bare(2));
        rig.spawn(0, 3, Affinity::Core(0));
        let b = rig.spawn(1, 3, Affinity::Core(1));
        rig.start(0);
        rig.start(1);

        let (old, remote) = rig.state.set_priority(0, b, 6, &rig.port);
        assert_eq!((old, remote), (3, Some(1)));
        assert_eq!(rig.state.cur_mask(1), 1 << 6);
        assert_eq!(rig.state.run_queue().last(), Some(&RunQEntry { core: 1, priority: 6 }));
    }

    #[test]
    fn test_inactive_task_is_parked() {
        let mut rig = Rig::new(bare(1));
        let a = rig.spawn(0, -1, Affinity::Core(0));
        assert_eq!(rig.state.mode(a), TaskMode::Inactive);
        assert_eq!(rig.state.cur_set(Affinity::Core(0)), 0);

        rig.state.set_priority(0, a, 2, &rig.port);
        assert_eq!(rig.state.mode(a), TaskMode::Ready);
        assert_eq!(rig.state.cur_set(Affinity::Core(0)), 1 << 2);
    }

    #[test]
    fn test_terminate_releases_vital_count() {
        let mut rig = Rig::new(bare(1).with_terminated_reclaim(true));
        let params = TaskParams::new(2).with_affinity(Affinity::Core(0));
        let hooks = TraceHooks::new();
        let v = rig.state.create(body, params, false, &rig.port, &hooks).unwrap();
        rig.state.admit(0, v, &rig.port, &hooks);
        assert_eq!(rig.state.vital_tasks(), 1);
        rig.start(0);

        rig.state.terminate(0, v, &rig.port, &hooks);
        assert_eq!(rig.state.vital_tasks(), 0);
        assert_eq!(hooks.exit_status(), Some(0));
        assert_eq!(rig.state.terminated_tasks(), vec![v]);
        assert_eq!(rig.schedule(0), Outcome::Idle);
        assert_eq!(rig.state.mode(v), TaskMode::Terminated);
    }

    #[test]
    #[should_panic(expected = "scheduler state check failed")]
    fn test_module_state_check_trips() {
        let mut rig = Rig::new(bare(1).with_integrity_checks(true));
        let _ = rig.state.disable(&rig.hooks);
        rig.state.state_check ^= 1;
        let _ = rig.state.disable(&rig.hooks);
    }

    #[test]
    #[should_panic(expected = "task object check failed")]
    fn test_object_check_trips() {
        let mut rig = Rig::new(bare(1).with_integrity_checks(true));
        let a = rig.spawn(0, 2, Affinity::Core(0));
        rig.state.tasks.get_mut(a).unwrap().arg1 = 0xdead;
        rig.start(0);
    }

    #[test]
    #[should_panic(expected = "invalid task priority")]
    fn test_priority_zero_reserved_for_idle() {
        let mut rig = Rig::new(KernelConfig::new(1));
        rig.spawn(0, 0, Affinity::Core(0));
    }
}
