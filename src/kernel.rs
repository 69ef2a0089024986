//! # Kernel
//!
//! Public API of the scheduler. A [`Kernel`] owns the scheduling state
//! behind one lock, the platform [`Port`] and the application's
//! [`SchedulerHooks`].
//!
//! Every operation names the core it is called from. The kernel does not
//! discover its caller: on a single-core port that is always `0`, on SMP the
//! port's per-core entry points pass their own id.
//!
//! ## Startup Sequence
//!
//! ```text
//! Kernel::new()              ← validate config, build idle tasks
//!   ├─► create_task() (×N)   ← queued, nothing dispatched yet
//!   └─► start_core(c) (×cores)
//!         ├─► dispatch the best task for c
//!         └─► unlock the scheduler
//! ```
//!
//! ## Scheduler lock
//!
//! [`disable`](Kernel::disable) / [`restore`](Kernel::restore) defer
//! rescheduling without masking interrupts. While disabled, readiness
//! changes only raise work flags; the restore that re-enables the
//! scheduler runs the calling core's scheduler if its flag is set.
//!
//! ## Waiting on another core
//!
//! Changing the priority or affinity of a task that runs on another core
//! must not return before that core has rescheduled. The caller drops the
//! lock and waits for the remote work flag to clear, servicing the remote
//! core itself if the port says nobody else will
//! ([`WaitAction::Service`]).

use spin::Mutex;

use crate::clock::Clock;
use crate::config::{KernelConfig, IDLE_PRIORITY, NO_WAIT, WAIT_FOREVER};
use crate::error::KernelError;
use crate::hooks::{NoHooks, SchedulerHooks};
use crate::port::{IdleAction, Port, WaitAction};
use crate::scheduler::{AffinityChange, Outcome, SchedulerKey, SchedulerState};
use crate::sync::Critical;
use crate::task::{Affinity, CoreId, TaskFn, TaskId, TaskMode, TaskParams, TaskStat};

pub(crate) struct Inner {
    pub(crate) sched: SchedulerState,
    pub(crate) clock: Clock,
}

type Guard<'a, P> = Critical<'a, Inner, P>;

/// Body of the per-core idle tasks. Idle-time work such as freeing
/// terminated tasks is driven from [`Kernel::tick`], so the body only
/// waits.
fn idle_loop(_: usize, _: usize) {
    loop {
        core::hint::spin_loop();
    }
}

pub struct Kernel<P: Port, H: SchedulerHooks = NoHooks> {
    state: Mutex<Inner>,
    port: P,
    hooks: H,
    config: KernelConfig,
}

impl<P: Port, H: SchedulerHooks> Kernel<P, H> {
    /// Build a kernel and, if configured, one idle task per core.
    ///
    /// The scheduler starts disabled: tasks may be created, but none runs
    /// until [`start_core`](Self::start_core).
    pub fn new(config: KernelConfig, port: P, hooks: H) -> Result<Self, KernelError> {
        config.validate()?;
        let align = port.stack_alignment();
        if !align.is_power_of_two() || align > 8 {
            return Err(KernelError::InvalidConfig);
        }

        let kernel = Self {
            state: Mutex::new(Inner {
                sched: SchedulerState::new(config),
                clock: Clock::new(),
            }),
            port,
            hooks,
            config,
        };

        if config.idle_tasks {
            for core in 0..config.num_cores {
                let params = TaskParams::new(IDLE_PRIORITY)
                    .with_name("idle")
                    .with_affinity(Affinity::Core(core))
                    .vital(false);
                let mut cs = kernel.enter();
                let id = cs
                    .sched
                    .create(idle_loop, params, true, &kernel.port, &kernel.hooks)?;
                cs.sched.admit(core, id, &kernel.port, &kernel.hooks);
                cs.sched.set_idle_task(core, id);
            }
        }

        log::info!(
            "kernel: {} cores, {} priorities, {} task slots",
            config.num_cores,
            config.num_priorities,
            config.max_tasks
        );
        Ok(kernel)
    }

    #[inline]
    fn enter(&self) -> Guard<'_, P> {
        Critical::enter(&self.state, &self.port)
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Run `f` on a consistent view of the scheduling state.
    pub fn inspect<R>(&self, f: impl FnOnce(&SchedulerState) -> R) -> R {
        let cs = self.enter();
        f(&cs.sched)
    }

    // -----------------------------------------------------------------------
    // Scheduling plumbing
    // -----------------------------------------------------------------------

    /// Release a scheduler key taken with `disable`: if it re-enables the
    /// scheduler, run `core`'s scheduler when flagged and unlock.
    fn finish<'a>(&'a self, core: CoreId, mut cs: Guard<'a, P>, key: SchedulerKey) {
        if key.was_locked() {
            return;
        }
        if cs.sched.needs_schedule(core) {
            cs = self.reschedule(core, cs);
        }
        cs.sched.unlock();
    }

    /// Schedule `core` until it has a task or the port parks it.
    fn reschedule<'a>(&'a self, core: CoreId, mut cs: Guard<'a, P>) -> Guard<'a, P> {
        loop {
            if cs.sched.schedule(core, &self.port, &self.hooks) == Outcome::Busy {
                return cs;
            }
            cs.sched.unlock();
            drop(cs);

            if self.config.delete_terminated_tasks {
                self.delete_terminated_tasks();
            }
            self.hooks.all_blocked(core);
            let action = self.port.idle(core);

            cs = self.enter();
            cs.sched.relock();
            if action == IdleAction::Park {
                log::trace!("core {}: parked", core);
                return cs;
            }
        }
    }

    /// Wait until `remote` has cleared its work flag.
    fn rendezvous<'a>(&'a self, mut cs: Guard<'a, P>, remote: CoreId) -> Guard<'a, P> {
        while cs.sched.work_pending(remote) {
            cs.sched.unlock();
            drop(cs);
            match self.port.rendezvous(remote) {
                WaitAction::Spin => core::hint::spin_loop(),
                WaitAction::Service => self.handle_interrupt(remote),
            }
            cs = self.enter();
            cs.sched.relock();
        }
        cs
    }

    fn running(cs: &Guard<'_, P>, core: CoreId) -> TaskId {
        match cs.sched.current(core) {
            Some(task) => task,
            None => panic!("no task running on core {}", core),
        }
    }

    /// Dispatch the first task on `core` and enable the scheduler.
    pub fn start_core(&self, core: CoreId) {
        assert!(core < self.config.num_cores, "no core {}", core);
        let mut cs = self.enter();
        if !cs.sched.start_core(core, &self.port, &self.hooks) {
            log::debug!("core {}: nothing ready at start", core);
        }
        cs = self.reschedule(core, cs);
        cs.sched.unlock();
    }

    /// Inter-core interrupt handler: reschedule `core` if it was asked to.
    pub fn handle_interrupt(&self, core: CoreId) {
        let mut cs = self.enter();
        let key = cs.sched.disable(&self.hooks);
        self.finish(core, cs, key);
    }

    // -----------------------------------------------------------------------
    // Scheduler lock
    // -----------------------------------------------------------------------

    /// Defer rescheduling. Returns the previous state for
    /// [`restore`](Self::restore).
    pub fn disable(&self) -> SchedulerKey {
        let mut cs = self.enter();
        cs.sched.disable(&self.hooks)
    }

    pub fn restore(&self, core: CoreId, key: SchedulerKey) {
        let cs = self.enter();
        self.finish(core, cs, key);
    }

    /// Unconditionally re-enable the scheduler.
    pub fn enable(&self, core: CoreId) {
        self.restore(core, SchedulerKey::UNLOCKED);
    }

    pub fn is_enabled(&self) -> bool {
        !self.enter().sched.is_locked()
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Create a task. Unless its priority is `-1` it becomes ready at once
    /// and may preempt the caller.
    pub fn create_task(
        &self,
        core: CoreId,
        entry: TaskFn,
        params: TaskParams,
    ) -> Result<TaskId, KernelError> {
        let name = params.name;
        let mut cs = self.enter();
        let id = match cs.sched.create(entry, params, false, &self.port, &self.hooks) {
            Ok(id) => id,
            Err(err) => {
                log::warn!("create '{}' failed: {}", name, err);
                return Err(err);
            }
        };
        let key = cs.sched.disable(&self.hooks);
        cs.sched.admit(core, id, &self.port, &self.hooks);
        self.finish(core, cs, key);
        Ok(id)
    }

    /// Delete a task that is not running. Its handle goes stale.
    pub fn delete_task(&self, task: TaskId) {
        let mut cs = self.enter();
        Self::remove(&self.hooks, &mut cs, task, false);
    }

    fn remove(hooks: &H, cs: &mut Guard<'_, P>, task: TaskId, reclaim: bool) {
        if let Some(timer) = cs.sched.take_sleep_timer(task) {
            cs.clock.cancel(timer);
        }
        cs.sched.delete(task, reclaim, hooks);
    }

    /// Free every task that exited while terminated-task reclamation is
    /// enabled. Returns how many were freed.
    pub fn delete_terminated_tasks(&self) -> usize {
        let mut cs = self.enter();
        let mut freed = 0;
        while let Some(task) = cs.sched.next_terminated() {
            Self::remove(&self.hooks, &mut cs, task, true);
            freed += 1;
        }
        freed
    }

    /// End the task running on `core`.
    pub fn exit(&self, core: CoreId) {
        let task = Self::running(&self.enter(), core);
        self.hooks.on_exit(task);

        let mut cs = self.enter();
        let key = cs.sched.disable(&self.hooks);
        cs.sched.terminate(core, task, &self.port, &self.hooks);
        self.finish(core, cs, key);
    }

    // -----------------------------------------------------------------------
    // Blocking and time
    // -----------------------------------------------------------------------

    /// Block the task running on `core` for `timeout` ticks.
    pub fn sleep(&self, core: CoreId, timeout: u32) {
        if timeout == NO_WAIT {
            return;
        }
        assert!(timeout != WAIT_FOREVER, "sleep without a timeout");
        let cs = self.enter();
        self.sleep_locked(core, cs, timeout);
    }

    /// Block the task running on `core` until the tick count reaches
    /// `deadline`. The distance wraps with the tick counter, so a deadline
    /// just behind `now` sleeps almost a full counter period.
    pub fn sleep_until(&self, core: CoreId, deadline: u32) {
        let cs = self.enter();
        let timeout = deadline.wrapping_sub(cs.clock.ticks());
        if timeout == NO_WAIT {
            return;
        }
        self.sleep_locked(core, cs, timeout);
    }

    fn sleep_locked<'a>(&'a self, core: CoreId, mut cs: Guard<'a, P>, timeout: u32) {
        assert!(!cs.sched.is_locked(), "sleep with the scheduler disabled");
        let task = Self::running(&cs, core);
        assert!(
            cs.sched.idle_task(core) != Some(task),
            "idle task cannot sleep"
        );

        let key = cs.sched.disable(&self.hooks);
        cs.sched.block_task(core, task, &self.port, &self.hooks);
        let timer = cs.clock.register(task, timeout);
        cs.sched.set_sleep_timer(task, Some(timer));
        log::trace!("{} sleeps {} ticks", task, timeout);
        self.finish(core, cs, key);
    }

    /// System tick, called from `core`'s timer interrupt.
    ///
    /// A tick that finds the core's idle task running also frees tasks
    /// that exited, when terminated-task reclamation is enabled.
    pub fn tick(&self, core: CoreId) {
        let mut cs = self.enter();
        let key = cs.sched.disable(&self.hooks);
        let Inner { sched, clock } = &mut *cs;
        clock.advance(|task, timer| {
            sched.sleep_expired(core, task, timer, &self.port, &self.hooks)
        });
        self.finish(core, cs, key);

        if self.config.delete_terminated_tasks && self.is_idling(core) {
            let freed = self.delete_terminated_tasks();
            if freed > 0 {
                log::debug!("core {}: reclaimed {} tasks", core, freed);
            }
        }
    }

    /// `core` runs its idle task with the scheduler enabled.
    fn is_idling(&self, core: CoreId) -> bool {
        let cs = self.enter();
        !cs.sched.is_locked()
            && cs.sched.idle_task(core).is_some()
            && cs.sched.current(core) == cs.sched.idle_task(core)
    }

    pub fn ticks(&self) -> u32 {
        self.enter().clock.ticks()
    }

    /// Give the rest of the time slice to the next ready task of equal
    /// priority.
    pub fn yield_task(&self, core: CoreId) {
        let mut cs = self.enter();
        let key = cs.sched.disable(&self.hooks);
        cs.sched.yield_core(core);
        self.finish(core, cs, key);
    }

    /// Block `task`, running or not. Whatever made it wait is the caller's
    /// business; [`unblock`](Self::unblock) releases it.
    pub fn block(&self, core: CoreId, task: TaskId) {
        let mut cs = self.enter();
        let key = cs.sched.disable(&self.hooks);
        cs.sched.block(core, task, &self.port, &self.hooks);
        self.finish(core, cs, key);
    }

    /// Make a blocked task ready again, cancelling any sleep it is in.
    pub fn unblock(&self, core: CoreId, task: TaskId) {
        let mut cs = self.enter();
        assert!(
            cs.sched.is_blocked(task),
            "unblock of a task that is not blocked"
        );
        let key = cs.sched.disable(&self.hooks);
        if let Some(timer) = cs.sched.take_sleep_timer(task) {
            cs.clock.cancel(timer);
        }
        cs.sched.unblock_task(core, task, &self.port, &self.hooks);
        self.finish(core, cs, key);
    }

    // -----------------------------------------------------------------------
    // Priority and affinity
    // -----------------------------------------------------------------------

    /// Set the priority of `task` and return the old one. `-1` makes it
    /// inactive. Returns only once the change has taken effect on whatever
    /// core runs the task.
    pub fn set_priority(&self, core: CoreId, task: TaskId, priority: i32) -> i32 {
        let mut cs = self.enter();
        let key = cs.sched.disable(&self.hooks);
        let (old, remote) = cs.sched.set_priority(core, task, priority, &self.port);
        if let Some(remote) = remote {
            cs = self.rendezvous(cs, remote);
        }
        self.finish(core, cs, key);
        old
    }

    /// Set the affinity of `task` and return the old one. A task running on
    /// another core is pulled off it before it moves.
    pub fn set_affinity(&self, core: CoreId, task: TaskId, affinity: Affinity) -> Affinity {
        let mut cs = self.enter();
        let key = cs.sched.disable(&self.hooks);
        let old = match cs
            .sched
            .set_affinity(core, task, affinity, &self.port, &self.hooks)
        {
            AffinityChange::Done(old) => old,
            AffinityChange::Migrate { old, remote } => {
                cs = self.rendezvous(cs, remote);
                cs.sched
                    .finish_migration(core, task, affinity, &self.port, &self.hooks);
                old
            }
        };
        self.finish(core, cs, key);
        old
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Task running on `core`, `None` while the core idles without an idle
    /// task or has not started.
    pub fn self_task(&self, core: CoreId) -> Option<TaskId> {
        self.enter().sched.current(core)
    }

    pub fn idle_task(&self, core: CoreId) -> Option<TaskId> {
        self.enter().sched.idle_task(core)
    }

    pub fn priority(&self, task: TaskId) -> i32 {
        self.enter().sched.priority(task)
    }

    pub fn affinity(&self, task: TaskId) -> Affinity {
        self.enter().sched.affinity(task)
    }

    pub fn mode(&self, task: TaskId) -> TaskMode {
        self.enter().sched.mode(task)
    }

    pub fn stat(&self, task: TaskId) -> TaskStat {
        self.enter().sched.stat(task)
    }

    pub fn name(&self, task: TaskId) -> &'static str {
        self.enter().sched.name(task)
    }

    pub fn entry(&self, task: TaskId) -> TaskFn {
        self.enter().sched.entry(task)
    }

    pub fn args(&self, task: TaskId) -> (usize, usize) {
        self.enter().sched.args(task)
    }

    pub fn set_args(&self, task: TaskId, arg0: usize, arg1: usize) {
        self.enter().sched.set_args(task, arg0, arg1);
    }

    pub fn env(&self, task: TaskId) -> usize {
        self.enter().sched.env(task)
    }

    pub fn set_env(&self, task: TaskId, env: usize) {
        self.enter().sched.set_env(task, env);
    }

    /// Per-task word reserved for the hooks implementation.
    pub fn hook_context(&self, task: TaskId) -> usize {
        self.enter().sched.hook_context(task)
    }

    pub fn set_hook_context(&self, task: TaskId, context: usize) {
        self.enter().sched.set_hook_context(task, context);
    }

    pub fn vital_tasks(&self) -> usize {
        self.enter().sched.vital_tasks()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::top_bit;
    use crate::sim::{HookEvent, SimPort, TraceHooks};
    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec;

    type TestKernel = Kernel<SimPort, TraceHooks>;

    fn body(_: usize, _: usize) {}

    fn kernel(config: KernelConfig) -> TestKernel {
        Kernel::new(config, SimPort::new(), TraceHooks::new()).unwrap()
    }

    fn started(cores: usize) -> TestKernel {
        let k = kernel(KernelConfig::new(cores));
        for core in 0..cores {
            k.start_core(core);
        }
        k.settle();
        k
    }

    fn spawn(k: &TestKernel, core: CoreId, priority: i32, affinity: Affinity) -> TaskId {
        let params = TaskParams::new(priority)
            .with_affinity(affinity)
            .with_stack_size(512);
        let id = k.create_task(core, body, params).unwrap();
        k.settle();
        id
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    #[test]
    fn test_new_rejects_bad_config() {
        let err = Kernel::new(KernelConfig::new(0), SimPort::new(), NoHooks).err();
        assert_eq!(err, Some(KernelError::InvalidConfig));
    }

    #[test]
    fn test_scheduler_disabled_until_start() {
        let k = kernel(KernelConfig::new(1));
        assert!(!k.is_enabled());
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        assert_eq!(k.self_task(0), None);
        assert_eq!(k.mode(a), TaskMode::Ready);

        k.start_core(0);
        assert!(k.is_enabled());
        assert_eq!(k.self_task(0), Some(a));
    }

    #[test]
    fn test_idle_tasks_run_when_nothing_ready() {
        let k = started(2);
        for core in 0..2 {
            let idle = k.idle_task(core).unwrap();
            assert_eq!(k.self_task(core), Some(idle));
            assert_eq!(k.priority(idle), IDLE_PRIORITY);
            assert_eq!(k.affinity(idle), Affinity::Core(core));
            assert_eq!(k.name(idle), "idle");
        }
        assert_eq!(k.vital_tasks(), 0);
    }

    #[test]
    fn test_core_without_idle_task_parks() {
        let k = kernel(KernelConfig::new(1).with_idle_tasks(false));
        k.start_core(0);
        assert_eq!(k.self_task(0), None);
        assert_eq!(k.port().idle_calls(), 1);
        assert!(k.hooks().events().contains(&HookEvent::AllBlocked(0)));
        assert!(k.is_enabled());

        let a = spawn(&k, 0, 2, Affinity::Any);
        assert_eq!(k.self_task(0), Some(a));
    }

    // -----------------------------------------------------------------------
    // Single core
    // -----------------------------------------------------------------------


    #[test]
    fn test_idle_retry_runs_all_blocked_path_again() {
        let port = SimPort::new().with_idle_retries(2);
        let config = KernelConfig::new(1).with_idle_tasks(false);
        let k = Kernel::new(config, port, TraceHooks::new()).unwrap();
        k.start_core(0);

        assert_eq!(k.port().idle_calls(), 3);
        let passes = k
            .hooks()
            .events()
            .iter()
            .filter(|e| **e == HookEvent::AllBlocked(0))
            .count();
        assert_eq!(passes, 3);
        assert_eq!(k.self_task(0), None);
        assert!(k.is_enabled());
    }

    #[test]
    fn test_higher_priority_create_preempts() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        assert_eq!(k.self_task(0), Some(a));
        let b = spawn(&k, 0, 5, Affinity::Core(0));
        assert_eq!(k.self_task(0), Some(b));
        assert_eq!(k.mode(a), TaskMode::Ready);

        let c = spawn(&k, 0, 4, Affinity::Core(0));
        assert_eq!(k.self_task(0), Some(b));
        assert_eq!(k.mode(c), TaskMode::Ready);
    }

    #[test]
    fn test_sleep_and_tick() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));

        k.sleep(0, 2);
        assert_eq!(k.mode(a), TaskMode::Blocked);
        assert_eq!(k.self_task(0), k.idle_task(0));

        k.tick(0);
        assert_eq!(k.mode(a), TaskMode::Blocked);
        k.tick(0);
        assert_eq!(k.mode(a), TaskMode::Running);
        assert_eq!(k.ticks(), 2);
    }


    #[test]
    fn test_woken_sleeper_preempts_lower_task() {
        let k = kernel(KernelConfig::new(1));
        let a = spawn(&k, 0, 5, Affinity::Core(0));
        let b = spawn(&k, 0, 3, Affinity::Core(0));
        k.start_core(0);
        assert_eq!(k.self_task(0), Some(a));
        assert_eq!(k.mode(b), TaskMode::Ready);

        k.sleep(0, 10);
        assert_eq!(k.self_task(0), Some(b));
        for _ in 0..9 {
            k.tick(0);
        }
        assert_eq!(k.mode(a), TaskMode::Blocked);
        assert_eq!(k.self_task(0), Some(b));

        k.tick(0);
        assert_eq!(k.self_task(0), Some(a));
        assert_eq!(k.mode(b), TaskMode::Ready);
        k.inspect(|s| assert_eq!(s.ready_tasks(Affinity::Core(0), 3), vec![b]));
        assert_eq!(k.port().switches_on(0), vec![a, b, a]);
    }

    #[test]
    fn test_sleep_zero_is_noop() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        k.sleep(0, NO_WAIT);
        assert_eq!(k.self_task(0), Some(a));
    }

    #[test]
    fn test_sleep_until() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        k.tick(0);

        // Deadline is now.
        k.sleep_until(0, 1);
        assert_eq!(k.self_task(0), Some(a));

        k.sleep_until(0, 4);
        assert_eq!(k.mode(a), TaskMode::Blocked);
        k.tick(0);
        k.tick(0);
        assert_eq!(k.mode(a), TaskMode::Blocked);
        k.tick(0);
        assert_eq!(k.self_task(0), Some(a));
    }

    #[test]
    fn test_sleep_until_wraps() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        k.tick(0);
        k.tick(0);

        // Tick 0 is behind: the wait runs to the next wrap.
        k.sleep_until(0, 0);
        assert_eq!(k.mode(a), TaskMode::Blocked);
        for _ in 0..8 {
            k.tick(0);
        }
        assert_eq!(k.mode(a), TaskMode::Blocked);
        k.unblock(0, a);
        assert_eq!(k.self_task(0), Some(a));
    }

    #[test]
    fn test_unblock_cancels_sleep() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        k.sleep(0, 5);
        k.unblock(0, a);
        assert_eq!(k.self_task(0), Some(a));
        for _ in 0..5 {
            k.tick(0);
        }
        assert_eq!(k.self_task(0), Some(a));
        k.inspect(|s| assert!(s.ready_tasks(Affinity::Core(0), 3).is_empty()));
    }


    #[test]
    fn test_unblock_before_remote_core_reschedules() {
        let k = started(2);
        let a = spawn(&k, 1, 3, Affinity::Core(1));
        assert_eq!(k.self_task(1), Some(a));

        // Core 1 has not taken its interrupt yet.
        k.block(0, a);
        assert_eq!(k.mode(a), TaskMode::Blocked);
        k.unblock(0, a);

        k.settle();
        assert_eq!(k.self_task(1), Some(a));
        assert_eq!(k.mode(a), TaskMode::Running);
        k.inspect(check_invariants);
    }

    #[test]
    fn test_unblock_task_deactivated_while_blocked() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        k.block(0, a);
        assert_eq!(k.set_priority(0, a, -1), 3);
        assert_eq!(k.mode(a), TaskMode::Blocked);

        k.unblock(0, a);
        assert_eq!(k.mode(a), TaskMode::Inactive);
        assert_eq!(k.self_task(0), k.idle_task(0));
        k.inspect(|s| assert_eq!(s.cur_set(Affinity::Core(0)), 0));

        k.set_priority(0, a, 4);
        assert_eq!(k.self_task(0), Some(a));
    }

    #[test]
    #[should_panic(expected = "sleep with the scheduler disabled")]
    fn test_sleep_while_disabled_panics() {
        let k = started(1);
        spawn(&k, 0, 3, Affinity::Core(0));
        let _key = k.disable();
        k.sleep(0, 1);
    }

    #[test]
    fn test_yield_round_robin() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        let b = spawn(&k, 0, 3, Affinity::Core(0));
        k.port().clear();

        k.yield_task(0);
        assert_eq!(k.self_task(0), Some(b));
        k.yield_task(0);
        assert_eq!(k.self_task(0), Some(a));
        k.yield_task(0);
        assert_eq!(k.port().switches_on(0), vec![b, a, b]);
    }

    #[test]
    fn test_disable_defers_preemption() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));

        let key = k.disable();
        assert!(!key.was_locked());
        assert!(!k.is_enabled());
        let b = spawn(&k, 0, 6, Affinity::Core(0));
        assert_eq!(k.self_task(0), Some(a));

        // Nested disable leaves the scheduler locked on restore.
        let inner = k.disable();
        assert!(inner.was_locked());
        k.restore(0, inner);
        assert_eq!(k.self_task(0), Some(a));

        k.restore(0, key);
        assert!(k.is_enabled());
        assert_eq!(k.self_task(0), Some(b));
    }

    #[test]
    fn test_block_and_unblock() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        let b = spawn(&k, 0, 2, Affinity::Core(0));

        // Blocking a ready task takes it off its queue.
        k.block(0, b);
        assert_eq!(k.mode(b), TaskMode::Blocked);
        k.block(0, a);
        assert_eq!(k.self_task(0), k.idle_task(0));

        k.unblock(0, b);
        assert_eq!(k.self_task(0), Some(b));
        k.unblock(0, a);
        assert_eq!(k.self_task(0), Some(a));
    }

    #[test]
    fn test_inactive_round_trip() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        assert_eq!(k.set_priority(0, a, -1), 3);
        assert_eq!(k.mode(a), TaskMode::Inactive);
        assert_eq!(k.self_task(0), k.idle_task(0));

        assert_eq!(k.set_priority(0, a, 4), -1);
        assert_eq!(k.self_task(0), Some(a));
        assert_eq!(k.stat(a).priority, 4);
    }

    #[test]
    fn test_create_inactive() {
        let k = started(1);
        let a = spawn(&k, 0, -1, Affinity::Core(0));
        assert_eq!(k.mode(a), TaskMode::Inactive);
        assert_eq!(k.self_task(0), k.idle_task(0));
        k.inspect(|s| assert_eq!(s.cur_set(Affinity::Core(0)), 0));
    }

    // -----------------------------------------------------------------------
    // Multi core
    // -----------------------------------------------------------------------

    #[test]
    fn test_dont_care_taken_by_lowest_caller() {
        let k = started(2);
        spawn(&k, 0, 2, Affinity::Core(0));
        spawn(&k, 1, 6, Affinity::Core(1));
        k.port().clear();

        // Core 0 is already the lowest core and takes the task itself.
        let z = k.create_task(0, body, TaskParams::new(9)).unwrap();
        assert_eq!(k.self_task(0), Some(z));
        assert!(k.port().interrupts_sent().is_empty());
    }

    #[test]
    fn test_dont_care_sent_to_lower_core() {
        let k = started(2);
        let x = spawn(&k, 0, 6, Affinity::Core(0));
        let y = spawn(&k, 1, 4, Affinity::Core(1));
        k.port().clear();

        let z = k.create_task(0, body, TaskParams::new(9)).unwrap();
        assert_eq!(k.self_task(0), Some(x));
        assert_eq!(k.port().interrupts_sent(), vec![1]);

        k.settle();
        assert_eq!(k.self_task(1), Some(z));
        assert_eq!(k.self_task(0), Some(x));
        assert_eq!(k.mode(y), TaskMode::Ready);
        assert_eq!(k.port().interrupts_sent(), vec![1]);
    }


    #[test]
    fn test_dont_care_on_equal_cores_taken_by_caller() {
        let k = started(2);
        let x = spawn(&k, 0, 4, Affinity::Core(0));
        let y = spawn(&k, 1, 4, Affinity::Core(1));
        k.port().clear();

        // Both cores run priority 4, so the caller is already a lowest
        // core: it takes the task itself and interrupts nobody.
        let z = k.create_task(0, body, TaskParams::new(9)).unwrap();
        assert!(k.port().interrupts_sent().is_empty());
        k.settle();
        assert_eq!(k.self_task(0), Some(z));
        assert_eq!(k.self_task(1), Some(y));
        assert_eq!(k.mode(x), TaskMode::Ready);
    }

    #[test]
    fn test_unstarted_core_does_not_hold_dont_care_work() {
        let k = kernel(KernelConfig::new(2));
        k.start_core(0);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        let d1 = spawn(&k, 0, 5, Affinity::Any);
        assert_eq!(k.self_task(0), Some(d1));
        assert_eq!(k.mode(a), TaskMode::Ready);

        let d2 = spawn(&k, 0, 5, Affinity::Any);
        assert_eq!(k.mode(d2), TaskMode::Ready);
        assert!(k.port().interrupts_sent().is_empty());

        k.start_core(1);
        k.settle();
        assert_eq!(k.self_task(0), Some(d1));
        assert_eq!(k.self_task(1), Some(d2));
    }

    #[test]
    fn test_unchanged_priority_and_affinity_are_noops() {
        let k = started(2);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        let b = spawn(&k, 0, 3, Affinity::Core(0));
        let c = spawn(&k, 1, 2, Affinity::Any);
        k.port().clear();

        let snapshot = || {
            k.inspect(|s| {
                (
                    s.ready_tasks(Affinity::Core(0), 3),
                    s.run_queue().to_vec(),
                    s.current(0),
                    s.current(1),
                    s.work_flag(),
                )
            })
        };
        let before = snapshot();
        for task in [a, b, c] {
            k.set_priority(0, task, k.priority(task));
            k.set_affinity(0, task, k.affinity(task));
        }
        k.settle();

        assert_eq!(snapshot(), before);
        assert!(k.port().interrupts_sent().is_empty());
        assert!(k.port().switches_on(0).is_empty());
        assert!(k.port().switches_on(1).is_empty());
    }

    #[test]
    fn test_dont_care_spread_over_lowest_cores() {
        let k = started(3);
        let t0 = spawn(&k, 0, 5, Affinity::Core(0));
        spawn(&k, 1, 2, Affinity::Core(1));
        spawn(&k, 2, 3, Affinity::Core(2));

        let d1 = k.create_task(0, body, TaskParams::new(4)).unwrap();
        let d2 = k.create_task(0, body, TaskParams::new(4)).unwrap();
        k.settle();

        assert_eq!(k.self_task(0), Some(t0));
        assert_eq!(k.self_task(1), Some(d1));
        assert_eq!(k.self_task(2), Some(d2));
        k.inspect(|s| {
            let priorities: Vec<i32> = s.run_queue().iter().map(|e| e.priority).collect();
            assert_eq!(priorities, vec![4, 4, 5]);
        });
    }

    #[test]
    fn test_pinned_task_wakes_its_core() {
        let k = started(2);
        k.port().clear();
        let b = k
            .create_task(0, body, TaskParams::new(3).with_affinity(Affinity::Core(1)))
            .unwrap();
        assert_eq!(k.port().interrupts_sent(), vec![1]);
        assert_eq!(k.self_task(0), k.idle_task(0));
        k.settle();
        assert_eq!(k.self_task(1), Some(b));
    }

    #[test]
    fn test_remote_priority_change_waits_for_remote_core() {
        let k = started(2);
        spawn(&k, 0, 3, Affinity::Core(0));
        let b = spawn(&k, 1, 3, Affinity::Core(1));
        let w = spawn(&k, 1, 2, Affinity::Core(1));
        assert_eq!(k.self_task(1), Some(b));

        assert_eq!(k.set_priority(0, b, 1), 3);
        // Core 1 was serviced before set_priority returned.
        assert_eq!(k.self_task(1), Some(w));
        assert_eq!(k.mode(b), TaskMode::Ready);
        assert_eq!(k.port().take_interrupt(), None);
        k.inspect(|s| assert!(!s.work_pending(1)));
    }

    #[test]
    fn test_migrate_running_task_to_caller() {
        let k = started(2);
        let b = spawn(&k, 1, 4, Affinity::Core(1));
        assert_eq!(k.self_task(1), Some(b));

        assert_eq!(k.set_affinity(0, b, Affinity::Core(0)), Affinity::Core(1));
        assert_eq!(k.self_task(0), Some(b));
        assert_eq!(k.self_task(1), k.idle_task(1));
        assert_eq!(k.affinity(b), Affinity::Core(0));
    }

    #[test]
    fn test_move_own_task_to_other_core() {
        let k = started(2);
        let a = spawn(&k, 0, 4, Affinity::Core(0));
        k.port().clear();

        assert_eq!(k.set_affinity(0, a, Affinity::Core(1)), Affinity::Core(0));
        assert_eq!(k.self_task(0), k.idle_task(0));
        assert_eq!(k.port().interrupts_sent(), vec![1]);
        k.settle();
        assert_eq!(k.self_task(1), Some(a));
    }

    #[test]
    fn test_affinity_change_of_ready_task() {
        let k = started(2);
        spawn(&k, 0, 5, Affinity::Core(0));
        let r = spawn(&k, 0, 3, Affinity::Core(0));
        assert_eq!(k.mode(r), TaskMode::Ready);

        assert_eq!(k.set_affinity(0, r, Affinity::Any), Affinity::Core(0));
        k.settle();
        assert_eq!(k.self_task(1), Some(r));
        // Same affinity again changes nothing.
        assert_eq!(k.set_affinity(1, r, Affinity::Any), Affinity::Any);
    }

    // -----------------------------------------------------------------------
    // Exit and delete
    // -----------------------------------------------------------------------

    #[test]
    fn test_last_vital_exit_ends_system() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        assert_eq!(k.vital_tasks(), 1);

        k.exit(0);
        assert_eq!(k.mode(a), TaskMode::Terminated);
        assert_eq!(k.vital_tasks(), 0);
        assert_eq!(k.hooks().exit_status(), Some(0));

        let events = k.hooks().events();
        let exit = events.iter().position(|e| *e == HookEvent::Exit(a));
        let sys = events.iter().position(|e| *e == HookEvent::SystemExit(0));
        assert!(exit < sys);
    }

    #[test]
    fn test_non_vital_exit_keeps_system() {
        let k = started(1);
        spawn(&k, 0, 2, Affinity::Core(0));
        let params = TaskParams::new(3)
            .with_affinity(Affinity::Core(0))
            .vital(false);
        k.create_task(0, body, params).unwrap();
        k.exit(0);
        assert_eq!(k.vital_tasks(), 1);
        assert_eq!(k.hooks().exit_status(), None);
    }

    #[test]
    fn test_terminated_tasks_reclaimed() {
        let k = kernel(KernelConfig::new(1).with_terminated_reclaim(true));
        k.start_core(0);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        let before = k.inspect(|s| s.task_count());

        k.exit(0);
        k.inspect(|s| assert_eq!(s.terminated_tasks(), vec![a]));
        assert_eq!(k.delete_terminated_tasks(), 1);
        k.inspect(|s| {
            assert!(s.terminated_tasks().is_empty());
            assert_eq!(s.task_count(), before - 1);
            assert!(!s.contains(a));
        });
        assert!(k.hooks().events().contains(&HookEvent::Delete(a)));
    }


    #[test]
    fn test_idle_tick_reclaims_terminated_tasks() {
        let k = kernel(KernelConfig::new(1).with_terminated_reclaim(true));
        k.start_core(0);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        let b = spawn(&k, 0, 2, Affinity::Core(0));

        k.exit(0);
        assert_eq!(k.self_task(0), Some(b));
        // Not idle yet: the list waits.
        k.tick(0);
        k.inspect(|s| assert_eq!(s.terminated_tasks(), vec![a]));

        k.exit(0);
        assert_eq!(k.self_task(0), k.idle_task(0));
        k.tick(0);
        k.inspect(|s| {
            assert!(s.terminated_tasks().is_empty());
            assert!(!s.contains(a));
            assert!(!s.contains(b));
        });
    }

    #[test]
    #[should_panic(expected = "delete of terminated task not allowed")]
    fn test_direct_delete_of_reclaimable_task_is_fatal() {
        let k = kernel(KernelConfig::new(1).with_terminated_reclaim(true));
        k.start_core(0);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        k.exit(0);
        k.delete_task(a);
    }

    #[test]
    fn test_delete_sleeping_task() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        k.sleep(0, 3);
        k.delete_task(a);
        assert_eq!(k.vital_tasks(), 0);
        for _ in 0..4 {
            k.tick(0);
        }
        assert_eq!(k.self_task(0), k.idle_task(0));
        k.inspect(|s| assert!(!s.contains(a)));
    }

    #[test]
    #[should_panic(expected = "cannot delete running task")]
    fn test_delete_running_task_panics() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        k.delete_task(a);
    }

    #[test]
    fn test_slot_reuse_after_delete() {
        let k = started(1);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        k.block(0, a);
        k.delete_task(a);
        let b = spawn(&k, 0, 3, Affinity::Core(0));
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(k.self_task(0), Some(b));
    }

    // -----------------------------------------------------------------------
    // Creation failures and task fields
    // -----------------------------------------------------------------------

    #[test]
    fn test_create_hook_rejects() {
        let k = started(1);
        let before = k.inspect(|s| s.task_count());
        k.hooks().reject_creates(true);
        let err = k.create_task(0, body, TaskParams::new(2)).err();
        assert_eq!(err, Some(KernelError::CreateHook));
        assert_eq!(k.inspect(|s| s.task_count()), before);
        assert_eq!(k.vital_tasks(), 0);
    }

    #[test]
    fn test_task_limit() {
        let k = kernel(KernelConfig::new(1).with_max_tasks(3));
        k.start_core(0);
        spawn(&k, 0, 1, Affinity::Any);
        spawn(&k, 0, 1, Affinity::Any);
        let err = k.create_task(0, body, TaskParams::new(1)).err();
        assert_eq!(err, Some(KernelError::TaskLimit));
    }

    #[test]
    fn test_frame_larger_than_stack() {
        let port = SimPort::new().with_frame_size(1024);
        let k = Kernel::new(KernelConfig::new(1).with_idle_tasks(false), port, NoHooks).unwrap();
        let params = TaskParams::new(2).with_stack_size(256);
        assert_eq!(
            k.create_task(0, body, params).err(),
            Some(KernelError::ContextInit)
        );
    }

    #[test]
    fn test_external_stack() {
        let k = started(1);
        let buf: &'static mut [u8] = Box::leak(vec![0u8; 516].into_boxed_slice());
        let (lo, hi) = (buf.as_ptr() as usize, buf.as_ptr() as usize + buf.len());
        let params = TaskParams::new(2)
            .with_affinity(Affinity::Core(0))
            .with_stack(buf);
        let a = k.create_task(0, body, params).unwrap();

        let stat = k.stat(a);
        assert_eq!(stat.stack_base % 8, 0);
        assert!(stat.stack_base >= lo && stat.stack_base + stat.stack_size <= hi);
        assert_eq!(
            stat.sp,
            stat.stack_base + stat.stack_size - crate::sim::DEFAULT_FRAME_SIZE
        );
        assert_eq!(stat.used, crate::sim::DEFAULT_FRAME_SIZE);
        assert_eq!(stat.mode, TaskMode::Running);
    }

    #[test]
    fn test_task_fields() {
        let k = started(1);
        let params = TaskParams::new(2)
            .with_name("worker")
            .with_args(7, 9)
            .with_env(42);
        let a = k.create_task(0, body, params).unwrap();
        assert_eq!(k.name(a), "worker");
        assert_eq!(k.args(a), (7, 9));
        assert_eq!(k.env(a), 42);
        assert_eq!(k.entry(a) as usize, body as usize);

        k.set_args(a, 1, 2);
        k.set_env(a, 3);
        k.set_hook_context(a, 0x55);
        assert_eq!(k.args(a), (1, 2));
        assert_eq!(k.env(a), 3);
        assert_eq!(k.hook_context(a), 0x55);
    }

    #[test]
    fn test_setters_keep_object_check_valid() {
        let k = kernel(KernelConfig::new(1).with_integrity_checks(true));
        k.start_core(0);
        let a = spawn(&k, 0, 3, Affinity::Core(0));
        k.set_args(a, 10, 20);
        k.set_env(a, 30);
        k.block(0, a);
        k.unblock(0, a);
        assert_eq!(k.self_task(0), Some(a));
    }

    #[test]
    #[should_panic(expected = "task stack overflow")]
    fn test_stack_overflow_detected_at_switch() {
        let port = SimPort::new().with_frame_size(128);
        let k = Kernel::new(KernelConfig::new(1), port, TraceHooks::new()).unwrap();
        k.start_core(0);
        let params = TaskParams::new(2).with_stack_size(128);
        k.create_task(0, body, params).unwrap();
    }

    #[test]
    fn test_switch_hooks_report_previous_task() {
        let k = started(1);
        let idle = k.idle_task(0).unwrap();
        k.hooks().clear();
        let a = spawn(&k, 0, 2, Affinity::Core(0));
        assert!(k.hooks().events().contains(&HookEvent::Switch {
            core: 0,
            prev: Some(idle),
            next: a,
        }));
        assert!(k.hooks().events().contains(&HookEvent::Ready(a)));
    }

    // -----------------------------------------------------------------------
    // Randomized operations
    // -----------------------------------------------------------------------

    struct XorShift(u32);

    impl XorShift {
        fn next(&mut self) -> u32 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            x
        }

        fn below(&mut self, n: u32) -> u32 {
            self.next() % n
        }
    }

    fn check_invariants(s: &SchedulerState) {
        let cores = s.num_cores();

        // Ready bits mirror queue contents.
        let mut affinities: Vec<Affinity> = (0..cores).map(Affinity::Core).collect();
        affinities.push(Affinity::Any);
        for affinity in affinities {
            for priority in 0..s.num_priorities() {
                let bit = s.cur_set(affinity) & (1 << priority) != 0;
                assert_eq!(bit, !s.ready_tasks(affinity, priority).is_empty());
            }
        }

        // Run-queue is sorted and matches what each core runs.
        let runq = s.run_queue();
        assert!(runq.windows(2).all(|w| w[0].priority <= w[1].priority));
        let mut lowest = i32::MAX;
        for core in 0..cores {
            let current = s.current(core).expect("idle task always runnable");
            assert_eq!(s.mode(current), TaskMode::Running);
            let priority = s.priority(current);
            let entry = runq.iter().find(|e| e.core == core).unwrap();
            assert_eq!(entry.priority, priority);
            assert_eq!(s.cur_mask(core), 1 << priority);
            assert!(!s.work_pending(core));

            // Nothing pinned here out-ranks the running task.
            assert!(top_bit(s.cur_set(Affinity::Core(core))) as i32 <= priority + 1);
            lowest = lowest.min(priority);
        }

        // Nothing shared out-ranks the lowest core.
        assert!(top_bit(s.cur_set(Affinity::Any)) as i32 <= lowest + 1);
    }

    #[test]
    fn test_random_operations_keep_invariants() {
        const CORES: usize = 3;
        let k = started(CORES);
        let mut rng = XorShift(0x2545_f491);
        let affinity = |rng: &mut XorShift| match rng.below(CORES as u32 + 1) as usize {
            CORES => Affinity::Any,
            core => Affinity::Core(core),
        };

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let core = rng.below(CORES as u32) as usize;
            let params = TaskParams::new(1 + rng.below(7) as i32)
                .with_affinity(affinity(&mut rng))
                .with_stack_size(256)
                .vital(false);
            tasks.push(k.create_task(core, body, params).unwrap());
            k.settle();
            k.inspect(check_invariants);
        }

        for _ in 0..400 {
            let core = rng.below(CORES as u32) as usize;
            let task = tasks[rng.below(tasks.len() as u32) as usize];
            match rng.below(7) {
                0 => {
                    let priority = if rng.below(8) == 0 {
                        -1
                    } else {
                        1 + rng.below(7) as i32
                    };
                    k.set_priority(core, task, priority);
                }
                1 => {
                    k.set_affinity(core, task, affinity(&mut rng));
                }
                2 => k.yield_task(core),
                3 => match k.mode(task) {
                    TaskMode::Blocked => k.unblock(core, task),
                    TaskMode::Ready | TaskMode::Running => k.block(core, task),
                    _ => {}
                },
                4 => {
                    let current = k.self_task(core);
                    if current.is_some() && current != k.idle_task(core) {
                        k.sleep(core, 1 + rng.below(4));
                    }
                }
                _ => k.tick(0),
            }
            k.settle();
            k.inspect(check_invariants);
        }
    }
}
