//! # Simulation Port
//!
//! A hosted [`Port`] with no real cores behind it. Inter-core interrupts
//! are queued instead of delivered, context switches are recorded instead
//! of performed, and task bodies never run. Tests drive the kernel by
//! calling its API on behalf of a core, then [`settle`](Kernel::settle) it
//! to deliver the queued interrupts.
//!
//! [`TraceHooks`] records every hook call for the same purpose.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::error::KernelError;
use crate::hooks::SchedulerHooks;
use crate::kernel::Kernel;
use crate::port::{Context, IdleAction, IrqKey, Port, WaitAction};
use crate::task::{CoreId, TaskFn, TaskId};

/// Bytes of initial frame [`SimPort`] reserves at the top of each stack.
pub const DEFAULT_FRAME_SIZE: usize = 64;

/// One recorded context switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub core: CoreId,
    pub from: Option<TaskId>,
    pub to: TaskId,
}

struct SimState {
    pending: VecDeque<CoreId>,
    sent: Vec<CoreId>,
    switches: Vec<Switch>,
    idle_retries: usize,
    idle_calls: usize,
    frame_size: usize,
}

pub struct SimPort {
    inner: Mutex<SimState>,
    masked: AtomicBool,
}

impl SimPort {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimState {
                pending: VecDeque::new(),
                sent: Vec::new(),
                switches: Vec::new(),
                idle_retries: 0,
                idle_calls: 0,
                frame_size: DEFAULT_FRAME_SIZE,
            }),
            masked: AtomicBool::new(false),
        }
    }

    pub fn with_frame_size(self, frame_size: usize) -> Self {
        self.inner.lock().frame_size = frame_size;
        self
    }

    /// Answer the first `retries` idle calls with [`IdleAction::Retry`],
    /// later ones with [`IdleAction::Park`].
    pub fn with_idle_retries(self, retries: usize) -> Self {
        self.inner.lock().idle_retries = retries;
        self
    }

    /// Oldest undelivered inter-core interrupt.
    pub fn take_interrupt(&self) -> Option<CoreId> {
        self.inner.lock().pending.pop_front()
    }

    /// Every interrupt raised since the last [`clear`](Self::clear), in order.
    pub fn interrupts_sent(&self) -> Vec<CoreId> {
        self.inner.lock().sent.clone()
    }

    /// Switches performed on `core`, as the sequence of incoming tasks.
    pub fn switches_on(&self, core: CoreId) -> Vec<TaskId> {
        self.inner
            .lock()
            .switches
            .iter()
            .filter(|s| s.core == core)
            .map(|s| s.to)
            .collect()
    }

    pub fn idle_calls(&self) -> usize {
        self.inner.lock().idle_calls
    }

    /// Forget recorded interrupts and switches. Pending interrupts stay.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.sent.clear();
        inner.switches.clear();
        inner.idle_calls = 0;
    }

    pub fn interrupts_masked(&self) -> bool {
        self.masked.load(Ordering::Acquire)
    }
}

impl Default for SimPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for SimPort {
    fn disable_interrupts(&self) -> IrqKey {
        IrqKey(self.masked.swap(true, Ordering::AcqRel) as usize)
    }

    fn restore_interrupts(&self, key: IrqKey) {
        self.masked.store(key.0 != 0, Ordering::Release);
    }

    fn interrupt_core(&self, core: CoreId) {
        let mut inner = self.inner.lock();
        inner.pending.push_back(core);
        inner.sent.push(core);
    }

    fn init_context(
        &self,
        _task: TaskId,
        _entry: TaskFn,
        args: (usize, usize),
        stack: &mut [u8],
    ) -> Result<Context, KernelError> {
        let frame_size = self.inner.lock().frame_size;
        if frame_size > stack.len() {
            return Err(KernelError::ContextInit);
        }
        let top = stack.len();
        let frame = &mut stack[top - frame_size..];
        frame.fill(0);

        // Arguments at the bottom of the frame, where a register dump
        // would put them.
        let words = [args.0, args.1];
        let bytes: &[u8] = bytemuck::cast_slice(&words);
        if frame_size >= bytes.len() {
            frame[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(Context {
            sp: stack.as_ptr() as usize + top - frame_size,
        })
    }

    fn swap(&self, core: CoreId, from: Option<(TaskId, &mut Context)>, to: (TaskId, Context)) {
        self.inner.lock().switches.push(Switch {
            core,
            from: from.map(|(id, _)| id),
            to: to.0,
        });
    }

    fn idle(&self, _core: CoreId) -> IdleAction {
        let mut inner = self.inner.lock();
        inner.idle_calls += 1;
        if inner.idle_retries > 0 {
            inner.idle_retries -= 1;
            IdleAction::Retry
        } else {
            IdleAction::Park
        }
    }

    fn rendezvous(&self, core: CoreId) -> WaitAction {
        // The kernel is about to service `core` inline.
        self.inner.lock().pending.retain(|c| *c != core);
        WaitAction::Service
    }
}

impl<H: SchedulerHooks> Kernel<SimPort, H> {
    /// Deliver queued inter-core interrupts until none are left.
    pub fn settle(&self) {
        while let Some(core) = self.port().take_interrupt() {
            self.handle_interrupt(core);
        }
    }
}

// ---------------------------------------------------------------------------
// Recording hooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Create(TaskId),
    Delete(TaskId),
    Switch {
        core: CoreId,
        prev: Option<TaskId>,
        next: TaskId,
    },
    Ready(TaskId),
    Exit(TaskId),
    AllBlocked(CoreId),
    SystemExit(i32),
}

/// Hooks that record every call.
#[derive(Default)]
pub struct TraceHooks {
    events: Mutex<Vec<HookEvent>>,
    reject_create: AtomicBool,
}

impl TraceHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following create hook fail.
    pub fn reject_creates(&self, reject: bool) {
        self.reject_create.store(reject, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Status passed to the last system-exit call.
    pub fn exit_status(&self) -> Option<i32> {
        self.events.lock().iter().rev().find_map(|event| match event {
            HookEvent::SystemExit(status) => Some(*status),
            _ => None,
        })
    }

    fn record(&self, event: HookEvent) {
        self.events.lock().push(event);
    }
}

impl SchedulerHooks for TraceHooks {
    fn on_create(&self, task: TaskId) -> Result<(), KernelError> {
        if self.reject_create.load(Ordering::Relaxed) {
            return Err(KernelError::CreateHook);
        }
        self.record(HookEvent::Create(task));
        Ok(())
    }

    fn on_delete(&self, task: TaskId) {
        self.record(HookEvent::Delete(task));
    }

    fn on_switch(&self, core: CoreId, prev: Option<TaskId>, next: TaskId) {
        self.record(HookEvent::Switch { core, prev, next });
    }

    fn on_ready(&self, task: TaskId) {
        self.record(HookEvent::Ready(task));
    }

    fn on_exit(&self, task: TaskId) {
        self.record(HookEvent::Exit(task));
    }

    fn all_blocked(&self, core: CoreId) {
        self.record(HookEvent::AllBlocked(core));
    }

    fn system_exit(&self, status: i32) {
        log::info!("system exit {}", status);
        self.record(HookEvent::SystemExit(status));
    }
}
