//! # Platform Port
//!
//! The scheduler decides *what* runs where. A [`Port`] carries those
//! decisions out on a platform: masking interrupts, poking other cores,
//! building a first stack frame, and swapping register context.
//!
//! Two ports ship with the crate:
//!
//! - [`SimPort`](crate::sim::SimPort): hosted, records every interrupt and
//!   switch so scheduling decisions can be checked in tests.
//! - `CortexM4` (feature `cortex-m4`): PendSV/SysTick port for a
//!   single-core Cortex-M4.

use crate::error::KernelError;
use crate::task::{CoreId, TaskFn, TaskId};

/// Saved execution context of a task: the stack pointer at the point it
/// was switched out. Everything else lives on the task's stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub sp: usize,
}

/// Interrupt state returned by [`Port::disable_interrupts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqKey(pub usize);

/// What a core does when nothing is ready for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    /// Interrupts have been serviced; look for work again.
    Retry,
    /// Leave the core idle. Its next inter-core interrupt or local wake-up
    /// runs the scheduler again.
    Park,
}

/// How to wait for a remote core to finish rescheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitAction {
    /// The remote core runs concurrently; spin and look again.
    Spin,
    /// Nobody else will service the remote core: run its inter-core
    /// interrupt handler inline before looking again.
    Service,
}

pub trait Port {
    /// Mask interrupts on the calling core and return the previous state.
    fn disable_interrupts(&self) -> IrqKey;

    /// Restore the state returned by [`disable_interrupts`](Self::disable_interrupts).
    fn restore_interrupts(&self, key: IrqKey);

    /// Raise the scheduler interrupt on `core`. Its handler must end up in
    /// [`Kernel::handle_interrupt`](crate::kernel::Kernel::handle_interrupt).
    fn interrupt_core(&self, core: CoreId);

    /// Lay out the first frame of `task` on `stack` so that switching to
    /// the returned context calls `entry(arg0, arg1)`.
    fn init_context(
        &self,
        task: TaskId,
        entry: TaskFn,
        args: (usize, usize),
        stack: &mut [u8],
    ) -> Result<Context, KernelError>;

    /// Switch `core` from `from` to `to`. `from` is `None` when the core
    /// starts its first task. The port stores the outgoing stack pointer
    /// in `from`'s context.
    fn swap(&self, core: CoreId, from: Option<(TaskId, &mut Context)>, to: (TaskId, Context));

    /// Nothing is ready on `core`. Called with the scheduler unlocked and
    /// interrupts enabled.
    fn idle(&self, _core: CoreId) -> IdleAction {
        IdleAction::Retry
    }

    /// Called while waiting for `core` to clear its work flag.
    fn rendezvous(&self, _core: CoreId) -> WaitAction {
        WaitAction::Spin
    }

    /// Required stack alignment in bytes. At most 8.
    fn stack_alignment(&self) -> usize {
        8
    }
}
