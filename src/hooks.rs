//! # Scheduler Hooks
//!
//! Application callbacks invoked at task lifecycle points. All methods have
//! empty defaults, so an implementation overrides only what it needs.
//!
//! Except for [`on_exit`](SchedulerHooks::on_exit) and
//! [`all_blocked`](SchedulerHooks::all_blocked), hooks run inside the
//! scheduler's critical section and must not call back into the kernel.

use crate::error::{FatalError, KernelError};
use crate::task::{CoreId, TaskId};

pub trait SchedulerHooks {
    /// A task object has been built. Returning an error aborts the
    /// creation; the delete hook is not called for it.
    fn on_create(&self, _task: TaskId) -> Result<(), KernelError> {
        Ok(())
    }

    /// A task is about to be freed.
    fn on_delete(&self, _task: TaskId) {}

    /// `core` switches from `prev` to `next`. `prev` is `None` for the first
    /// task on a core.
    fn on_switch(&self, _core: CoreId, _prev: Option<TaskId>, _next: TaskId) {}

    /// A task became ready.
    fn on_ready(&self, _task: TaskId) {}

    /// A task is exiting. Runs in the exiting task, before any scheduler
    /// state is touched.
    fn on_exit(&self, _task: TaskId) {}

    /// Nothing is ready on `core`.
    fn all_blocked(&self, _core: CoreId) {}

    /// The last vital task has gone away.
    fn system_exit(&self, status: i32) {
        log::info!("all vital tasks done, exit status {}", status);
    }

    /// An integrity check failed. Never returns.
    fn fatal(&self, error: FatalError) -> ! {
        panic!("{}", error)
    }
}

/// Hooks that do nothing beyond the defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl SchedulerHooks for NoHooks {}
