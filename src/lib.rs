//! # smptask: SMP Priority Task Scheduler
//!
//! A preemptive, fixed-priority task scheduler for symmetric
//! multiprocessors. Each core has its own ready queues for tasks pinned
//! to it, and all cores share one more set of queues for tasks that may
//! run anywhere (the "don't-care" affinity class).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                   │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                 │
//! │   create_task · sleep · yield · set_priority · exit    │
//! ├──────────────┬──────────────────┬──────────────────────┤
//! │  Scheduler   │  Queues          │  Clock               │
//! │ scheduler.rs │  queue.rs        │  clock.rs            │
//! │  ─ schedule  │  ─ ready queues  │  ─ tick              │
//! │  ─ block     │  ─ cur_set masks │  ─ timeouts          │
//! │  ─ unblock   │  runq.rs         │                      │
//! ├──────────────┴──────────────────┴──────────────────────┤
//! │        Task Model (task.rs) · Hooks (hooks.rs)         │
//! ├────────────────────────────────────────────────────────┤
//! │    Port trait (port.rs): IPI · context · interrupts    │
//! ├───────────────────────────┬────────────────────────────┤
//! │  SimPort (sim.rs, hosted) │  CortexM4 (arch/, feature) │
//! └───────────────────────────┴────────────────────────────┘
//! ```
//!
//! ## Scheduling rules
//!
//! - A core always runs the highest-priority ready task it is allowed to
//!   run. Within a priority, tasks run first-in first-out.
//! - A preempted task keeps its place at the head of its queue; a task
//!   that yields goes to the tail.
//! - A don't-care task preempts the core currently running the lowest
//!   priority. The sorted run-queue keeps that core at hand.
//! - Priority `-1` parks a task as inactive; priority `0` is reserved for
//!   the per-core idle tasks.
//!
//! ## Example
//!
//! ```
//! use smptask::config::KernelConfig;
//! use smptask::kernel::Kernel;
//! use smptask::sim::{SimPort, TraceHooks};
//! use smptask::task::{Affinity, TaskParams};
//!
//! fn worker(_: usize, _: usize) {}
//!
//! let kernel = Kernel::new(KernelConfig::new(2), SimPort::new(), TraceHooks::new()).unwrap();
//! kernel.start_core(0);
//! kernel.start_core(1);
//!
//! let pinned = kernel
//!     .create_task(0, worker, TaskParams::new(3).with_affinity(Affinity::Core(1)))
//!     .unwrap();
//! kernel.settle();
//! assert_eq!(kernel.self_task(1), Some(pinned));
//! ```
//!
//! ## Memory Model
//!
//! - Task objects live in a fixed-capacity arena sized at construction.
//! - Stacks are allocated per task (or lent by the caller).
//! - Queue links are indices into the arena; queue operations never
//!   allocate.
//! - All scheduler state sits behind one spin lock entered with interrupts
//!   masked.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod clock;
pub mod config;
pub mod error;
pub mod hooks;
pub mod kernel;
pub mod port;
pub(crate) mod queue;
pub mod runq;
pub mod scheduler;
pub mod sim;
pub(crate) mod sync;
pub mod task;

#[cfg(all(feature = "cortex-m4", target_arch = "arm"))]
pub mod arch;

pub use config::KernelConfig;
pub use error::{FatalError, KernelError};
pub use hooks::{NoHooks, SchedulerHooks};
pub use kernel::Kernel;
pub use port::Port;
pub use scheduler::SchedulerKey;
pub use task::{Affinity, CoreId, TaskId, TaskMode, TaskParams};
