//! # Error Types
//!
//! Two families:
//!
//! - [`KernelError`]: recoverable failures reported through `Result`, for
//!   example a task that cannot be created because its stack could not be
//!   allocated. Nothing is left half-registered when one is returned.
//! - [`FatalError`]: integrity failures detected inside the scheduler
//!   (corrupted stacks, damaged task objects). These are handed to
//!   [`SchedulerHooks::fatal`](crate::hooks::SchedulerHooks::fatal), which
//!   never returns.
//!
//! Contract violations (bad priority, deleting a running task, calling a
//! task-only operation from a core with no current task) are assertions.

use crate::task::TaskId;

/// Declare an error enum with a subsystem byte, per-variant codes and
/// descriptions, `Display` as `E{code:04X}: description`, and
/// `core::error::Error`.
macro_rules! kernel_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal => $desc:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem byte, the high half of every code.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// Numeric code for logs and exit status.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        kernel_error!(@pattern $variant $(($inner))? _unused) => {
                            (($subsystem as u16) << 8) | $code
                        }
                    )*
                }
            }

            /// Short human-readable description.
            pub const fn name(&self) -> &'static str {
                match self {
                    $(
                        kernel_error!(@pattern $variant $(($inner))? _unused) => $desc,
                    )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        kernel_error!(@pattern $variant $(($inner))? inner) => {
                            kernel_error!(@display self f $desc $(($inner))? inner)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {}
    };

    (@pattern $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pattern $variant:ident $bind:ident) => { Self::$variant };

    (@display $self:ident $f:ident $desc:literal ($inner:ty) $bind:ident) => {
        write!($f, "E{:04X}: {} ({})", $self.code(), $desc, $bind)
    };
    (@display $self:ident $f:ident $desc:literal $bind:ident) => {
        write!($f, "E{:04X}: {}", $self.code(), $desc)
    };
}

kernel_error! {
    /// Recoverable scheduler errors.
    pub enum KernelError(0x01) {
        /// Core count, priority count or arena size out of range.
        InvalidConfig = 0x01 => "invalid scheduler configuration",
        /// Every task slot is in use.
        TaskLimit = 0x02 => "task object limit reached",
        /// The task stack could not be allocated.
        StackAlloc = 0x03 => "task stack allocation failed",
        /// The port could not lay out the initial context on the stack.
        ContextInit = 0x04 => "initial task context could not be built",
        /// A create hook refused the task.
        CreateHook = 0x05 => "create hook rejected the task",
    }
}

kernel_error! {
    /// Integrity failures. Reported through `SchedulerHooks::fatal`.
    pub enum FatalError(0x02) {
        /// The canary at the low end of the task stack was overwritten.
        StackOverflow(TaskId) = 0x01 => "task stack overflow",
        /// The saved stack pointer lies outside the task stack.
        SpOutOfBounds(TaskId) = 0x02 => "stack pointer out of bounds",
        /// The task object checksum no longer matches.
        ObjectCheckFailed(TaskId) = 0x03 => "task object check failed",
        /// The scheduler table checksum no longer matches.
        ModuleStateCheckFailed = 0x04 => "scheduler state check failed",
        /// The task is queued for reclamation and cannot be deleted directly.
        DeleteNotAllowed(TaskId) = 0x05 => "delete of terminated task not allowed",
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
