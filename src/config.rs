//! # Scheduler Configuration
//!
//! Compile-time limits and defaults, plus the runtime [`KernelConfig`] that
//! sizes one scheduler instance. Every table the scheduler owns (ready
//! queues, run-queue, per-core state, task arena) is allocated once from
//! these values when the kernel is built and never grows afterwards.

use crate::error::KernelError;

/// Upper bound on cores. The work flag is one `u32` bit per core.
pub const MAX_CORES: usize = 32;

/// Upper bound on priority levels. Priority masks are `u32`.
pub const MAX_PRIORITIES: usize = 32;

/// Number of priority levels used when none is configured.
pub const DEFAULT_NUM_PRIORITIES: usize = 16;

/// Stack size in bytes for tasks created with `stack_size == 0`.
pub const DEFAULT_STACK_SIZE: usize = 2048;

/// Size of the task arena when none is configured.
pub const DEFAULT_MAX_TASKS: usize = 64;

/// Byte written over fresh stacks. The lowest word must still hold it for
/// the stack to count as intact, and the high-water mark is measured from it.
pub const STACK_FILL: u8 = 0xbe;

/// Timeout value meaning "never time out". Not accepted by `sleep`.
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Timeout value meaning "do not wait".
pub const NO_WAIT: u32 = 0;

/// Priority reserved for the per-core idle tasks.
pub const IDLE_PRIORITY: i32 = 0;

/// SysTick frequency in Hz for the Cortex-M4 port.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

/// Shape and policy of one scheduler instance.
///
/// Built with [`KernelConfig::new`] and the `with_*` builders, checked by
/// [`KernelConfig::validate`] when the kernel is constructed.
///
/// ```
/// use smptask::config::KernelConfig;
///
/// let config = KernelConfig::new(2)
///     .with_priorities(8)
///     .with_idle_tasks(false);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of cores. Core ids run `0..num_cores`; the don't-care
    /// affinity class is `num_cores`.
    pub num_cores: usize,

    /// Number of priority levels. Valid task priorities are `-1` (inactive)
    /// and `0..num_priorities`, with `0` kept for idle tasks.
    pub num_priorities: usize,

    /// Capacity of the task arena, idle tasks included.
    pub max_tasks: usize,

    /// Stack size used when a task asks for `0`.
    pub default_stack_size: usize,

    /// Create one priority-0 idle task pinned to each core.
    pub idle_tasks: bool,

    /// Verify stack canaries and saved stack pointers on every switch.
    pub check_stacks: bool,

    /// Verify the per-task object checksum whenever a task is scheduled,
    /// blocked or readied.
    pub object_check: bool,

    /// Verify the scheduler's own table checksum whenever it is locked.
    pub module_state_check: bool,

    /// Queue exited tasks for reclamation by
    /// [`Kernel::delete_terminated_tasks`](crate::kernel::Kernel::delete_terminated_tasks).
    pub delete_terminated_tasks: bool,
}

impl KernelConfig {
    /// Defaults for a machine with `num_cores` cores.
    pub const fn new(num_cores: usize) -> Self {
        Self {
            num_cores,
            num_priorities: DEFAULT_NUM_PRIORITIES,
            max_tasks: DEFAULT_MAX_TASKS,
            default_stack_size: DEFAULT_STACK_SIZE,
            idle_tasks: true,
            check_stacks: true,
            object_check: false,
            module_state_check: false,
            delete_terminated_tasks: false,
        }
    }

    pub const fn with_priorities(mut self, num_priorities: usize) -> Self {
        self.num_priorities = num_priorities;
        self
    }

    pub const fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub const fn with_default_stack_size(mut self, size: usize) -> Self {
        self.default_stack_size = size;
        self
    }

    pub const fn with_idle_tasks(mut self, enabled: bool) -> Self {
        self.idle_tasks = enabled;
        self
    }

    pub const fn with_stack_checks(mut self, enabled: bool) -> Self {
        self.check_stacks = enabled;
        self
    }

    /// Turns both the per-task and the scheduler table checksums on or off.
    pub const fn with_integrity_checks(mut self, enabled: bool) -> Self {
        self.object_check = enabled;
        self.module_state_check = enabled;
        self
    }

    pub const fn with_terminated_reclaim(mut self, enabled: bool) -> Self {
        self.delete_terminated_tasks = enabled;
        self
    }

    /// Index of the don't-care affinity class.
    #[inline]
    pub const fn dont_care_class(&self) -> usize {
        self.num_cores
    }

    /// Reject shapes the scheduler cannot represent.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.num_cores == 0 || self.num_cores > MAX_CORES {
            return Err(KernelError::InvalidConfig);
        }
        // Level 0 belongs to idle tasks, so at least one more is needed.
        if self.num_priorities < 2 || self.num_priorities > MAX_PRIORITIES {
            return Err(KernelError::InvalidConfig);
        }
        if self.default_stack_size == 0 || self.max_tasks > u16::MAX as usize {
            return Err(KernelError::InvalidConfig);
        }
        let reserved = if self.idle_tasks { self.num_cores } else { 0 };
        if self.max_tasks <= reserved {
            return Err(KernelError::InvalidConfig);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
