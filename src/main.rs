//! # smptask Example Firmware
//!
//! Runs the scheduler on a single Cortex-M4 with four tasks:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `sampler` | 4 | Wakes every 10 ticks, counts samples |
//! | `filter` | 2 | Busy work, yields after every batch |
//! | `logger` | 2 | Busy work, yields after every batch |
//! | `calibrate` | -1 → 3 | Created inactive, activated by `sampler`, runs once and exits |
//!
//! `filter` and `logger` share a priority and alternate through
//! `yield_task`; `sampler` preempts both whenever its sleep expires.

#![no_std]
#![no_main]

use core::mem::MaybeUninit;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use cortex_m_rt::{entry, exception};
use linked_list_allocator::LockedHeap;
use panic_halt as _;
use spin::Once;

use smptask::arch::{self, CortexM4};
use smptask::config::KernelConfig;
use smptask::task::{Affinity, TaskId, TaskParams};
use smptask::{FatalError, Kernel, SchedulerHooks};

const HEAP_SIZE: usize = 32 * 1024;
const TASK_STACK: usize = 1024;

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

static mut HEAP_MEM: [MaybeUninit<u8>; HEAP_SIZE] = [MaybeUninit::uninit(); HEAP_SIZE];

static KERNEL: Once<Kernel<CortexM4, DemoHooks>> = Once::new();

/// Slot of the inactive calibration task, set before the scheduler starts.
static CALIBRATE: Once<TaskId> = Once::new();

static SAMPLES: AtomicU32 = AtomicU32::new(0);
static BATCHES: AtomicU32 = AtomicU32::new(0);

fn kernel() -> &'static Kernel<CortexM4, DemoHooks> {
    match KERNEL.get() {
        Some(kernel) => kernel,
        None => halt(),
    }
}

fn halt() -> ! {
    loop {
        cortex_m::asm::bkpt();
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

struct DemoHooks {
    switches: AtomicUsize,
}

impl SchedulerHooks for DemoHooks {
    fn on_switch(&self, _core: usize, _prev: Option<TaskId>, _next: TaskId) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    fn system_exit(&self, _status: i32) {
        halt()
    }

    fn fatal(&self, _error: FatalError) -> ! {
        halt()
    }
}

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

fn sampler(_: usize, _: usize) {
    loop {
        kernel().sleep(0, 10);
        let samples = SAMPLES.fetch_add(1, Ordering::Relaxed) + 1;
        if samples == 100 {
            if let Some(task) = CALIBRATE.get() {
                kernel().set_priority(0, *task, 3);
            }
        }
    }
}

/// Shared body of `filter` and `logger`; `work` sets the batch length.
fn worker(work: usize, _: usize) {
    loop {
        let mut acc: u32 = 0;
        for i in 0..work {
            acc = acc.wrapping_add(i as u32);
        }
        core::hint::black_box(acc);
        BATCHES.fetch_add(1, Ordering::Relaxed);
        kernel().yield_task(0);
    }
}

/// Runs once; returning ends the task through `task_returned`.
fn calibrate(rounds: usize, _: usize) {
    for _ in 0..rounds {
        core::hint::black_box(SAMPLES.load(Ordering::Relaxed));
    }
}

fn task_returned() {
    kernel().exit(0);
}

// ---------------------------------------------------------------------------
// Exceptions
// ---------------------------------------------------------------------------

#[exception]
fn SysTick() {
    kernel().tick(0);
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().expect("core peripherals already taken");

    unsafe { HEAP.lock().init(addr_of_mut!(HEAP_MEM) as *mut u8, HEAP_SIZE) };

    let kernel = KERNEL.call_once(|| {
        let config = KernelConfig::new(1).with_max_tasks(8);
        let hooks = DemoHooks {
            switches: AtomicUsize::new(0),
        };
        Kernel::new(config, CortexM4::new(task_returned), hooks).expect("kernel init failed")
    });

    let params = |name, priority| {
        TaskParams::new(priority)
            .with_name(name)
            .with_affinity(Affinity::Core(0))
            .with_stack_size(TASK_STACK)
    };

    kernel
        .create_task(0, sampler, params("sampler", 4))
        .expect("Failed to create sampler");
    kernel
        .create_task(0, worker, params("filter", 2).with_args(4000, 0))
        .expect("Failed to create filter");
    kernel
        .create_task(0, worker, params("logger", 2).with_args(1500, 0))
        .expect("Failed to create logger");
    let calibration = kernel
        .create_task(0, calibrate, params("calibrate", -1).with_args(50, 0).vital(false))
        .expect("Failed to create calibrate");
    CALIBRATE.call_once(|| calibration);

    arch::set_interrupt_priorities();
    arch::configure_systick(&mut cp.SYST);

    // Dispatches the first task through PendSV; main's stack is abandoned.
    kernel.start_core(0);
    loop {
        cortex_m::asm::wfi();
    }
}
