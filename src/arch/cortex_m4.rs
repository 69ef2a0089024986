//! # Cortex-M4 Port Layer
//!
//! [`Port`] for a single ARM Cortex-M4 (Thumb-2, no FPU context). The
//! scheduler's decisions become PendSV context switches; SysTick drives
//! [`Kernel::tick`](crate::kernel::Kernel::tick).
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): Used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): Used by tasks in Thread mode
//!
//! On exception entry, the hardware automatically stacks R0–R3, R12, LR, PC,
//! and xPSR onto the process stack. PendSV saves and restores R4–R11.
//!
//! [`Port::swap`] only records where to save the outgoing stack pointer
//! and which stack pointer to load, then pends PendSV. The switch happens
//! once the kernel has left its critical section and PendSV runs.
//!
//! ```text
//!   high ┌──────────┐
//!        │   xPSR   │  0x0100_0000 (Thumb)
//!        │    PC    │  task_start
//!        │    LR    │  task_return
//!        │   R12    │
//!        │  R3  R2  │  R2 = arg1
//!        │  R1  R0  │  R1 = arg0, R0 = entry
//!        │ R11..R4  │  restored by PendSV
//!   sp → └──────────┘
//! ```
//!
//! ## Interrupt Priorities
//!
//! SysTick and PendSV both run at the lowest priority, so a context
//! switch never preempts an application ISR.

use core::arch::global_asm;
use core::ptr;

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SCB;
use cortex_m::register::primask;
use spin::{Mutex, Once};

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::error::KernelError;
use crate::port::{Context, IdleAction, IrqKey, Port};
use crate::task::{CoreId, TaskFn, TaskId};

/// Words in the initial frame: R4–R11 plus the hardware frame.
const FRAME_WORDS: usize = 16;
const FRAME_BYTES: usize = FRAME_WORDS * 4;
const INITIAL_XPSR: u32 = 0x0100_0000;

/// Where PendSV stores the outgoing PSP; null when nothing is saved.
#[no_mangle]
static mut SMP_SAVE_SLOT: *mut usize = ptr::null_mut();

/// PSP that PendSV loads; 0 when no switch is pending.
#[no_mangle]
static mut SMP_NEXT_SP: usize = 0;

/// Called when a task function returns.
static TASK_RETURN: Once<fn()> = Once::new();

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure the SysTick timer to fire at [`TICK_HZ`] from the processor
/// clock.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        let val = val | (0xFF << 16) | (0xFF << 24);
        core::ptr::write_volatile(shpr3, val);
    }
}

// ---------------------------------------------------------------------------
// Task entry and return
// ---------------------------------------------------------------------------

/// First code a task executes. PendSV's exception return lands here with
/// the entry point and arguments in R0–R2.
extern "C" fn task_start(entry: usize, arg0: usize, arg1: usize) -> ! {
    // SAFETY: init_context stored a `TaskFn` in R0.
    let entry: TaskFn = unsafe { core::mem::transmute::<usize, TaskFn>(entry) };
    entry(arg0, arg1);
    task_return()
}

extern "C" fn task_return() -> ! {
    if let Some(handler) = TASK_RETURN.get() {
        handler();
    }
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SwitchState {
    /// Task whose registers are on the CPU while a switch is pending.
    origin: Option<TaskId>,
    /// Task the CPU runs once pending switches complete.
    on_cpu: Option<TaskId>,
}

pub struct CortexM4 {
    switch: Mutex<SwitchState>,
}

impl CortexM4 {
    /// `on_return` runs in a task whose function returned, typically
    /// calling [`Kernel::exit`](crate::kernel::Kernel::exit).
    pub fn new(on_return: fn()) -> Self {
        TASK_RETURN.call_once(|| on_return);
        Self {
            switch: Mutex::new(SwitchState::default()),
        }
    }
}

impl Port for CortexM4 {
    fn disable_interrupts(&self) -> IrqKey {
        let enabled = primask::read().is_active();
        cortex_m::interrupt::disable();
        IrqKey(enabled as usize)
    }

    fn restore_interrupts(&self, key: IrqKey) {
        if key.0 != 0 {
            // SAFETY: re-enables exactly what disable_interrupts masked.
            unsafe { cortex_m::interrupt::enable() };
        }
    }

    fn interrupt_core(&self, _core: CoreId) {
        // One core: the caller always reschedules itself.
    }

    fn init_context(
        &self,
        _task: TaskId,
        entry: TaskFn,
        args: (usize, usize),
        stack: &mut [u8],
    ) -> Result<Context, KernelError> {
        if stack.len() < FRAME_BYTES {
            return Err(KernelError::ContextInit);
        }
        let mut frame = [0u32; FRAME_WORDS];
        frame[8] = entry as usize as u32; // R0
        frame[9] = args.0 as u32; // R1
        frame[10] = args.1 as u32; // R2
        frame[13] = task_return as usize as u32; // LR
        frame[14] = (task_start as usize as u32) & !1; // PC
        frame[15] = INITIAL_XPSR;

        let top = stack.len();
        stack[top - FRAME_BYTES..].copy_from_slice(bytemuck::cast_slice(&frame));
        Ok(Context {
            sp: stack.as_ptr() as usize + top - FRAME_BYTES,
        })
    }

    fn swap(&self, _core: CoreId, from: Option<(TaskId, &mut Context)>, to: (TaskId, Context)) {
        let mut switch = self.switch.lock();
        // SAFETY: called with interrupts masked; PendSV reads these only
        // after they are unmasked.
        unsafe {
            if SMP_NEXT_SP == 0 {
                switch.origin = switch.on_cpu;
                SMP_SAVE_SLOT = match from {
                    Some((_, context)) => &mut context.sp as *mut usize,
                    None => ptr::null_mut(),
                };
            }
            if switch.origin == Some(to.0) {
                // Back to the task still on the CPU.
                SMP_NEXT_SP = 0;
                SMP_SAVE_SLOT = ptr::null_mut();
            } else {
                SMP_NEXT_SP = to.1.sp;
                SCB::set_pendsv();
            }
        }
        switch.on_cpu = Some(to.0);
    }

    fn idle(&self, _core: CoreId) -> IdleAction {
        // Runs in handler mode: the next SysTick reschedules.
        IdleAction::Park
    }
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

// 1. Nothing pending: return.
// 2. Save R4–R11 on the outgoing PSP and store it, unless this is the first
//    switch out of main.
// 3. Restore R4–R11 from the incoming stack and return to Thread mode on PSP.
global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    cpsid i",
    "    ldr r2, =SMP_NEXT_SP",
    "    ldr r1, [r2]",
    "    cbz r1, 2f",
    "    movs r3, #0",
    "    str r3, [r2]",
    "    ldr r2, =SMP_SAVE_SLOT",
    "    ldr r0, [r2]",
    "    str r3, [r2]",
    "    cbz r0, 1f",
    "    mrs r12, psp",
    "    stmdb r12!, {{r4-r11}}",
    "    str r12, [r0]",
    "1:",
    "    ldmia r1!, {{r4-r11}}",
    "    msr psp, r1",
    "    cpsie i",
    "    ldr lr, =0xFFFFFFFD",
    "    bx lr",
    "2:",
    "    cpsie i",
    "    bx lr",
    "    .ltorg",
);
