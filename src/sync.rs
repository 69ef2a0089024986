//! # Synchronization Primitives
//!
//! The scheduler's critical section: interrupts masked on the calling core
//! through the [`Port`], then the state lock taken. On a single core the
//! interrupt mask alone is enough; on SMP the spin lock serializes the
//! cores. Dropping the guard releases the lock first and only then
//! restores interrupts.
//!
//! # Usage
//! ```ignore
//! let mut cs = Critical::enter(&self.state, &self.port);
//! cs.sched.block(core, task, &self.port, &self.hooks);
//! // unlocked and interrupts restored here
//! ```

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::port::{IrqKey, Port};

pub(crate) struct Critical<'a, T, P: Port> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    port: &'a P,
    key: IrqKey,
}

impl<'a, T, P: Port> Critical<'a, T, P> {
    #[inline]
    pub(crate) fn enter(lock: &'a Mutex<T>, port: &'a P) -> Self {
        let key = port.disable_interrupts();
        let guard = lock.lock();
        Self {
            guard: ManuallyDrop::new(guard),
            port,
            key,
        }
    }
}

impl<T, P: Port> Deref for Critical<'_, T, P> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, P: Port> DerefMut for Critical<'_, T, P> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, P: Port> Drop for Critical<'_, T, P> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here, and never touched again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.port.restore_interrupts(self.key);
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
