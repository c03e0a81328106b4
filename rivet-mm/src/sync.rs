//! Interrupt-safe locking
//!
//! [`IrqMutex`] is a `spin::Mutex` that keeps supervisor interrupts off while
//! the guard is alive. Nesting follows xv6's `push_off`/`pop_off`: interrupts
//! come back only when the outermost guard drops and only if they were on
//! before the first one was taken. The target has a single hart, so one
//! global nesting counter is enough.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch;

static NOFF: AtomicUsize = AtomicUsize::new(0);
static INTENA: AtomicBool = AtomicBool::new(false);

/// Disable interrupts, remembering whether they were enabled
pub fn push_off() {
    let was_enabled = arch::intr_off();
    if NOFF.fetch_add(1, Ordering::Acquire) == 0 {
        INTENA.store(was_enabled, Ordering::Relaxed);
    }
}

/// Undo one `push_off`
pub fn pop_off() {
    let prev = NOFF.fetch_sub(1, Ordering::Release);
    debug_assert!(prev > 0, "pop_off without push_off");
    if prev == 1 && INTENA.load(Ordering::Relaxed) {
        arch::intr_on();
    }
}

/// A mutex that disables interrupts while held
pub struct IrqMutex<T: ?Sized> {
    inner: spin::Mutex<T>,
}

impl<T> IrqMutex<T> {
    /// Creates a new mutex protecting the given data
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::Mutex::new(data),
        }
    }

    /// Consumes the mutex and returns the inner data
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> IrqMutex<T> {
    /// Acquire the lock with interrupts disabled
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        push_off();
        IrqMutexGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
        }
    }

    /// Returns a mutable reference to the underlying data
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Check if the mutex is currently locked
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// RAII guard for [`IrqMutex`]
pub struct IrqMutexGuard<'a, T: ?Sized> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
}

impl<T: ?Sized> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: ?Sized> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before interrupts can come back on.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        pop_off();
    }
}
