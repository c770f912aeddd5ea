//! Interrupt masking and the interrupt-safe spin lock.

use crate::{SpinLock, SpinLockGuard};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// Local interrupt masking for the current CPU.
///
/// Implementations are stateless; the saved state travels in the
/// returned flag so that nested guards restore correctly.
pub trait InterruptControl {
    /// Masks interrupts and returns whether they were enabled before.
    fn disable() -> bool;

    /// Re-enables interrupts if `were_enabled` is set; otherwise does nothing.
    fn restore(were_enabled: bool);
}

/// Interrupt control for contexts that have no interrupts to mask,
/// such as hosted tests.
#[derive(Debug, Copy, Clone, Default)]
pub struct NoInterrupts;

impl InterruptControl for NoInterrupts {
    #[inline]
    fn disable() -> bool {
        false
    }

    #[inline]
    fn restore(_were_enabled: bool) {}
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use x86::X86Interrupts;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
mod x86 {
    use super::InterruptControl;

    /// Interrupt control via `cli`/`sti`, reading `IF` (bit 9 of `RFLAGS`).
    ///
    /// # Safety & Privilege
    ///
    /// Must only be used in contexts where `cli`/`sti` are permitted
    /// (ring 0 or a suitable hypervisor context).
    #[derive(Debug, Copy, Clone, Default)]
    pub struct X86Interrupts;

    #[inline]
    fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r
    }

    impl InterruptControl for X86Interrupts {
        #[inline]
        fn disable() -> bool {
            let enabled = (rflags() & (1 << 9)) != 0;
            if enabled {
                unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
            }
            enabled
        }

        #[inline]
        fn restore(were_enabled: bool) {
            if were_enabled {
                unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
            }
        }
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Interrupts are re-enabled on drop **only** if they were enabled when the
/// guard was created, preserving the original state across nesting.
pub struct IrqGuard<I: InterruptControl> {
    were_enabled: bool,
    _control: PhantomData<I>,
}

impl<I: InterruptControl> IrqGuard<I> {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            were_enabled: I::disable(),
            _control: PhantomData,
        }
    }
}

impl<I: InterruptControl> Default for IrqGuard<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: InterruptControl> Drop for IrqGuard<I> {
    fn drop(&mut self) {
        I::restore(self.were_enabled);
    }
}

/// A [`SpinLock`] that masks local interrupts for as long as it is held.
///
/// Locking first disables interrupts, then spins for the lock; dropping the
/// guard releases the lock, then restores the interrupt state. Structures that
/// are touched both from regular and from interrupt context must use this
/// lock, otherwise an interrupt arriving while the lock is held on the same CPU
/// would spin forever.
///
/// # Examples
///
/// ```
/// use kernel_sync::{IrqSpinLock, NoInterrupts};
///
/// static COUNTER: IrqSpinLock<u64, NoInterrupts> = IrqSpinLock::new(0);
///
/// {
///     let mut g = COUNTER.lock();
///     *g += 1;
/// }
/// assert_eq!(COUNTER.with_lock(|v| *v), 1);
/// ```
pub struct IrqSpinLock<T, I: InterruptControl> {
    lock: SpinLock<T>,
    _control: PhantomData<fn() -> I>,
}

impl<T, I: InterruptControl> IrqSpinLock<T, I> {
    pub const fn new(inner: T) -> Self {
        Self {
            lock: SpinLock::new(inner),
            _control: PhantomData,
        }
    }

    /// Disables interrupts and acquires the lock.
    #[inline]
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T, I> {
        let irq = IrqGuard::new();
        let guard = self.lock.lock();
        IrqSpinLockGuard { guard, _irq: irq }
    }

    /// Disables interrupts and tries the lock once. Interrupts are restored
    /// immediately if the lock is taken.
    #[inline]
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T, I>> {
        let irq = IrqGuard::new();
        let guard = self.lock.try_lock()?;
        Some(IrqSpinLockGuard { guard, _irq: irq })
    }

    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.lock.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.lock.into_inner()
    }
}

impl<T: Default, I: InterruptControl> Default for IrqSpinLock<T, I> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug, I: InterruptControl> fmt::Debug for IrqSpinLock<T, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.lock, f)
    }
}

/// Guard returned by [`IrqSpinLock::lock`].
pub struct IrqSpinLockGuard<'a, T, I: InterruptControl> {
    // Field order matters: the lock is released before interrupts come back.
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard<I>,
}

impl<T, I: InterruptControl> Deref for IrqSpinLockGuard<'_, T, I> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, I: InterruptControl> DerefMut for IrqSpinLockGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
