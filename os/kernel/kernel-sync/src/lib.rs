//! # Kernel synchronization primitives
//!
//! Two lock flavours are provided:
//!
//! - [`SpinLock`]: a test-and-test-and-set spin lock for short critical sections.
//! - [`IrqSpinLock`]: a [`SpinLock`] that additionally keeps local interrupts
//!   disabled while held, so the same lock can be taken from interrupt handlers
//!   without deadlocking against the interrupted holder.
//!
//! Interrupt masking is abstracted by [`InterruptControl`]. The x86-64
//! implementation is gated behind the `asm` feature; [`NoInterrupts`] is the
//! hosted implementation used by tests and by environments without interrupts.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{InterruptControl, IrqGuard, IrqSpinLock, IrqSpinLockGuard, NoInterrupts};
pub use spin_lock::{SpinLock, SpinLockGuard};
