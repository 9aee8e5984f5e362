//! Interrupt status word returned by `ReadInterruptStatus`.
//!
//! A zero word means nothing was latched. The two top bits report faults;
//! any other non-zero value is a normal completion.

/// Network finished.
pub const DONE: u32 = 1 << 0;

/// Address-translation exception raised by the accelerator MMU.
pub const MMU_EXCEPTION: u32 = 1 << 30;

/// Bus error on the accelerator's memory port.
pub const BUS_ERROR: u32 = 1 << 31;

/// Mask of all fault bits.
pub const FAULT_MASK: u32 = BUS_ERROR | MMU_EXCEPTION;
