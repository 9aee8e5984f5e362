//! SoC platform services: power and the completion interrupt line

use crate::error::Result;
use std::fmt;
use std::sync::Arc;

/// Completion interrupt handler. Runs in interrupt context of the platform,
/// so it must not block on anything an execution holds.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Power and interrupt plumbing for the accelerator
pub trait Platform: Send + Sync + fmt::Debug {
    /// Enable accelerator power and clocks
    ///
    /// # Errors
    ///
    /// Returns error if the accelerator cannot be powered.
    fn power_on(&self) -> Result<()>;

    /// Disable accelerator power and clocks
    ///
    /// # Errors
    ///
    /// Returns error if the power domain refuses to switch off.
    fn power_off(&self) -> Result<()>;

    /// Route the completion interrupt to `handler`
    ///
    /// # Errors
    ///
    /// Returns error if the line is already claimed.
    fn register_irq(&self, handler: IrqHandler) -> Result<()>;

    /// Release the completion interrupt
    fn unregister_irq(&self);
}
