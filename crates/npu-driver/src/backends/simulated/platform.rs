// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated SoC platform: a power switch and one interrupt line

use crate::error::{NpuError, Result};
use crate::platform::{IrqHandler, Platform};
use parking_lot::Mutex;
use std::fmt;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
struct Power {
    on: bool,
    ons: u64,
    offs: u64,
}

/// Simulated power domain and interrupt controller
#[derive(Default)]
pub struct SimulatedPlatform {
    power: Mutex<Power>,
    handler: Mutex<Option<IrqHandler>>,
}

impl fmt::Debug for SimulatedPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedPlatform")
            .field("power", &*self.power.lock())
            .field("irq_claimed", &self.handler.lock().is_some())
            .finish()
    }
}

impl SimulatedPlatform {
    /// Powered-off platform with a free interrupt line
    pub fn new() -> Self {
        Self::default()
    }

    /// Power currently enabled
    pub fn is_powered(&self) -> bool {
        self.power.lock().on
    }

    /// Power-on and power-off transitions so far
    pub fn power_cycles(&self) -> (u64, u64) {
        let p = *self.power.lock();
        (p.ons, p.offs)
    }

    /// An interrupt handler is registered
    pub fn irq_claimed(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Assert the interrupt line. The handler runs on the calling thread,
    /// outside the platform lock. Returns false if nobody listens.
    pub fn raise_irq(&self) -> bool {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => {
                debug!("Interrupt raised with no handler");
                false
            }
        }
    }
}

impl Platform for SimulatedPlatform {
    fn power_on(&self) -> Result<()> {
        let mut p = self.power.lock();
        if !p.on {
            p.on = true;
            p.ons += 1;
        }
        Ok(())
    }

    fn power_off(&self) -> Result<()> {
        let mut p = self.power.lock();
        if p.on {
            p.on = false;
            p.offs += 1;
        }
        Ok(())
    }

    fn register_irq(&self, handler: IrqHandler) -> Result<()> {
        let mut slot = self.handler.lock();
        if slot.is_some() {
            return Err(NpuError::resource("completion interrupt already claimed"));
        }
        *slot = Some(handler);
        Ok(())
    }

    fn unregister_irq(&self) {
        self.handler.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_power_transitions_counted_once() {
        let p = SimulatedPlatform::new();
        p.power_on().unwrap();
        p.power_on().unwrap();
        assert!(p.is_powered());
        p.power_off().unwrap();
        assert_eq!(p.power_cycles(), (1, 1));
    }

    #[test]
    fn test_irq_line_is_exclusive() {
        let p = SimulatedPlatform::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        p.register_irq(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        assert!(p.register_irq(Arc::new(|| {})).is_err());

        assert!(p.raise_irq());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        p.unregister_irq();
        assert!(!p.raise_irq());
        assert!(!p.irq_claimed());
    }
}
