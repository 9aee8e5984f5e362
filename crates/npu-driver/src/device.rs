//! The NPU device
//!
//! One [`Device`] value owns everything shared between client sessions: the
//! secure session, the hardware lock, the reservation slot and global
//! statistics. Sessions are opened from it and keep it alive.
//!
//! # Lock order
//!
//! ```text
//! global ─▶ session registry ─▶ hardware ─▶ secure channel
//! ```
//!
//! A lock is never taken while a lock to its right is held. The completion
//! signal's internal lock and the secure channel lock are leaves; the
//! interrupt handler only ever takes those two.

use crate::channel::{SharedMemoryChannel, TrustedEndpoint};
use crate::config::DriverConfig;
use crate::coordinator::{CompletionSignal, ExecutionCoordinator, HwState};
use crate::error::Result;
use crate::memory::MemoryProvider;
use crate::platform::Platform;
use crate::protocol::SecureSession;
use crate::report::{DeviceReport, DeviceStats};
use crate::session::Session;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// State guarded by the device-global lock
#[derive(Debug, Default)]
pub(crate) struct GlobalState {
    pub(crate) sessions: BTreeSet<u64>,
    pub(crate) reservation: Option<u64>,
    pub(crate) stats: DeviceStats,
    pub(crate) powered: bool,
}

pub(crate) struct DeviceShared {
    pub(crate) config: DriverConfig,
    pub(crate) memory: Arc<dyn MemoryProvider>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) global: Mutex<GlobalState>,
    pub(crate) hw: Mutex<HwState>,
    pub(crate) secure: Mutex<SecureSession>,
    pub(crate) completion: CompletionSignal,
    next_session: AtomicU64,
}

impl DeviceShared {
    pub(crate) fn coordinator(&self) -> ExecutionCoordinator<'_> {
        ExecutionCoordinator::new(
            &self.hw,
            &self.secure,
            &self.completion,
            self.config.run_timeout,
        )
    }

    fn on_interrupt(&self) {
        let status = match self.secure.lock().read_interrupt_status() {
            Ok(status) => status,
            Err(e) => {
                warn!("Interrupt status unreadable: {}", e);
                0
            }
        };
        debug!("Completion interrupt, status {:#010x}", status);
        self.completion.complete(status);
    }

    /// Power down once no session is left
    pub(crate) fn power_down_if_idle(&self) {
        let mut global = self.global.lock();
        if !global.sessions.is_empty() || !global.powered {
            return;
        }
        if let Err(e) = self.coordinator().deactivate() {
            warn!("Deactivation before power-off failed: {}", e);
        }
        match self.platform.power_off() {
            Ok(()) => info!("NPU powered off"),
            Err(e) => warn!("Power-off failed: {}", e),
        }
        global.powered = false;
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        self.platform.unregister_irq();
        self.secure.get_mut().close();
        debug!("Device released");
    }
}

/// Handle to the accelerator
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("platform", &self.shared.platform)
            .field("memory", &self.shared.memory)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Bring up the control plane: open the secure session and claim the
    /// completion interrupt
    ///
    /// # Errors
    ///
    /// Returns error if the channel regions cannot be allocated, the trusted
    /// side refuses the session, or the interrupt line is taken.
    pub fn attach(
        config: DriverConfig,
        memory: Arc<dyn MemoryProvider>,
        platform: Arc<dyn Platform>,
        endpoint: Arc<dyn TrustedEndpoint>,
    ) -> Result<Self> {
        info!("Attaching NPU control plane");

        let channel = SharedMemoryChannel::new(Arc::clone(&memory), endpoint, &config);
        let mut secure = SecureSession::new(Box::new(channel));
        secure.open()?;

        let shared = Arc::new(DeviceShared {
            config,
            memory,
            platform,
            global: Mutex::new(GlobalState::default()),
            hw: Mutex::new(HwState::default()),
            secure: Mutex::new(secure),
            completion: CompletionSignal::default(),
            next_session: AtomicU64::new(1),
        });

        let weak: Weak<DeviceShared> = Arc::downgrade(&shared);
        shared.platform.register_irq(Arc::new(move || {
            if let Some(device) = weak.upgrade() {
                device.on_interrupt();
            }
        }))?;

        Ok(Self { shared })
    }

    /// Open a client session, powering the accelerator for the first one
    ///
    /// # Errors
    ///
    /// Returns error if power cannot be enabled.
    pub fn open_session(&self) -> Result<Session> {
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        {
            let mut global = self.shared.global.lock();
            if !global.powered {
                self.shared.platform.power_on()?;
                global.powered = true;
                info!("NPU powered on");
            }
            global.sessions.insert(id);
        }
        debug!("Session {} opened", id);
        Ok(Session::new(id, Arc::clone(&self.shared)))
    }

    /// Driver configuration
    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    /// Snapshot of device state and counters
    pub fn report(&self) -> DeviceReport {
        let (sessions, reserved_by, powered, stats) = {
            let global = self.shared.global.lock();
            (
                global.sessions.len(),
                global.reservation,
                global.powered,
                global.stats.clone(),
            )
        };
        let mode = self.shared.hw.lock().mode;
        let trusted_networks = self.shared.secure.lock().active_networks();
        DeviceReport {
            sessions,
            reserved_by,
            powered,
            mode,
            trusted_networks,
            stats,
        }
    }
}
