// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated NPU (memory, platform and trusted side)
//!
//! ```text
//! Device ──▶ SharedMemoryChannel ──▶ SimulatedTee ──(irq thread)──▶ SimulatedPlatform
//!    │                                    │                               │
//!    └──────────── SystemMemory ◀─────────┘            handler ◀──────────┘
//! ```
//!
//! The simulator honours the same contract as the real trusted application:
//! containers are re-validated, unknown ids are rejected, and every started
//! network ends in exactly one interrupt unless it is scripted to hang.

pub mod memory;
pub mod platform;
pub mod tee;

pub use memory::SystemMemory;
pub use platform::SimulatedPlatform;
pub use tee::{RunOutcome, SimulatedTee, TeeCounters};

use crate::channel::TrustedEndpoint;
use crate::config::DriverConfig;
use crate::device::Device;
use crate::error::Result;
use crate::memory::MemoryProvider;
use crate::platform::Platform;
use std::sync::Arc;
use std::time::Duration;

/// Simulator parameters
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Time from StartNetwork to the completion interrupt
    pub latency: Duration,
    /// Accelerator id containers must be built for
    pub target_id: u32,
    /// Pages per scatter-gather fragment (0: never split)
    pub fragment_pages: usize,
    /// System memory in bytes
    pub capacity: usize,
    /// Refuse signed and encrypted containers
    pub reject_signatures: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(1),
            target_id: 0,
            fragment_pages: 4,
            capacity: 64 << 20,
            reject_signatures: false,
        }
    }
}

impl SimulatorConfig {
    /// Set completion latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set accelerator id
    pub fn with_target_id(mut self, target_id: u32) -> Self {
        self.target_id = target_id;
        self
    }

    /// Set fragment size in pages
    pub fn with_fragment_pages(mut self, pages: usize) -> Self {
        self.fragment_pages = pages;
        self
    }

    /// Set memory capacity
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = bytes;
        self
    }

    /// Refuse secure containers
    pub fn with_signature_rejection(mut self, reject: bool) -> Self {
        self.reject_signatures = reject;
        self
    }
}

/// A complete simulated NPU
#[derive(Debug, Clone)]
pub struct Simulator {
    /// System memory
    pub memory: Arc<SystemMemory>,
    /// Power and interrupt line
    pub platform: Arc<SimulatedPlatform>,
    /// Trusted side and accelerator
    pub tee: SimulatedTee,
}

impl Simulator {
    /// Build the simulated parts
    pub fn new(config: &SimulatorConfig) -> Self {
        let memory = Arc::new(SystemMemory::new(config.capacity, config.fragment_pages));
        let platform = Arc::new(SimulatedPlatform::new());
        let tee = SimulatedTee::new(
            Arc::clone(&memory),
            Arc::clone(&platform),
            config.target_id,
            config.latency,
            config.reject_signatures,
        );
        Self {
            memory,
            platform,
            tee,
        }
    }

    /// Attach a driver to the simulated parts
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be brought up.
    pub fn attach(&self, config: DriverConfig) -> Result<Device> {
        let memory: Arc<dyn MemoryProvider> = self.memory.clone();
        let platform: Arc<dyn Platform> = self.platform.clone();
        let endpoint: Arc<dyn TrustedEndpoint> = Arc::new(self.tee.clone());
        Device::attach(config, memory, platform, endpoint)
    }
}
