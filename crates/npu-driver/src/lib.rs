//! Host-side control plane for an on-SoC NPU behind a trusted execution
//! environment.
//!
//! The normal-world driver never touches accelerator registers. It sizes and
//! allocates memory for a model container, describes that memory to the
//! trusted application as physical region lists, and asks it to load, bind
//! and start networks. Completion arrives as an interrupt whose status the
//! trusted side reads back.
//!
//! # Architecture
//!
//! ```text
//! Session ──▶ SessionRegistry (networks, buffers, attachments)
//!    │
//!    ├──▶ ExecutionCoordinator ──▶ CompletionSignal ◀── interrupt
//!    │            │
//!    └────────────┴──▶ SecureSession ──▶ TeeChannel ──▶ TrustedEndpoint
//! ```
//!
//! Collaborators are traits: [`MemoryProvider`] for device memory,
//! [`Platform`] for power and the interrupt line, [`TrustedEndpoint`] for the
//! trusted application. [`backends::simulated`] implements all three.
//!
//! # Quick start
//!
//! ```no_run
//! use npu_driver::{DriverConfig, Simulator, SimulatorConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sim = Simulator::new(&SimulatorConfig::default());
//! let device = sim.attach(DriverConfig::default())?;
//! let session = device.open_session()?;
//!
//! let network = session.create_network(&std::fs::read("kws.ebg")?)?;
//! let input = session.allocate_buffer(4096, false)?;
//! let attachment = session.attach(network, input)?;
//! session.set_input(network, attachment, 0)?;
//!
//! let report = session.run(network)?;
//! println!("done in {:?}", report.latency);
//! println!("{}", session.network_report(network)?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
pub mod channel;
mod config;
pub mod coordinator;
mod device;
mod error;
pub mod handle;
pub mod memory;
pub mod platform;
pub mod protocol;
pub mod registry;
mod report;
mod session;

pub use backends::{Simulator, SimulatorConfig};
pub use channel::{SharedMemoryChannel, TrustedEndpoint};
pub use config::DriverConfig;
pub use coordinator::{CompletionSignal, ExecutionCoordinator, RunReport};
pub use device::Device;
pub use error::{FaultKind, NpuError, Result};
pub use handle::{Handle, HandleTable};
pub use memory::{ForeignHandle, MemoryKind, MemoryProvider, MemoryRegion, Segment};
pub use platform::{IrqHandler, Platform};
pub use protocol::{NpuMode, Request, Response, SecureSession, SessionState, TeeChannel};
pub use report::{BufferInfo, DeviceReport, DeviceStats, NetworkReport, NetworkStats};
pub use session::Session;

/// Commonly used types
pub mod prelude {
    pub use crate::{
        Device, DriverConfig, FaultKind, Handle, NpuError, Result, RunReport, Session,
        Simulator, SimulatorConfig,
    };
}
