//! Backend implementations of the collaborator traits
//!
//! Production deployments plug in the platform's memory framework, power
//! and interrupt services and the real trusted-side client. The simulated
//! backend implements all three in-process so the whole control plane runs
//! in CI without hardware.

pub mod simulated;

pub use simulated::{Simulator, SimulatorConfig};
