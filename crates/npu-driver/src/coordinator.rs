//! Execution coordinator
//!
//! Drives one network execution at a time: activate the accelerator if it is
//! idle, start the network, wait for the completion interrupt under a
//! timeout, classify the outcome and fold profiling traces.
//!
//! The hardware lock is held for the whole execution, so at most one network
//! runs on the accelerator at any instant. A fault always leaves the
//! accelerator deactivated.

use crate::error::{FaultKind, NpuError, Result};
use crate::protocol::{NpuMode, SecureSession};
use crate::registry::Network;
use npu_chip::irq;
use npu_models::{decode_trace, fold_trace, FoldSummary};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Completion status handed from the interrupt handler to the waiting run
#[derive(Debug, Default)]
pub struct CompletionSignal {
    status: Mutex<Option<u32>>,
    cond: Condvar,
}

impl CompletionSignal {
    /// Forget any previous completion
    pub fn reset(&self) {
        *self.status.lock() = None;
    }

    /// Publish `status` and wake the waiter
    pub fn complete(&self, status: u32) {
        *self.status.lock() = Some(status);
        self.cond.notify_all();
    }

    /// Wait up to `timeout` for a completion
    pub fn wait(&self, timeout: Duration) -> Option<u32> {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        while status.is_none() {
            if self.cond.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }
        status.take()
    }
}

/// Accelerator state guarded by the hardware lock
#[derive(Debug, Default)]
pub struct HwState {
    /// Mode the accelerator was activated in, `None` while idle
    pub mode: Option<NpuMode>,
    /// Executions started
    pub starts: u64,
}

/// Outcome of a completed execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Interrupt status word
    pub status: u32,
    /// Time from StartNetwork to completion
    pub latency: Duration,
    /// Trace records folded, profiling networks only
    pub profile: Option<FoldSummary>,
}

/// Map the waited-for status to success or a fault
///
/// # Errors
///
/// Returns the fault a missing, empty or fault-flagged status denotes.
pub fn classify(status: Option<u32>) -> std::result::Result<u32, FaultKind> {
    match status {
        None => Err(FaultKind::Timeout),
        Some(0) => Err(FaultKind::SpuriousInterrupt),
        Some(s) if s & irq::BUS_ERROR != 0 => Err(FaultKind::BusError),
        Some(s) if s & irq::MMU_EXCEPTION != 0 => Err(FaultKind::MmuException),
        Some(s) => Ok(s),
    }
}

/// Borrowed view of the device parts an execution needs
pub struct ExecutionCoordinator<'a> {
    hw: &'a Mutex<HwState>,
    secure: &'a Mutex<SecureSession>,
    completion: &'a CompletionSignal,
    timeout: Duration,
}

impl<'a> ExecutionCoordinator<'a> {
    /// Coordinator over the device's hardware lock, secure session and
    /// completion signal
    pub fn new(
        hw: &'a Mutex<HwState>,
        secure: &'a Mutex<SecureSession>,
        completion: &'a CompletionSignal,
        timeout: Duration,
    ) -> Self {
        Self {
            hw,
            secure,
            completion,
            timeout,
        }
    }

    /// Run `network` once and wait for it.
    ///
    /// Statistics are left to the caller.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if activation or start is rejected, or a
    /// hardware fault after the accelerator has been deactivated.
    pub fn execute(&self, network: &mut Network) -> Result<RunReport> {
        let mode = NpuMode::for_network(network.resources.secure);
        let mut hw = self.hw.lock();

        match hw.mode {
            Some(current) if current == mode => {}
            Some(current) => {
                info!("Switching NPU from {} to {} mode", current, mode);
                self.secure.lock().deactivate()?;
                hw.mode = None;
                self.secure.lock().activate(mode)?;
                hw.mode = Some(mode);
            }
            None => {
                self.secure.lock().activate(mode)?;
                hw.mode = Some(mode);
                debug!("NPU activated ({})", mode);
            }
        }

        self.completion.reset();
        let start = Instant::now();
        self.secure.lock().start_network(network.trusted_id)?;
        hw.starts += 1;

        let status = self.completion.wait(self.timeout);
        let latency = start.elapsed();

        let status = match classify(status) {
            Ok(status) => status,
            Err(kind) => {
                error!(
                    "Network '{}' faulted after {:?}: {}",
                    network.name, latency, kind
                );
                self.recover(&mut hw);
                return Err(NpuError::HardwareFault { kind });
            }
        };

        let profile = if network.resources.profiling {
            Some(self.fold_profile(network)?)
        } else {
            None
        };

        debug!(
            "Network '{}' completed in {:?} (status {:#010x})",
            network.name, latency, status
        );
        Ok(RunReport {
            status,
            latency,
            profile,
        })
    }

    /// Dump and deactivate after a fault. Leaves the accelerator idle even
    /// if the trusted side rejects either command.
    fn recover(&self, hw: &mut HwState) {
        let mut secure = self.secure.lock();
        if let Err(e) = secure.dump_state() {
            warn!("State dump failed: {}", e);
        }
        if let Err(e) = secure.deactivate() {
            warn!("Deactivation after fault failed: {}", e);
        }
        hw.mode = None;
    }

    fn fold_profile(&self, network: &mut Network) -> Result<FoldSummary> {
        let ops = network.resources.op_count;
        let Some(region) = network.regions.profile.as_ref() else {
            warn!("Profiling network '{}' has no trace buffer", network.name);
            return Ok(FoldSummary::default());
        };
        let len = ops * npu_chip::container::OP_TRACE_RECORD_SIZE;
        let raw = region.read_vec(0, len)?;
        let traces = decode_trace(&raw, ops);
        Ok(fold_trace(
            &mut network.layers,
            &network.resources.operations,
            &traces,
        ))
    }

    /// Deactivate the accelerator if it is active
    ///
    /// # Errors
    ///
    /// Returns error if the trusted side rejects the deactivation; the
    /// accelerator is recorded idle regardless.
    pub fn deactivate(&self) -> Result<()> {
        let mut hw = self.hw.lock();
        if hw.mode.take().is_some() {
            self.secure.lock().deactivate()?;
            debug!("NPU deactivated");
        }
        Ok(())
    }
}
