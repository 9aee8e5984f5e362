//! Statistics and read-only reports

use crate::coordinator::RunReport;
use crate::error::{NpuError, Result};
use crate::protocol::NpuMode;
use npu_models::LayerProfile;
use std::fmt;
use std::time::Duration;

/// Per-network run counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Completed runs
    pub inferences: u64,
    /// Failed runs
    pub failures: u64,
    /// Summed latency of completed runs
    pub total_time: Duration,
    /// Latency of the last completed run
    pub last_latency: Option<Duration>,
    /// Attached buffers
    pub attached_buffers: usize,
    /// Bytes across attached buffers
    pub attached_bytes: usize,
}

impl NetworkStats {
    /// Account for one run attempt
    pub fn record(&mut self, outcome: &Result<RunReport>) {
        match outcome {
            Ok(report) => {
                self.inferences += 1;
                self.total_time += report.latency;
                self.last_latency = Some(report.latency);
            }
            Err(_) => self.failures += 1,
        }
    }

    /// Mean latency of completed runs
    pub fn mean_latency(&self) -> Option<Duration> {
        u32::try_from(self.inferences)
            .ok()
            .filter(|&n| n > 0)
            .map(|n| self.total_time / n)
    }
}

/// Device-wide run counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Completed runs
    pub inferences: u64,
    /// Failed runs
    pub failures: u64,
    /// Failed runs that were hardware faults
    pub faults: u64,
    /// Summed latency of completed runs
    pub total_time: Duration,
    /// Networks created over the device lifetime
    pub networks_created: u64,
    /// Buffers created over the device lifetime
    pub buffers_created: u64,
}

impl DeviceStats {
    /// Account for one run attempt
    pub fn record(&mut self, outcome: &Result<RunReport>) {
        match outcome {
            Ok(report) => {
                self.inferences += 1;
                self.total_time += report.latency;
            }
            Err(NpuError::HardwareFault { .. }) => {
                self.failures += 1;
                self.faults += 1;
            }
            Err(_) => self.failures += 1,
        }
    }
}

/// Snapshot of one network
#[derive(Debug, Clone)]
pub struct NetworkReport {
    /// Network name
    pub name: String,
    /// Secure network
    pub secure: bool,
    /// Code buffer bytes
    pub code_size: usize,
    /// Pool bytes
    pub pool_size: usize,
    /// Page-table bytes
    pub page_table_size: usize,
    /// Declared input slots
    pub input_slots: u32,
    /// Declared output slots
    pub output_slots: u32,
    /// Run counters
    pub stats: NetworkStats,
    /// Per-layer profile, empty unless profiling
    pub layers: Vec<LayerProfile>,
}

fn micros(d: Duration) -> u128 {
    d.as_micros()
}

impl fmt::Display for NetworkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Network '{}'{}", self.name, if self.secure { " (secure)" } else { "" })?;
        writeln!(
            f,
            "  memory:      code {} B, pool {} B, page tables {} B",
            self.code_size, self.pool_size, self.page_table_size
        )?;
        writeln!(f, "  slots:       {} in, {} out", self.input_slots, self.output_slots)?;
        writeln!(
            f,
            "  attachments: {} ({} B)",
            self.stats.attached_buffers, self.stats.attached_bytes
        )?;
        writeln!(
            f,
            "  runs:        {} ok, {} failed",
            self.stats.inferences, self.stats.failures
        )?;
        if let Some(last) = self.stats.last_latency {
            writeln!(
                f,
                "  latency:     last {} us, mean {} us",
                micros(last),
                self.stats.mean_latency().map_or(0, micros)
            )?;
        }

        if !self.layers.is_empty() {
            writeln!(
                f,
                "  {:>6}  {:<28} {:>12} {:>12} {:>10} {:>10} {:>6}",
                "uid", "layer", "cycles", "time (ns)", "in (B)", "out (B)", "ops"
            )?;
            for l in &self.layers {
                writeln!(
                    f,
                    "  {:>6}  {:<28} {:>12} {:>12} {:>10} {:>10} {:>6}",
                    l.uid, l.name, l.cycles, l.time_ns, l.bytes_in, l.bytes_out, l.ops
                )?;
            }
        }
        Ok(())
    }
}

/// Snapshot of one I/O buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Size in bytes
    pub size: usize,
    /// Secure memory
    pub secure: bool,
    /// Cross-session memory id
    pub mem_id: u64,
    /// Live attachments
    pub ref_count: usize,
    /// Host can read and write the buffer
    pub host_mapped: bool,
}

/// Snapshot of the device
#[derive(Debug, Clone)]
pub struct DeviceReport {
    /// Open sessions
    pub sessions: usize,
    /// Session holding the hardware reservation
    pub reserved_by: Option<u64>,
    /// Power enabled
    pub powered: bool,
    /// Accelerator mode, `None` while idle
    pub mode: Option<NpuMode>,
    /// Networks live on the trusted side
    pub trusted_networks: usize,
    /// Run counters
    pub stats: DeviceStats,
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NPU")?;
        writeln!(f, "  power:       {}", if self.powered { "on" } else { "off" })?;
        match self.mode {
            Some(mode) => writeln!(f, "  state:       active ({mode})")?,
            None => writeln!(f, "  state:       idle")?,
        }
        writeln!(f, "  sessions:    {}", self.sessions)?;
        match self.reserved_by {
            Some(id) => writeln!(f, "  reserved:    session {id}")?,
            None => writeln!(f, "  reserved:    no")?,
        }
        writeln!(f, "  networks:    {} live, {} created", self.trusted_networks, self.stats.networks_created)?;
        writeln!(f, "  buffers:     {} created", self.stats.buffers_created)?;
        writeln!(
            f,
            "  runs:        {} ok, {} failed ({} faults), {} us busy",
            self.stats.inferences,
            self.stats.failures,
            self.stats.faults,
            micros(self.stats.total_time)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;

    fn ok(ms: u64) -> Result<RunReport> {
        Ok(RunReport {
            status: npu_chip::irq::DONE,
            latency: Duration::from_millis(ms),
            profile: None,
        })
    }

    #[test]
    fn test_network_stats_record() {
        let mut s = NetworkStats::default();
        s.record(&ok(2));
        s.record(&ok(4));
        s.record(&Err(NpuError::HardwareFault { kind: FaultKind::Timeout }));

        assert_eq!(s.inferences, 2);
        assert_eq!(s.failures, 1);
        assert_eq!(s.last_latency, Some(Duration::from_millis(4)));
        assert_eq!(s.mean_latency(), Some(Duration::from_millis(3)));
    }

    #[test]
    fn test_device_stats_count_faults() {
        let mut s = DeviceStats::default();
        s.record(&Err(NpuError::HardwareFault { kind: FaultKind::BusError }));
        s.record(&Err(NpuError::Busy { holder: 3 }));
        assert_eq!((s.failures, s.faults), (2, 1));
    }

    #[test]
    fn test_network_report_lists_layers() {
        let report = NetworkReport {
            name: "kws".into(),
            secure: false,
            code_size: 4096,
            pool_size: 0,
            page_table_size: 8192,
            input_slots: 1,
            output_slots: 1,
            stats: NetworkStats::default(),
            layers: vec![LayerProfile {
                uid: 4,
                name: "conv_0".into(),
                cycles: 1200,
                ..LayerProfile::default()
            }],
        };
        let text = report.to_string();
        assert!(text.contains("Network 'kws'"));
        assert!(text.contains("conv_0"));
        assert!(text.contains("1200"));
    }
}
