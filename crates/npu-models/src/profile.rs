//! Per-layer profiling accumulators
//!
//! A profiling run leaves one [`OpTrace`] record per operation in the trace
//! buffer. [`fold_trace`] attributes each record to the layer its operation
//! belongs to.

use crate::container::{Layer, Operation};
use npu_chip::container::OP_TRACE_RECORD_SIZE;

/// Counters for one layer, summed over every profiling run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerProfile {
    /// Layer id from the layer table
    pub uid: u32,
    /// Layer name
    pub name: String,
    /// Accelerator cycles
    pub cycles: u64,
    /// Wall time in nanoseconds
    pub time_ns: u64,
    /// Bytes read
    pub bytes_in: u64,
    /// Bytes written
    pub bytes_out: u64,
    /// Operation records folded in
    pub ops: u64,
}

impl LayerProfile {
    /// Zeroed accumulator for `layer`
    pub fn new(layer: &Layer) -> Self {
        Self {
            uid: layer.uid,
            name: layer.name(),
            ..Self::default()
        }
    }

    fn add(&mut self, trace: &OpTrace) {
        self.cycles = self.cycles.saturating_add(trace.cycles);
        self.time_ns = self.time_ns.saturating_add(trace.time_ns);
        self.bytes_in = self.bytes_in.saturating_add(u64::from(trace.bytes_in));
        self.bytes_out = self.bytes_out.saturating_add(u64::from(trace.bytes_out));
        self.ops += 1;
    }
}

/// One operation trace record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpTrace {
    /// Accelerator cycles
    pub cycles: u64,
    /// Wall time in nanoseconds
    pub time_ns: u64,
    /// Bytes read
    pub bytes_in: u32,
    /// Bytes written
    pub bytes_out: u32,
}

impl OpTrace {
    /// Decode one record
    pub fn from_bytes(raw: &[u8; OP_TRACE_RECORD_SIZE]) -> Self {
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[o..o + 8]);
            u64::from_le_bytes(b)
        };
        let u32_at = |o: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&raw[o..o + 4]);
            u32::from_le_bytes(b)
        };
        Self {
            cycles: u64_at(0),
            time_ns: u64_at(8),
            bytes_in: u32_at(16),
            bytes_out: u32_at(20),
        }
    }

    /// Encode one record
    pub fn to_bytes(&self) -> [u8; OP_TRACE_RECORD_SIZE] {
        let mut out = [0u8; OP_TRACE_RECORD_SIZE];
        out[0..8].copy_from_slice(&self.cycles.to_le_bytes());
        out[8..16].copy_from_slice(&self.time_ns.to_le_bytes());
        out[16..20].copy_from_slice(&self.bytes_in.to_le_bytes());
        out[20..24].copy_from_slice(&self.bytes_out.to_le_bytes());
        out
    }
}

/// Decode up to `count` trace records from a buffer. A short buffer yields
/// fewer records.
pub fn decode_trace(buf: &[u8], count: usize) -> Vec<OpTrace> {
    buf.chunks_exact(OP_TRACE_RECORD_SIZE)
        .take(count)
        .filter_map(|chunk| {
            <&[u8; OP_TRACE_RECORD_SIZE]>::try_from(chunk)
                .ok()
                .map(OpTrace::from_bytes)
        })
        .collect()
}

/// Outcome of one fold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldSummary {
    /// Records attributed to a layer
    pub folded: usize,
    /// Records whose operation names a layer outside the table
    pub skipped: usize,
}

/// Fold trace records into layer accumulators.
///
/// Record `i` belongs to operation `i`. Operations whose layer index is out of
/// range are logged and skipped; the remaining records are still folded.
pub fn fold_trace(layers: &mut [LayerProfile], ops: &[Operation], traces: &[OpTrace]) -> FoldSummary {
    let mut summary = FoldSummary::default();

    for (i, (op, trace)) in ops.iter().zip(traces).enumerate() {
        match layers.get_mut(op.layer_index as usize) {
            Some(layer) => {
                layer.add(trace);
                summary.folded += 1;
            }
            None => {
                tracing::warn!(
                    "Operation {} references layer {} (only {} layers), skipping",
                    i,
                    op.layer_index,
                    layers.len()
                );
                summary.skipped += 1;
            }
        }
    }

    tracing::debug!(
        "Folded {} trace records ({} skipped)",
        summary.folded,
        summary.skipped
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(layer_index: u32) -> Operation {
        Operation { layer_index, offset: 0, size: 0, kind: 1 }
    }

    fn trace(cycles: u64) -> OpTrace {
        OpTrace { cycles, time_ns: cycles * 2, bytes_in: 10, bytes_out: 5 }
    }

    #[test]
    fn test_trace_record_layout() {
        let t = OpTrace { cycles: 1, time_ns: 2, bytes_in: 3, bytes_out: 4 };
        let raw = t.to_bytes();
        assert_eq!(raw[0], 1);
        assert_eq!(raw[8], 2);
        assert_eq!(raw[16], 3);
        assert_eq!(raw[20], 4);
        assert_eq!(OpTrace::from_bytes(&raw), t);
    }

    #[test]
    fn test_decode_short_buffer() {
        let mut buf = trace(5).to_bytes().to_vec();
        buf.extend_from_slice(&[0; 10]);
        assert_eq!(decode_trace(&buf, 4).len(), 1);
    }

    #[test]
    fn test_fold_attributes_by_layer() {
        let mut layers = vec![
            LayerProfile::new(&Layer::new(1, "a")),
            LayerProfile::new(&Layer::new(2, "b")),
        ];
        let ops = [op(0), op(1), op(1)];
        let traces = [trace(100), trace(10), trace(20)];

        let s = fold_trace(&mut layers, &ops, &traces);
        assert_eq!(s, FoldSummary { folded: 3, skipped: 0 });
        assert_eq!(layers[0].cycles, 100);
        assert_eq!(layers[1].cycles, 30);
        assert_eq!(layers[1].ops, 2);
        assert_eq!(layers[1].bytes_in, 20);
    }

    #[test]
    fn test_fold_skips_out_of_range_layer() {
        let mut layers = vec![LayerProfile::new(&Layer::new(1, "only"))];
        let ops = [op(0), op(5), op(0)];
        let traces = [trace(1), trace(1000), trace(2)];

        let s = fold_trace(&mut layers, &ops, &traces);
        assert_eq!(s.skipped, 1);
        assert_eq!(s.folded, 2);
        assert_eq!(layers[0].cycles, 3);
    }
}
