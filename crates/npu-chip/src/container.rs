//! EBG container wire format.
//!
//! All multi-byte fields are little-endian and records carry no padding.
//!
//! ```text
//! ┌────────────┬───────────────┬──────────┬───────────┬──────┐
//! │ header 32B │ security info │ metadata │ auxiliary │ code │
//! └────────────┴───────────────┴──────────┴───────────┴──────┘
//!  \__________ public data ____________/
//! ```
//!
//! The metadata section is a fixed 72-byte header followed by
//! `memory_area_count + input_count + output_count` area records. The
//! auxiliary section is only meaningful when the execution mode requests
//! profiling.

/// Magic tag at offset 0.
pub const MAGIC: [u8; 4] = *b"EBGX";

/// The only container version this control plane accepts.
pub const SUPPORTED_VERSION: u32 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 32;

/// Header field offsets.
pub mod header {
    /// Magic tag (4 bytes).
    pub const MAGIC: usize = 0;
    /// Endianness flag word.
    pub const ENDIANNESS: usize = 4;
    /// Format version.
    pub const VERSION: usize = 8;
    /// Security mode tag.
    pub const SECURITY_MODE: usize = 12;
    /// Security-info section length.
    pub const SECURITY_INFO_LEN: usize = 16;
    /// Metadata section length.
    pub const METADATA_LEN: usize = 20;
    /// Auxiliary section length.
    pub const AUX_LEN: usize = 24;
    /// Code section length.
    pub const CODE_LEN: usize = 28;
}

/// Bit 0 of the endianness word selects the accelerator byte order.
pub const ENDIANNESS_BIG: u32 = 1 << 0;

/// Every other bit of the endianness word is reserved and must be zero.
pub const ENDIANNESS_RESERVED_MASK: u32 = !ENDIANNESS_BIG;

/// Security mode tags.
pub mod security {
    /// Unsigned, unencrypted container.
    pub const PLAIN: u32 = 0;
    /// Signed container; the trusted side checks the signature.
    pub const SIGNED: u32 = 1;
    /// Encrypted and signed container.
    pub const ENCRYPTED: u32 = 2;
}

/// Execution mode tags.
pub mod exec_mode {
    /// Plain inference.
    pub const NORMAL: u32 = 0;
    /// Inference with per-operation tracing.
    pub const PROFILING: u32 = 1;
}

/// Metadata header size in bytes (precedes the area records).
pub const METADATA_HEADER_SIZE: usize = 72;

/// Metadata header field offsets, relative to the start of the section.
pub mod metadata {
    /// Target hardware identifier.
    pub const TARGET_ID: usize = 0;
    /// Network name, NUL padded.
    pub const NAME: usize = 4;
    /// Length of [`NAME`].
    pub const NAME_LEN: usize = 32;
    /// Compiler identity, NUL padded.
    pub const COMPILER: usize = 36;
    /// Length of [`COMPILER`].
    pub const COMPILER_LEN: usize = 16;
    /// Compiler version word.
    pub const COMPILER_VERSION: usize = 52;
    /// Execution mode tag.
    pub const EXEC_MODE: usize = 56;
    /// Number of generic memory areas.
    pub const MEMORY_AREA_COUNT: usize = 60;
    /// Number of input areas.
    pub const INPUT_COUNT: usize = 64;
    /// Number of output areas.
    pub const OUTPUT_COUNT: usize = 68;
}

/// Size of one memory-area record.
pub const AREA_RECORD_SIZE: usize = 20;

/// Upper bound on `memory_area_count + input_count + output_count`.
pub const MAX_AREAS: usize = 64;

/// Memory-area record field offsets.
pub mod area {
    /// Type tag.
    pub const TYPE: usize = 0;
    /// Device-virtual base address.
    pub const BASE: usize = 4;
    /// Size in bytes.
    pub const SIZE: usize = 8;
    /// Required alignment.
    pub const ALIGNMENT: usize = 12;
    /// Page size used by the area.
    pub const PAGE_SIZE: usize = 16;
}

/// Memory-area type tags.
pub mod area_type {
    /// Working memory pool.
    pub const POOL: u32 = 1;
    /// On-chip SRAM.
    pub const SRAM: u32 = 2;
    /// On-chip SRAM shared between cores.
    pub const SRAM_SHARED: u32 = 3;
    /// Executable code.
    pub const CODE: u32 = 4;
    /// Initialisation code.
    pub const INIT_CODE: u32 = 5;
    /// Constant (weight) data.
    pub const CONSTANT: u32 = 6;
    /// Reserved address range.
    pub const RESERVED: u32 = 7;
    /// Network input.
    pub const INPUT: u32 = 8;
    /// Network output.
    pub const OUTPUT: u32 = 9;
}

/// Size of the auxiliary count header (four u32 counts).
pub const AUX_COUNTS_SIZE: usize = 16;

/// Size of one relocation record (offset, kind, area index).
pub const RELOC_RECORD_SIZE: usize = 12;

/// Size of one layer record.
pub const LAYER_RECORD_SIZE: usize = 32;

/// Length of the NUL padded name in a layer record.
pub const LAYER_NAME_LEN: usize = 28;

/// Size of one operation record.
pub const OP_RECORD_SIZE: usize = 16;

/// Size of one operation trace record written by the accelerator.
pub const OP_TRACE_RECORD_SIZE: usize = 24;

/// Operation kind tags found in the operation table.
pub mod op_kind {
    /// Convolution.
    pub const CONV: u32 = 1;
    /// Pooling.
    pub const POOL: u32 = 2;
    /// Element-wise arithmetic.
    pub const ELEMENTWISE: u32 = 3;
    /// Fully connected.
    pub const FULLY_CONNECTED: u32 = 4;
    /// DMA transfer.
    pub const DMA: u32 = 5;
}
