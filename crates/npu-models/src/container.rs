//! Parsed container representation

use crate::error::{ContainerError, Result};
use crate::parser;
use bytes::Bytes;
use npu_chip::container::{
    area_type, exec_mode, security, AREA_RECORD_SIZE, HEADER_SIZE, LAYER_NAME_LEN,
    METADATA_HEADER_SIZE,
};
use npu_chip::container::metadata::{COMPILER_LEN, NAME_LEN};
use std::fmt;
use std::fs;
use std::path::Path;

/// Byte order the accelerator runs the network in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    /// Little-endian accelerator data
    Little,
    /// Big-endian accelerator data
    Big,
}

/// Container protection level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Unsigned, unencrypted
    Plain,
    /// Signed
    Signed,
    /// Encrypted and signed
    Encrypted,
}

impl SecurityMode {
    /// Decode a header tag. Unknown tags are rejected, never coerced.
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            security::PLAIN => Some(Self::Plain),
            security::SIGNED => Some(Self::Signed),
            security::ENCRYPTED => Some(Self::Encrypted),
            _ => None,
        }
    }

    /// Wire tag
    pub const fn tag(self) -> u32 {
        match self {
            Self::Plain => security::PLAIN,
            Self::Signed => security::SIGNED,
            Self::Encrypted => security::ENCRYPTED,
        }
    }

    /// True for every mode except [`SecurityMode::Plain`]
    pub const fn is_secure(self) -> bool {
        !matches!(self, Self::Plain)
    }
}

/// How the network is to be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Plain inference
    Normal,
    /// Inference with per-operation tracing
    Profiling,
}

impl ExecutionMode {
    /// Decode a metadata tag
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            exec_mode::NORMAL => Some(Self::Normal),
            exec_mode::PROFILING => Some(Self::Profiling),
            _ => None,
        }
    }

    /// Wire tag
    pub const fn tag(self) -> u32 {
        match self {
            Self::Normal => exec_mode::NORMAL,
            Self::Profiling => exec_mode::PROFILING,
        }
    }
}

/// Semantic type of a memory area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaKind {
    /// Working memory pool
    Pool,
    /// On-chip SRAM
    Sram,
    /// Shared on-chip SRAM
    SramShared,
    /// Executable code
    Code,
    /// Initialisation code
    InitCode,
    /// Constant data
    Constant,
    /// Reserved range
    Reserved,
    /// Network input
    Input,
    /// Network output
    Output,
}

impl AreaKind {
    /// Decode an area type tag
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            area_type::POOL => Some(Self::Pool),
            area_type::SRAM => Some(Self::Sram),
            area_type::SRAM_SHARED => Some(Self::SramShared),
            area_type::CODE => Some(Self::Code),
            area_type::INIT_CODE => Some(Self::InitCode),
            area_type::CONSTANT => Some(Self::Constant),
            area_type::RESERVED => Some(Self::Reserved),
            area_type::INPUT => Some(Self::Input),
            area_type::OUTPUT => Some(Self::Output),
            _ => None,
        }
    }

    /// Wire tag
    pub const fn tag(self) -> u32 {
        match self {
            Self::Pool => area_type::POOL,
            Self::Sram => area_type::SRAM,
            Self::SramShared => area_type::SRAM_SHARED,
            Self::Code => area_type::CODE,
            Self::InitCode => area_type::INIT_CODE,
            Self::Constant => area_type::CONSTANT,
            Self::Reserved => area_type::RESERVED,
            Self::Input => area_type::INPUT,
            Self::Output => area_type::OUTPUT,
        }
    }
}

impl fmt::Display for AreaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pool => "pool",
            Self::Sram => "sram",
            Self::SramShared => "sram-shared",
            Self::Code => "code",
            Self::InitCode => "init-code",
            Self::Constant => "constant",
            Self::Reserved => "reserved",
            Self::Input => "input",
            Self::Output => "output",
        };
        f.write_str(name)
    }
}

/// Fixed container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Accelerator byte order
    pub endianness: Endianness,
    /// Format version
    pub version: u32,
    /// Protection level
    pub security: SecurityMode,
    /// Security-info section length
    pub security_info_len: u32,
    /// Metadata section length
    pub metadata_len: u32,
    /// Auxiliary section length
    pub aux_len: u32,
    /// Code section length
    pub code_len: u32,
}

/// Network metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Target hardware identifier the network was compiled for
    pub target_id: u32,
    /// NUL padded network name
    pub name: [u8; NAME_LEN],
    /// NUL padded compiler identity
    pub compiler: [u8; COMPILER_LEN],
    /// Compiler version word
    pub compiler_version: u32,
    /// Execution mode
    pub exec_mode: ExecutionMode,
    /// Generic memory areas
    pub memory_area_count: u32,
    /// Input areas
    pub input_count: u32,
    /// Output areas
    pub output_count: u32,
}

impl Metadata {
    /// Network name up to the first NUL
    pub fn name(&self) -> String {
        padded_str(&self.name)
    }

    /// Compiler identity up to the first NUL
    pub fn compiler(&self) -> String {
        padded_str(&self.compiler)
    }

    /// Total area records declared across the three tables
    pub fn total_areas(&self) -> u64 {
        u64::from(self.memory_area_count) + u64::from(self.input_count) + u64::from(self.output_count)
    }
}

/// One memory-area record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryArea {
    /// Semantic type
    pub kind: AreaKind,
    /// Device-virtual base address
    pub base: u32,
    /// Size in bytes
    pub size: u32,
    /// Required alignment
    pub alignment: u32,
    /// Page size used by the area
    pub page_size: u32,
}

impl MemoryArea {
    /// Area of `kind` at `base` spanning `size` bytes, page aligned
    pub const fn new(kind: AreaKind, base: u32, size: u32) -> Self {
        Self {
            kind,
            base,
            size,
            alignment: npu_chip::mmu::PAGE_SIZE as u32,
            page_size: npu_chip::mmu::PAGE_SIZE as u32,
        }
    }
}

/// Relocation record. Relocations are applied by the trusted side; the host
/// only carries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Offset of the patched word
    pub offset: u32,
    /// Relocation kind
    pub kind: u32,
    /// Area the target address lives in
    pub area_index: u32,
}

/// Layer table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Numeric layer id
    pub uid: u32,
    /// NUL padded layer name
    pub name: [u8; LAYER_NAME_LEN],
}

impl Layer {
    /// Layer named `name`; longer names are truncated
    pub fn new(uid: u32, name: &str) -> Self {
        Self {
            uid,
            name: pad_str(name),
        }
    }

    /// Layer name up to the first NUL
    pub fn name(&self) -> String {
        padded_str(&self.name)
    }
}

/// Operation table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    /// Index into the layer table of the owning layer
    pub layer_index: u32,
    /// Offset of the operation in the code section
    pub offset: u32,
    /// Size of the operation in the code section
    pub size: u32,
    /// Operation kind tag
    pub kind: u32,
}

/// Decoded auxiliary (profiling) section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxData {
    /// Code relocation entries
    pub code_reloc_count: u32,
    /// Data relocation entries
    pub data_reloc_count: u32,
    /// Both relocation tables, undecoded
    pub relocations: Bytes,
    /// Layer table
    pub layers: Vec<Layer>,
    /// Operation table
    pub operations: Vec<Operation>,
}

/// A validated model container.
///
/// Only [`parser::parse`] constructs one, so holding a `Container` means every
/// structural check passed.
#[derive(Debug, Clone)]
pub struct Container {
    pub(crate) header: ContainerHeader,
    pub(crate) metadata: Metadata,
    pub(crate) areas: Vec<MemoryArea>,
    pub(crate) inputs: Vec<MemoryArea>,
    pub(crate) outputs: Vec<MemoryArea>,
    pub(crate) public_data_len: usize,
    pub(crate) aux: Option<AuxData>,
    pub(crate) data: Bytes,
}

impl Container {
    /// Load and parse a container file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or fails validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        tracing::info!("Loading container from: {}", path.display());

        if !path.exists() {
            return Err(ContainerError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let data = fs::read(path)?;
        parser::parse(&data)
    }

    /// Parse a container from bytes
    ///
    /// # Errors
    ///
    /// Returns error if any structural check fails.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        parser::parse(data)
    }

    /// Header fields
    pub const fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Metadata fields
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Generic memory areas
    pub fn areas(&self) -> &[MemoryArea] {
        &self.areas
    }

    /// Input areas
    pub fn inputs(&self) -> &[MemoryArea] {
        &self.inputs
    }

    /// Output areas
    pub fn outputs(&self) -> &[MemoryArea] {
        &self.outputs
    }

    /// Every area in table order: generic, inputs, outputs
    pub fn all_areas(&self) -> impl Iterator<Item = &MemoryArea> {
        self.areas.iter().chain(&self.inputs).chain(&self.outputs)
    }

    /// Bytes consumed by header, security info and metadata. The auxiliary
    /// section starts here.
    pub const fn public_data_len(&self) -> usize {
        self.public_data_len
    }

    /// Decoded auxiliary section, present for profiling containers
    pub const fn aux(&self) -> Option<&AuxData> {
        self.aux.as_ref()
    }

    /// True if the container asks for a profiling run
    pub fn is_profiling(&self) -> bool {
        self.metadata.exec_mode == ExecutionMode::Profiling
    }

    /// True for signed or encrypted containers
    pub const fn is_secure(&self) -> bool {
        self.header.security.is_secure()
    }

    /// Raw container, as it must be forwarded to the trusted side
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Length of the declared container (trailing bytes excluded)
    pub fn declared_len(&self) -> usize {
        self.public_data_len + self.header.aux_len as usize + self.header.code_len as usize
    }

    /// Opaque security-info section
    pub fn security_info(&self) -> &[u8] {
        &self.data[HEADER_SIZE..HEADER_SIZE + self.header.security_info_len as usize]
    }

    /// Raw auxiliary section
    pub fn aux_bytes(&self) -> &[u8] {
        let start = self.public_data_len;
        &self.data[start..start + self.header.aux_len as usize]
    }

    /// Code section
    pub fn code(&self) -> &[u8] {
        let start = self.public_data_len + self.header.aux_len as usize;
        &self.data[start..start + self.header.code_len as usize]
    }

    /// Size of the area table implied by the counts, in bytes
    pub fn area_table_len(&self) -> usize {
        (self.areas.len() + self.inputs.len() + self.outputs.len()) * AREA_RECORD_SIZE
            + METADATA_HEADER_SIZE
    }

    /// Re-serialize the parsed model.
    ///
    /// Header, metadata, areas and auxiliary tables are re-encoded from the
    /// decoded fields; the opaque sections are copied.
    pub fn to_bytes(&self) -> Vec<u8> {
        crate::builder::encode_container(self)
    }
}

fn padded_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

pub(crate) fn pad_str<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = s.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_mode_tags() {
        assert_eq!(SecurityMode::from_tag(0), Some(SecurityMode::Plain));
        assert_eq!(SecurityMode::from_tag(2), Some(SecurityMode::Encrypted));
        assert_eq!(SecurityMode::from_tag(3), None);
        assert!(!SecurityMode::Plain.is_secure());
        assert!(SecurityMode::Signed.is_secure());
    }

    #[test]
    fn area_kind_roundtrips_every_tag() {
        for tag in 1..=9 {
            let kind = AreaKind::from_tag(tag).unwrap();
            assert_eq!(kind.tag(), tag);
        }
        assert_eq!(AreaKind::from_tag(0), None);
        assert_eq!(AreaKind::from_tag(10), None);
    }

    #[test]
    fn layer_name_is_truncated_and_trimmed() {
        let layer = Layer::new(7, "conv_0");
        assert_eq!(layer.name(), "conv_0");

        let long = "a".repeat(40);
        assert_eq!(Layer::new(1, &long).name().len(), LAYER_NAME_LEN);
    }
}
