//! Error types for container parsing and resource sizing

use crate::container::AreaKind;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for container operations
pub type Result<T> = std::result::Result<T, ContainerError>;

/// A container failed structural validation.
///
/// Always terminal for the parse attempt: no part of a container that
/// produced one of these is ever handed to a caller.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// File not found or cannot be read
    #[error("Container file not found: {path}")]
    FileNotFound {
        /// Path that was attempted
        path: PathBuf,
    },

    /// Buffer ends before a declared structure
    #[error("Container truncated: need {needed} bytes, have {actual}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes supplied
        actual: usize,
    },

    /// Magic tag mismatch
    #[error("Invalid container magic: {found:02x?} (expected \"EBGX\")")]
    BadMagic {
        /// Tag found at offset 0
        found: [u8; 4],
    },

    /// Reserved endianness bits set
    #[error("Reserved endianness bits set: {word:#010x}")]
    ReservedBits {
        /// Raw endianness word
        word: u32,
    },

    /// Unsupported format version
    #[error("Unsupported container version: {version} (expected 1)")]
    UnsupportedVersion {
        /// Version found in the header
        version: u32,
    },

    /// Unknown security mode tag
    #[error("Unknown security mode: {tag}")]
    UnknownSecurityMode {
        /// Raw tag
        tag: u32,
    },

    /// Unknown execution mode tag
    #[error("Unknown execution mode: {tag}")]
    UnknownExecutionMode {
        /// Raw tag
        tag: u32,
    },

    /// Area table larger than the control plane will allocate for
    #[error("Too many memory areas: {count} (max {max})")]
    TooManyAreas {
        /// Declared total
        count: u64,
        /// Accepted maximum
        max: usize,
    },

    /// Declared section length disagrees with its contents
    #[error("{section} section length {declared} does not match contents ({expected} bytes)")]
    SectionLength {
        /// Section name
        section: &'static str,
        /// Length declared in the header
        declared: usize,
        /// Length implied by the counts
        expected: u64,
    },

    /// Area record with an unknown type tag
    #[error("Memory area {index}: unknown type tag {tag}")]
    UnknownAreaType {
        /// Record index in table order
        index: usize,
        /// Raw tag
        tag: u32,
    },

    /// Area record in the wrong table
    #[error("Memory area {index} in {table} table carries {kind} tag")]
    AreaCategory {
        /// Table the record belongs to
        table: &'static str,
        /// Record index in table order
        index: usize,
        /// Tag found
        kind: AreaKind,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl ContainerError {
    /// Create a truncation error
    pub fn truncated(needed: usize, actual: usize) -> Self {
        Self::Truncated { needed, actual }
    }

    /// Create a section length error
    pub fn section_length(section: &'static str, declared: usize, expected: u64) -> Self {
        Self::SectionLength {
            section,
            declared,
            expected,
        }
    }
}

/// Resource sizing failed for an otherwise valid container.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizingError {
    /// The container has no code area
    #[error("Container declares no code area")]
    MissingCodeArea,

    /// More than one area of a kind that must be unique
    #[error("Container declares more than one {kind} area")]
    DuplicateArea {
        /// Duplicated kind
        kind: AreaKind,
    },

    /// A size computation overflowed
    #[error("Size overflow computing {what}")]
    Overflow {
        /// Quantity being computed
        what: &'static str,
    },
}

impl SizingError {
    /// Create an overflow error
    pub fn overflow(what: &'static str) -> Self {
        Self::Overflow { what }
    }
}
