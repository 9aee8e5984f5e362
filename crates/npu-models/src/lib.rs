#![deny(unsafe_code)]

//! EBG model container support for the NPU control plane.
//!
//! This crate turns an untrusted container buffer into a validated
//! [`Container`], derives the memory the accelerator needs to run it
//! ([`ResourceDescriptor`]), and folds per-operation traces back into
//! per-layer profiling accumulators.
//!
//! # Format
//!
//! See [`npu_chip::container`] for the bit-exact layout:
//!
//! - **Header** (32 bytes): magic `EBGX`, endianness, version, security mode,
//!   four section lengths
//! - **Security info**: opaque to the host, checked by the trusted side
//! - **Metadata**: target, names, execution mode, memory-area table
//! - **Auxiliary**: relocation, layer and operation tables (profiling only)
//! - **Code**: copied by the trusted side into the code buffer
//!
//! # Example
//!
//! ```no_run
//! use npu_models::{Container, ResourceSizer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let container = Container::from_file("mobilenet.ebg")?;
//! let resources = ResourceSizer::default().size(&container)?;
//!
//! println!("{}: code {} B, pool {} B, page tables {} B",
//!          container.metadata().name(),
//!          resources.code_size, resources.pool_size, resources.page_table_size);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod builder;
mod container;
mod error;
mod parser;
mod profile;
mod sizing;

pub use builder::ContainerBuilder;
pub use container::{
    AreaKind, AuxData, Container, ContainerHeader, Endianness, ExecutionMode, Layer, MemoryArea,
    Metadata, Operation, Relocation, SecurityMode,
};
pub use error::{ContainerError, Result, SizingError};
pub use parser::{parse, parse_header};
pub use profile::{decode_trace, fold_trace, FoldSummary, LayerProfile, OpTrace};
pub use sizing::{PageTableStrategy, ResourceDescriptor, ResourceSizer};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        Container, ContainerBuilder, ContainerError, LayerProfile, PageTableStrategy,
        ResourceDescriptor, ResourceSizer,
    };
}
