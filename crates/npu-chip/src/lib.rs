//! Silicon and contract model for the on-SoC NPU.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a pure
//! description of what the host side of the control plane has to agree on:
//! the EBG container layout, the accelerator MMU geometry, the interrupt
//! status word, and the command set understood by the trusted side.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`container`] | EBG header, metadata, area, auxiliary and trace record layouts |
//! | [`mmu`] | Page granularity and page-table span |
//! | [`irq`] | Completion status bits |
//! | [`tee`] | Trusted application id, command ids, result codes |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod container;
pub mod irq;
pub mod mmu;
pub mod tee;
