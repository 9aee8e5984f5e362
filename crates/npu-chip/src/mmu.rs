//! Accelerator MMU geometry.
//!
//! The accelerator translates through two-level tables. A root table indexes
//! second-level tables, each of which maps [`ENTRIES_PER_TABLE`] pages.

/// Accelerator page granularity. Every buffer handed to the trusted side is
/// aligned to this size.
pub const PAGE_SIZE: usize = 4096;

/// Size of one page table in bytes.
pub const PAGE_TABLE_SIZE: usize = 4096;

/// Pages mapped by one second-level table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Bytes of device address space mapped by one second-level table (4 MiB).
pub const TABLE_SPAN: usize = PAGE_SIZE * ENTRIES_PER_TABLE;

/// Tables always reserved for the root index.
pub const ROOT_TABLES: usize = 1;

/// Round `value` up to the accelerator page size.
///
/// Returns `None` on overflow.
#[must_use]
pub const fn page_align(value: usize) -> Option<usize> {
    match value.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// True if `value` is a multiple of the accelerator page size.
#[must_use]
pub const fn is_page_aligned(value: usize) -> bool {
    value % PAGE_SIZE == 0
}
