//! Resource sizing
//!
//! Derives from a validated container how much memory the accelerator needs:
//! code buffer, working pool, page tables and the optional profiling trace.
//! Sizing never touches memory; it is a pure function of the container.

use crate::container::{AreaKind, Container, MemoryArea, Operation};
use crate::error::SizingError;
use crate::profile::LayerProfile;
use npu_chip::container::OP_TRACE_RECORD_SIZE;
use npu_chip::mmu::{page_align, PAGE_TABLE_SIZE, ROOT_TABLES, TABLE_SPAN};

/// How page tables are counted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageTableStrategy {
    /// One table per started 4 MiB of each area's size, plus the root.
    /// Never undercounts, may overcount when areas share a span.
    #[default]
    Conservative,
    /// One table per distinct 4 MiB span touched by any area, plus the root
    Precise,
}

/// Memory the accelerator needs to run one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// Container is signed or encrypted
    pub secure: bool,
    /// Code buffer size, page aligned
    pub code_size: usize,
    /// Working pool size, page aligned (0 without a pool area)
    pub pool_size: usize,
    /// Number of page tables, root included
    pub page_tables: usize,
    /// Page-table buffer size, page aligned
    pub page_table_size: usize,
    /// Container requests profiling
    pub profiling: bool,
    /// Layers in the layer table
    pub layer_count: usize,
    /// Operations in the operation table
    pub op_count: usize,
    /// Operation trace buffer size, page aligned (0 unless profiling)
    pub profile_buffer_size: usize,
    /// Zeroed per-layer accumulators
    pub layers: Vec<LayerProfile>,
    /// Operation table, used to attribute trace records to layers
    pub operations: Vec<Operation>,
}

/// Sizes containers with a fixed page-table strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSizer {
    strategy: PageTableStrategy,
}

impl ResourceSizer {
    /// Sizer using `strategy`
    pub const fn new(strategy: PageTableStrategy) -> Self {
        Self { strategy }
    }

    /// Page-table strategy in use
    pub const fn strategy(&self) -> PageTableStrategy {
        self.strategy
    }

    /// Derive the resource descriptor for `container`
    ///
    /// # Errors
    ///
    /// Returns error if the generic area table does not hold exactly one code
    /// area and at most one pool, or a size computation overflows.
    pub fn size(&self, container: &Container) -> Result<ResourceDescriptor, SizingError> {
        let code = unique_area(container.areas(), AreaKind::Code)?.ok_or_else(|| {
            tracing::error!("Container '{}' has no code area", container.metadata().name());
            SizingError::MissingCodeArea
        })?;
        let pool = unique_area(container.areas(), AreaKind::Pool)?;

        let code_size = align(code.size as usize, "code size")?;
        let pool_size = match pool {
            Some(p) => align(p.size as usize, "pool size")?,
            None => 0,
        };

        let page_tables = match self.strategy {
            PageTableStrategy::Conservative => conservative_tables(container.all_areas())?,
            PageTableStrategy::Precise => precise_tables(container.all_areas()),
        };
        let page_table_size = page_tables
            .checked_mul(PAGE_TABLE_SIZE)
            .and_then(page_align)
            .ok_or_else(|| SizingError::overflow("page-table size"))?;

        let profiling = container.is_profiling();
        let (layers, operations) = match container.aux() {
            Some(aux) if profiling => (
                aux.layers.iter().map(LayerProfile::new).collect::<Vec<_>>(),
                aux.operations.clone(),
            ),
            _ => (Vec::new(), Vec::new()),
        };

        let profile_buffer_size = if profiling {
            let raw = operations
                .len()
                .checked_mul(OP_TRACE_RECORD_SIZE)
                .ok_or_else(|| SizingError::overflow("trace buffer"))?;
            align(raw, "trace buffer")?
        } else {
            0
        };

        let desc = ResourceDescriptor {
            secure: container.is_secure(),
            code_size,
            pool_size,
            page_tables,
            page_table_size,
            profiling,
            layer_count: layers.len(),
            op_count: operations.len(),
            profile_buffer_size,
            layers,
            operations,
        };

        tracing::debug!(
            "Sized '{}' ({:?}): code {} B, pool {} B, {} page tables, trace {} B",
            container.metadata().name(),
            self.strategy,
            desc.code_size,
            desc.pool_size,
            desc.page_tables,
            desc.profile_buffer_size
        );

        Ok(desc)
    }
}

fn align(value: usize, what: &'static str) -> Result<usize, SizingError> {
    page_align(value).ok_or_else(|| SizingError::overflow(what))
}

fn unique_area(areas: &[MemoryArea], kind: AreaKind) -> Result<Option<&MemoryArea>, SizingError> {
    let mut found = areas.iter().filter(|a| a.kind == kind);
    let first = found.next();
    if found.next().is_some() {
        tracing::error!("Container declares more than one {} area", kind);
        return Err(SizingError::DuplicateArea { kind });
    }
    Ok(first)
}

fn conservative_tables<'a>(
    mut areas: impl Iterator<Item = &'a MemoryArea>,
) -> Result<usize, SizingError> {
    areas.try_fold(ROOT_TABLES, |acc, a| {
        acc.checked_add((a.size as usize).div_ceil(TABLE_SPAN))
            .ok_or_else(|| SizingError::overflow("page-table count"))
    })
}

fn precise_tables<'a>(areas: impl Iterator<Item = &'a MemoryArea>) -> usize {
    let span = TABLE_SPAN as u64;
    let mut ranges: Vec<(u64, u64)> = areas
        .filter(|a| a.size > 0)
        .map(|a| {
            let start = u64::from(a.base);
            let end = start + u64::from(a.size) - 1;
            (start / span, end / span)
        })
        .collect();
    ranges.sort_unstable();

    let mut spans = 0u64;
    let mut covered: Option<u64> = None;
    for (first, last) in ranges {
        let from = match covered {
            Some(c) if c >= first => c + 1,
            _ => first,
        };
        if last >= from {
            spans += last - from + 1;
        }
        covered = Some(covered.map_or(last, |c| c.max(last)));
    }

    // At most 64 areas over a 32-bit address space
    ROOT_TABLES + spans as usize
}
