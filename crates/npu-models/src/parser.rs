//! Binary parser for EBG containers
//!
//! Every field is read through a bounds-checked [`Reader`], and every length
//! sum is computed in `u64` so a hostile header cannot wrap an offset.

use crate::container::{
    AreaKind, AuxData, Container, ContainerHeader, Endianness, ExecutionMode, Layer, MemoryArea,
    Metadata, Operation, SecurityMode,
};
use crate::error::{ContainerError, Result};
use bytes::Bytes;
use npu_chip::container::{
    area, header, metadata, AREA_RECORD_SIZE, AUX_COUNTS_SIZE, ENDIANNESS_BIG,
    ENDIANNESS_RESERVED_MASK, HEADER_SIZE, LAYER_NAME_LEN, LAYER_RECORD_SIZE, MAGIC, MAX_AREAS,
    METADATA_HEADER_SIZE, OP_RECORD_SIZE, RELOC_RECORD_SIZE, SUPPORTED_VERSION,
};

/// Little-endian field reader over an untrusted buffer
#[derive(Clone, Copy)]
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn bytes_at<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let end = offset
            .checked_add(N)
            .ok_or_else(|| ContainerError::truncated(usize::MAX, self.data.len()))?;
        let slice = self
            .data
            .get(offset..end)
            .ok_or_else(|| ContainerError::truncated(end, self.data.len()))?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u32_at(&self, offset: usize) -> Result<u32> {
        self.bytes_at::<4>(offset).map(u32::from_le_bytes)
    }
}

/// Narrow a `u64` length known to fit the buffer
fn to_usize(value: u64, actual: usize) -> Result<usize> {
    usize::try_from(value).map_err(|_| ContainerError::truncated(usize::MAX, actual))
}

/// Parse and validate the fixed header
///
/// # Errors
///
/// Returns error if the buffer is shorter than the header or any header field
/// is out of range.
pub fn parse_header(data: &[u8]) -> Result<ContainerHeader> {
    tracing::debug!("Parsing container header ({} bytes)", data.len());

    if data.len() < HEADER_SIZE {
        tracing::error!("Container shorter than header: {} bytes", data.len());
        return Err(ContainerError::truncated(HEADER_SIZE, data.len()));
    }

    let r = Reader::new(data);

    let magic = r.bytes_at::<4>(header::MAGIC)?;
    if magic != MAGIC {
        tracing::error!("Invalid magic bytes: {:02x?}", magic);
        return Err(ContainerError::BadMagic { found: magic });
    }

    let endian_word = r.u32_at(header::ENDIANNESS)?;
    if endian_word & ENDIANNESS_RESERVED_MASK != 0 {
        tracing::error!("Reserved endianness bits set: {:#010x}", endian_word);
        return Err(ContainerError::ReservedBits { word: endian_word });
    }
    let endianness = if endian_word & ENDIANNESS_BIG != 0 {
        Endianness::Big
    } else {
        Endianness::Little
    };

    let version = r.u32_at(header::VERSION)?;
    if version != SUPPORTED_VERSION {
        tracing::error!("Unsupported container version {}", version);
        return Err(ContainerError::UnsupportedVersion { version });
    }

    let security_tag = r.u32_at(header::SECURITY_MODE)?;
    let Some(security) = SecurityMode::from_tag(security_tag) else {
        tracing::error!("Unknown security mode {}", security_tag);
        return Err(ContainerError::UnknownSecurityMode { tag: security_tag });
    };

    let parsed = ContainerHeader {
        endianness,
        version,
        security,
        security_info_len: r.u32_at(header::SECURITY_INFO_LEN)?,
        metadata_len: r.u32_at(header::METADATA_LEN)?,
        aux_len: r.u32_at(header::AUX_LEN)?,
        code_len: r.u32_at(header::CODE_LEN)?,
    };

    tracing::debug!(
        "Header: {:?}, security info {} B, metadata {} B, aux {} B, code {} B",
        parsed.security,
        parsed.security_info_len,
        parsed.metadata_len,
        parsed.aux_len,
        parsed.code_len
    );

    Ok(parsed)
}

/// Parse and validate a complete container
///
/// Either every check passes and a [`Container`] is returned, or the first
/// failing check is reported. Bytes past the declared container are ignored.
///
/// # Errors
///
/// Returns the first [`ContainerError`] encountered.
pub fn parse(data: &[u8]) -> Result<Container> {
    match parse_inner(data) {
        Ok(container) => {
            tracing::info!(
                "Parsed container '{}': {} areas, {} inputs, {} outputs, {:?}",
                container.metadata.name(),
                container.areas.len(),
                container.inputs.len(),
                container.outputs.len(),
                container.metadata.exec_mode
            );
            Ok(container)
        }
        Err(e) => {
            tracing::error!("Container rejected: {}", e);
            Err(e)
        }
    }
}

fn parse_inner(data: &[u8]) -> Result<Container> {
    let hdr = parse_header(data)?;
    let r = Reader::new(data);

    let metadata_start = HEADER_SIZE as u64 + u64::from(hdr.security_info_len);
    let public_end = metadata_start + u64::from(hdr.metadata_len);
    if public_end > data.len() as u64 {
        return Err(ContainerError::truncated(
            to_usize(public_end, data.len())?,
            data.len(),
        ));
    }
    let metadata_start = to_usize(metadata_start, data.len())?;
    let public_data_len = to_usize(public_end, data.len())?;
    let metadata_len = hdr.metadata_len as usize;

    if metadata_len < METADATA_HEADER_SIZE {
        return Err(ContainerError::section_length(
            "metadata",
            metadata_len,
            METADATA_HEADER_SIZE as u64,
        ));
    }

    let m = |off: usize| r.u32_at(metadata_start + off);

    let exec_tag = m(metadata::EXEC_MODE)?;
    let exec_mode = ExecutionMode::from_tag(exec_tag)
        .ok_or(ContainerError::UnknownExecutionMode { tag: exec_tag })?;

    let meta = Metadata {
        target_id: m(metadata::TARGET_ID)?,
        name: r.bytes_at(metadata_start + metadata::NAME)?,
        compiler: r.bytes_at(metadata_start + metadata::COMPILER)?,
        compiler_version: m(metadata::COMPILER_VERSION)?,
        exec_mode,
        memory_area_count: m(metadata::MEMORY_AREA_COUNT)?,
        input_count: m(metadata::INPUT_COUNT)?,
        output_count: m(metadata::OUTPUT_COUNT)?,
    };

    let total_areas = meta.total_areas();
    if total_areas > MAX_AREAS as u64 {
        return Err(ContainerError::TooManyAreas {
            count: total_areas,
            max: MAX_AREAS,
        });
    }

    let expected_len = total_areas * AREA_RECORD_SIZE as u64 + METADATA_HEADER_SIZE as u64;
    if expected_len != metadata_len as u64 {
        return Err(ContainerError::section_length(
            "metadata",
            metadata_len,
            expected_len,
        ));
    }

    tracing::debug!(
        "Metadata: target {:#x}, {} areas + {} inputs + {} outputs",
        meta.target_id,
        meta.memory_area_count,
        meta.input_count,
        meta.output_count
    );

    // Bounded by MAX_AREAS above
    let mut records = Vec::with_capacity(total_areas as usize);
    let table_start = metadata_start + METADATA_HEADER_SIZE;
    for index in 0..total_areas as usize {
        let rec = table_start + index * AREA_RECORD_SIZE;
        let tag = r.u32_at(rec + area::TYPE)?;
        let kind = AreaKind::from_tag(tag).ok_or(ContainerError::UnknownAreaType { index, tag })?;
        records.push(MemoryArea {
            kind,
            base: r.u32_at(rec + area::BASE)?,
            size: r.u32_at(rec + area::SIZE)?,
            alignment: r.u32_at(rec + area::ALIGNMENT)?,
            page_size: r.u32_at(rec + area::PAGE_SIZE)?,
        });
    }

    let outputs = records.split_off((meta.memory_area_count + meta.input_count) as usize);
    let inputs = records.split_off(meta.memory_area_count as usize);
    let areas = records;

    let input_base = areas.len();
    check_category("input", &inputs, AreaKind::Input, input_base)?;
    check_category("output", &outputs, AreaKind::Output, input_base + inputs.len())?;

    let declared = public_end + u64::from(hdr.aux_len) + u64::from(hdr.code_len);
    if declared > data.len() as u64 {
        return Err(ContainerError::truncated(
            to_usize(declared, data.len())?,
            data.len(),
        ));
    }
    let declared = to_usize(declared, data.len())?;

    if declared < data.len() {
        tracing::debug!("Ignoring {} trailing bytes", data.len() - declared);
    }

    let data = Bytes::copy_from_slice(&data[..declared]);

    let aux = if exec_mode == ExecutionMode::Profiling {
        Some(parse_aux(&data, public_data_len, hdr.aux_len as usize)?)
    } else {
        None
    };

    Ok(Container {
        header: hdr,
        metadata: meta,
        areas,
        inputs,
        outputs,
        public_data_len,
        aux,
        data,
    })
}

fn check_category(
    table: &'static str,
    records: &[MemoryArea],
    expected: AreaKind,
    first_index: usize,
) -> Result<()> {
    match records.iter().position(|a| a.kind != expected) {
        Some(pos) => Err(ContainerError::AreaCategory {
            table,
            index: first_index + pos,
            kind: records[pos].kind,
        }),
        None => Ok(()),
    }
}

fn parse_aux(data: &Bytes, start: usize, aux_len: usize) -> Result<AuxData> {
    if aux_len < AUX_COUNTS_SIZE {
        return Err(ContainerError::section_length(
            "auxiliary",
            aux_len,
            AUX_COUNTS_SIZE as u64,
        ));
    }

    let r = Reader::new(&data[start..start + aux_len]);
    let code_reloc_count = r.u32_at(0)?;
    let data_reloc_count = r.u32_at(4)?;
    let layer_count = r.u32_at(8)?;
    let op_count = r.u32_at(12)?;

    let relocs = u64::from(code_reloc_count) + u64::from(data_reloc_count);
    let reloc_bytes = relocs * RELOC_RECORD_SIZE as u64;
    let expected = AUX_COUNTS_SIZE as u64
        + reloc_bytes
        + u64::from(layer_count) * LAYER_RECORD_SIZE as u64
        + u64::from(op_count) * OP_RECORD_SIZE as u64;
    if expected != aux_len as u64 {
        return Err(ContainerError::section_length("auxiliary", aux_len, expected));
    }

    // Sums are bounded by aux_len from here on
    let reloc_bytes = reloc_bytes as usize;
    let relocations = data.slice(start + AUX_COUNTS_SIZE..start + AUX_COUNTS_SIZE + reloc_bytes);

    let mut offset = AUX_COUNTS_SIZE + reloc_bytes;
    let mut layers = Vec::with_capacity(layer_count as usize);
    for _ in 0..layer_count {
        layers.push(Layer {
            uid: r.u32_at(offset)?,
            name: r.bytes_at::<LAYER_NAME_LEN>(offset + 4)?,
        });
        offset += LAYER_RECORD_SIZE;
    }

    let mut operations = Vec::with_capacity(op_count as usize);
    for _ in 0..op_count {
        operations.push(Operation {
            layer_index: r.u32_at(offset)?,
            offset: r.u32_at(offset + 4)?,
            size: r.u32_at(offset + 8)?,
            kind: r.u32_at(offset + 12)?,
        });
        offset += OP_RECORD_SIZE;
    }

    tracing::debug!(
        "Aux: {} code relocs, {} data relocs, {} layers, {} ops",
        code_reloc_count,
        data_reloc_count,
        layers.len(),
        operations.len()
    );

    Ok(AuxData {
        code_reloc_count,
        data_reloc_count,
        relocations,
        layers,
        operations,
    })
}
