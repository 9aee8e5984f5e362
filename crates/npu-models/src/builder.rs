//! Container serialization
//!
//! [`ContainerBuilder`] assembles a container from typed parts. It is what the
//! CLI `build` command and the test suites use to produce inputs, and it
//! shares its encoders with [`Container::to_bytes`].

use crate::container::{
    pad_str, AuxData, Container, ContainerHeader, Endianness, ExecutionMode, Layer, MemoryArea,
    Metadata, Operation, Relocation, SecurityMode,
};
use npu_chip::container::{
    AREA_RECORD_SIZE, AUX_COUNTS_SIZE, ENDIANNESS_BIG, HEADER_SIZE, LAYER_RECORD_SIZE, MAGIC,
    METADATA_HEADER_SIZE, OP_RECORD_SIZE, RELOC_RECORD_SIZE, SUPPORTED_VERSION,
};

/// Builder for EBG containers
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    name: String,
    compiler: String,
    compiler_version: u32,
    target_id: u32,
    endianness: Endianness,
    security: SecurityMode,
    exec_mode: ExecutionMode,
    security_info: Vec<u8>,
    areas: Vec<MemoryArea>,
    inputs: Vec<MemoryArea>,
    outputs: Vec<MemoryArea>,
    code_relocs: Vec<Relocation>,
    data_relocs: Vec<Relocation>,
    layers: Vec<Layer>,
    operations: Vec<Operation>,
    code: Vec<u8>,
}

impl ContainerBuilder {
    /// Start a plain, normal-mode, little-endian container named `name`
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            compiler: "npuc".to_string(),
            compiler_version: 1,
            target_id: 0,
            endianness: Endianness::Little,
            security: SecurityMode::Plain,
            exec_mode: ExecutionMode::Normal,
            security_info: Vec::new(),
            areas: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            code_relocs: Vec::new(),
            data_relocs: Vec::new(),
            layers: Vec::new(),
            operations: Vec::new(),
            code: Vec::new(),
        }
    }

    /// Target hardware id
    pub fn target(mut self, target_id: u32) -> Self {
        self.target_id = target_id;
        self
    }

    /// Compiler identity
    pub fn compiler(mut self, name: &str, version: u32) -> Self {
        self.compiler = name.to_string();
        self.compiler_version = version;
        self
    }

    /// Accelerator byte order
    pub fn endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    /// Security mode and its opaque security-info payload
    pub fn security(mut self, mode: SecurityMode, info: Vec<u8>) -> Self {
        self.security = mode;
        self.security_info = info;
        self
    }

    /// Request a profiling run. The auxiliary section is only emitted for
    /// profiling containers.
    pub fn profiling(mut self, enabled: bool) -> Self {
        self.exec_mode = if enabled {
            ExecutionMode::Profiling
        } else {
            ExecutionMode::Normal
        };
        self
    }

    /// Append a generic memory area
    pub fn area(mut self, area: MemoryArea) -> Self {
        self.areas.push(area);
        self
    }

    /// Append an input area
    pub fn input(mut self, area: MemoryArea) -> Self {
        self.inputs.push(area);
        self
    }

    /// Append an output area
    pub fn output(mut self, area: MemoryArea) -> Self {
        self.outputs.push(area);
        self
    }

    /// Code and data relocation tables
    pub fn relocations(mut self, code: Vec<Relocation>, data: Vec<Relocation>) -> Self {
        self.code_relocs = code;
        self.data_relocs = data;
        self
    }

    /// Append a layer table entry
    pub fn layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Append an operation table entry
    pub fn operation(mut self, op: Operation) -> Self {
        self.operations.push(op);
        self
    }

    /// Code section payload
    pub fn code(mut self, code: Vec<u8>) -> Self {
        self.code = code;
        self
    }

    /// Serialize the container
    pub fn build(self) -> Vec<u8> {
        let mut relocs = Vec::with_capacity(
            (self.code_relocs.len() + self.data_relocs.len()) * RELOC_RECORD_SIZE,
        );
        for r in self.code_relocs.iter().chain(&self.data_relocs) {
            put_u32(&mut relocs, r.offset);
            put_u32(&mut relocs, r.kind);
            put_u32(&mut relocs, r.area_index);
        }

        let mut aux = Vec::new();
        if self.exec_mode == ExecutionMode::Profiling {
            encode_aux(
                &mut aux,
                self.code_relocs.len() as u32,
                self.data_relocs.len() as u32,
                &relocs,
                &self.layers,
                &self.operations,
            );
        }

        let metadata = Metadata {
            target_id: self.target_id,
            name: pad_str(&self.name),
            compiler: pad_str(&self.compiler),
            compiler_version: self.compiler_version,
            exec_mode: self.exec_mode,
            memory_area_count: self.areas.len() as u32,
            input_count: self.inputs.len() as u32,
            output_count: self.outputs.len() as u32,
        };
        let metadata_len =
            METADATA_HEADER_SIZE + (self.areas.len() + self.inputs.len() + self.outputs.len()) * AREA_RECORD_SIZE;

        let header = ContainerHeader {
            endianness: self.endianness,
            version: SUPPORTED_VERSION,
            security: self.security,
            security_info_len: self.security_info.len() as u32,
            metadata_len: metadata_len as u32,
            aux_len: aux.len() as u32,
            code_len: self.code.len() as u32,
        };

        let mut out = Vec::with_capacity(
            HEADER_SIZE + self.security_info.len() + metadata_len + aux.len() + self.code.len(),
        );
        encode_header(&mut out, &header);
        out.extend_from_slice(&self.security_info);
        encode_metadata(
            &mut out,
            &metadata,
            self.areas.iter().chain(&self.inputs).chain(&self.outputs),
        );
        out.extend_from_slice(&aux);
        out.extend_from_slice(&self.code);
        out
    }
}

/// Re-encode a parsed container
pub(crate) fn encode_container(c: &Container) -> Vec<u8> {
    let mut out = Vec::with_capacity(c.declared_len());
    encode_header(&mut out, c.header());
    out.extend_from_slice(c.security_info());
    encode_metadata(&mut out, c.metadata(), c.all_areas());
    match c.aux() {
        Some(aux) => encode_parsed_aux(&mut out, aux),
        None => out.extend_from_slice(c.aux_bytes()),
    }
    out.extend_from_slice(c.code());
    out
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn encode_header(out: &mut Vec<u8>, h: &ContainerHeader) {
    out.extend_from_slice(&MAGIC);
    put_u32(
        out,
        match h.endianness {
            Endianness::Little => 0,
            Endianness::Big => ENDIANNESS_BIG,
        },
    );
    put_u32(out, h.version);
    put_u32(out, h.security.tag());
    put_u32(out, h.security_info_len);
    put_u32(out, h.metadata_len);
    put_u32(out, h.aux_len);
    put_u32(out, h.code_len);
}

fn encode_metadata<'a>(
    out: &mut Vec<u8>,
    m: &Metadata,
    areas: impl Iterator<Item = &'a MemoryArea>,
) {
    put_u32(out, m.target_id);
    out.extend_from_slice(&m.name);
    out.extend_from_slice(&m.compiler);
    put_u32(out, m.compiler_version);
    put_u32(out, m.exec_mode.tag());
    put_u32(out, m.memory_area_count);
    put_u32(out, m.input_count);
    put_u32(out, m.output_count);
    for a in areas {
        put_u32(out, a.kind.tag());
        put_u32(out, a.base);
        put_u32(out, a.size);
        put_u32(out, a.alignment);
        put_u32(out, a.page_size);
    }
}

fn encode_parsed_aux(out: &mut Vec<u8>, aux: &AuxData) {
    encode_aux(
        out,
        aux.code_reloc_count,
        aux.data_reloc_count,
        &aux.relocations,
        &aux.layers,
        &aux.operations,
    );
}

fn encode_aux(
    out: &mut Vec<u8>,
    code_relocs: u32,
    data_relocs: u32,
    relocs: &[u8],
    layers: &[Layer],
    ops: &[Operation],
) {
    out.reserve(
        AUX_COUNTS_SIZE + relocs.len() + layers.len() * LAYER_RECORD_SIZE + ops.len() * OP_RECORD_SIZE,
    );
    put_u32(out, code_relocs);
    put_u32(out, data_relocs);
    put_u32(out, layers.len() as u32);
    put_u32(out, ops.len() as u32);
    out.extend_from_slice(relocs);
    for l in layers {
        put_u32(out, l.uid);
        out.extend_from_slice(&l.name);
    }
    for op in ops {
        put_u32(out, op.layer_index);
        put_u32(out, op.offset);
        put_u32(out, op.size);
        put_u32(out, op.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::AreaKind;

    #[test]
    fn test_metadata_length_matches_area_count() {
        let data = ContainerBuilder::new("net")
            .area(MemoryArea::new(AreaKind::Code, 0, 4096))
            .input(MemoryArea::new(AreaKind::Input, 0x10_0000, 4096))
            .output(MemoryArea::new(AreaKind::Output, 0x20_0000, 4096))
            .build();

        let metadata_len = u32::from_le_bytes(data[20..24].try_into().unwrap()) as usize;
        assert_eq!(metadata_len, METADATA_HEADER_SIZE + 3 * AREA_RECORD_SIZE);
        assert_eq!(data.len(), HEADER_SIZE + metadata_len);
    }

    #[test]
    fn test_normal_mode_has_no_aux() {
        let data = ContainerBuilder::new("net")
            .layer(Layer::new(1, "ignored"))
            .build();
        assert_eq!(u32::from_le_bytes(data[24..28].try_into().unwrap()), 0);
    }

    #[test]
    fn test_relocations_roundtrip_opaque() {
        let data = ContainerBuilder::new("rel")
            .profiling(true)
            .area(MemoryArea::new(AreaKind::Code, 0, 4096))
            .relocations(
                vec![Relocation { offset: 8, kind: 1, area_index: 0 }],
                vec![Relocation { offset: 16, kind: 2, area_index: 0 }],
            )
            .build();

        let c = Container::from_bytes(&data).unwrap();
        let aux = c.aux().unwrap();
        assert_eq!(aux.code_reloc_count, 1);
        assert_eq!(aux.data_reloc_count, 1);
        assert_eq!(aux.relocations.len(), 2 * RELOC_RECORD_SIZE);
        assert_eq!(c.to_bytes(), data);
    }
}
