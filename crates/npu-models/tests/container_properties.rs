//! Container parsing properties
//!
//! Parses containers produced by `ContainerBuilder` and hand-damaged variants
//! of them.

use npu_chip::container::{header, metadata, AREA_RECORD_SIZE, HEADER_SIZE, METADATA_HEADER_SIZE};
use npu_models::{
    AreaKind, Container, ContainerBuilder, ContainerError, Layer, MemoryArea, Operation,
    PageTableStrategy, Relocation, ResourceSizer, SecurityMode,
};

fn set_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn samples() -> Vec<Vec<u8>> {
    vec![
        ContainerBuilder::new("plain")
            .area(MemoryArea::new(AreaKind::Code, 0, 4096))
            .code(vec![1, 2, 3, 4])
            .build(),
        ContainerBuilder::new("signed")
            .security(SecurityMode::Signed, vec![0x5A; 256])
            .target(0x1234)
            .area(MemoryArea::new(AreaKind::Code, 0, 8192))
            .area(MemoryArea::new(AreaKind::Pool, 0x40_0000, 65536))
            .area(MemoryArea::new(AreaKind::Constant, 0x80_0000, 4096))
            .input(MemoryArea::new(AreaKind::Input, 0x100_0000, 4096))
            .output(MemoryArea::new(AreaKind::Output, 0x140_0000, 4096))
            .code(vec![0xC3; 8192])
            .build(),
        ContainerBuilder::new("profiled")
            .profiling(true)
            .compiler("npuc-ng", 7)
            .area(MemoryArea::new(AreaKind::Code, 0, 4096))
            .relocations(
                vec![Relocation { offset: 0, kind: 1, area_index: 0 }],
                vec![],
            )
            .layer(Layer::new(1, "input"))
            .layer(Layer::new(2, "conv_1"))
            .operation(Operation { layer_index: 0, offset: 0, size: 16, kind: 5 })
            .operation(Operation { layer_index: 1, offset: 16, size: 64, kind: 1 })
            .code(vec![0x90; 80])
            .build(),
    ]
}

#[test]
fn test_reserialization_is_bit_exact() {
    for data in samples() {
        let c = Container::from_bytes(&data).expect("valid sample");
        assert_eq!(c.to_bytes(), data, "round trip of '{}'", c.metadata().name());
    }
}

#[test]
fn test_every_strict_prefix_is_rejected() {
    for data in samples() {
        for len in 0..data.len() {
            assert!(
                Container::from_bytes(&data[..len]).is_err(),
                "prefix of {len} bytes accepted"
            );
        }
    }
}

#[test]
fn test_metadata_length_invariant() {
    // inputs 2, outputs 1, areas 1, but metadata length declares one record short
    let mut data = ContainerBuilder::new("mismatch")
        .area(MemoryArea::new(AreaKind::Code, 0, 4096))
        .input(MemoryArea::new(AreaKind::Input, 0x10_0000, 4096))
        .input(MemoryArea::new(AreaKind::Input, 0x20_0000, 4096))
        .output(MemoryArea::new(AreaKind::Output, 0x30_0000, 4096))
        .build();
    let declared = METADATA_HEADER_SIZE + 3 * AREA_RECORD_SIZE;
    set_u32(&mut data, header::METADATA_LEN, declared as u32);

    match Container::from_bytes(&data) {
        Err(ContainerError::SectionLength { section, declared: d, expected }) => {
            assert_eq!(section, "metadata");
            assert_eq!(d, declared);
            assert_eq!(expected, (METADATA_HEADER_SIZE + 4 * AREA_RECORD_SIZE) as u64);
        }
        other => panic!("expected metadata length error, got {other:?}"),
    }
}

#[test]
fn test_too_many_areas() {
    let mut data = samples().remove(0);
    set_u32(&mut data, HEADER_SIZE + metadata::INPUT_COUNT, 64);
    assert!(matches!(
        Container::from_bytes(&data),
        Err(ContainerError::TooManyAreas { count: 65, max: 64 })
    ));

    // Counts that would wrap a u32 sum are still caught
    set_u32(&mut data, HEADER_SIZE + metadata::INPUT_COUNT, u32::MAX);
    set_u32(&mut data, HEADER_SIZE + metadata::OUTPUT_COUNT, u32::MAX);
    assert!(matches!(
        Container::from_bytes(&data),
        Err(ContainerError::TooManyAreas { .. })
    ));
}

#[test]
fn test_wrong_table_category() {
    let data = ContainerBuilder::new("swap")
        .area(MemoryArea::new(AreaKind::Code, 0, 4096))
        .input(MemoryArea::new(AreaKind::Output, 0x10_0000, 4096))
        .build();
    assert!(matches!(
        Container::from_bytes(&data),
        Err(ContainerError::AreaCategory { table: "input", index: 1, kind: AreaKind::Output })
    ));

    let data = ContainerBuilder::new("swap")
        .area(MemoryArea::new(AreaKind::Code, 0, 4096))
        .output(MemoryArea::new(AreaKind::Input, 0x10_0000, 4096))
        .build();
    assert!(matches!(
        Container::from_bytes(&data),
        Err(ContainerError::AreaCategory { table: "output", .. })
    ));
}

#[test]
fn test_aux_length_mismatch() {
    let mut data = samples().remove(2);
    let c = Container::from_bytes(&data).unwrap();
    // Claim one more operation than the section holds
    set_u32(&mut data, c.public_data_len() + 12, 3);
    assert!(matches!(
        Container::from_bytes(&data),
        Err(ContainerError::SectionLength { section: "auxiliary", .. })
    ));
}

#[test]
fn test_plain_code_only_scenario() {
    let data = ContainerBuilder::new("scenario")
        .area(MemoryArea::new(AreaKind::Code, 0, 4096))
        .build();
    let c = Container::from_bytes(&data).unwrap();
    let d = ResourceSizer::new(PageTableStrategy::Conservative).size(&c).unwrap();

    assert_eq!(&data[0..4], b"EBGX");
    assert_eq!(c.header().version, 1);
    assert_eq!(d.pool_size, 0);
    assert_eq!(d.code_size, 4096);
    assert!(!d.secure);
    assert!(!d.profiling);
}

#[test]
fn test_secure_flag_follows_security_mode() {
    for (mode, secure) in [
        (SecurityMode::Plain, false),
        (SecurityMode::Signed, true),
        (SecurityMode::Encrypted, true),
    ] {
        let data = ContainerBuilder::new("sec")
            .security(mode, vec![0; 32])
            .area(MemoryArea::new(AreaKind::Code, 0, 4096))
            .build();
        let c = Container::from_bytes(&data).unwrap();
        assert_eq!(c.security_info().len(), 32);
        assert_eq!(ResourceSizer::default().size(&c).unwrap().secure, secure);
    }
}
