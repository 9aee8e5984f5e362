//! Control-plane tests against the simulated NPU
//!
//! Every test drives the public `Device`/`Session` surface; the simulator's
//! trusted side and memory are inspected to check nothing leaks.

use npu_chip::tee::{cmd, result};
use npu_driver::backends::simulated::RunOutcome;
use npu_driver::{DriverConfig, FaultKind, NpuError, NpuMode, Simulator, SimulatorConfig};
use npu_models::{AreaKind, ContainerBuilder, FoldSummary, Layer, MemoryArea, Operation, SecurityMode};
use std::time::Duration;

fn container(name: &str) -> ContainerBuilder {
    ContainerBuilder::new(name)
        .area(MemoryArea::new(AreaKind::Code, 0, 4096))
        .area(MemoryArea::new(AreaKind::Pool, 0x40_0000, 16384))
        .input(MemoryArea::new(AreaKind::Input, 0x80_0000, 4096))
        .input(MemoryArea::new(AreaKind::Input, 0x80_1000, 4096))
        .output(MemoryArea::new(AreaKind::Output, 0x90_0000, 4096))
        .code(vec![0xC3; 512])
}

fn plain(name: &str) -> Vec<u8> {
    container(name).build()
}

fn simulator() -> Simulator {
    Simulator::new(&SimulatorConfig::default())
}

#[test]
fn test_run_lifecycle() {
    let sim = simulator();
    let device = sim.attach(DriverConfig::default()).expect("attach");
    let baseline = sim.memory.live_bytes();
    assert!(!sim.platform.is_powered());

    let session = device.open_session().expect("session");
    assert!(sim.platform.is_powered());

    let net = session.create_network(&plain("kws")).expect("create");
    let input = session.allocate_buffer(4096, false).unwrap();
    let output = session.allocate_buffer(4096, false).unwrap();
    session.write_buffer(input, 0, &[7; 64]).unwrap();
    assert_eq!(session.read_buffer(input, 0, 64).unwrap(), vec![7; 64]);

    let a_in = session.attach(net, input).unwrap();
    let a_out = session.attach(net, output).unwrap();
    session.set_input(net, a_in, 1).unwrap();
    session.set_output(net, a_out, 0).unwrap();

    let report = session.run(net).expect("run");
    assert_eq!(report.status & npu_chip::irq::DONE, npu_chip::irq::DONE);
    assert_eq!(report.profile, None);
    session.run(net).expect("second run");

    let net_report = session.network_report(net).unwrap();
    assert_eq!(net_report.name, "kws");
    assert_eq!(net_report.stats.inferences, 2);
    assert_eq!(net_report.stats.attached_buffers, 2);
    assert_eq!(net_report.pool_size, 16384);
    assert!(net_report.to_string().contains("2 ok, 0 failed"));

    let dev_report = device.report();
    assert_eq!(dev_report.sessions, 1);
    assert_eq!(dev_report.mode, Some(NpuMode::NonSecure));
    assert_eq!(dev_report.trusted_networks, 1);
    assert_eq!(dev_report.stats.inferences, 2);
    assert_eq!(dev_report.stats.networks_created, 1);
    assert_eq!(dev_report.stats.buffers_created, 2);
    assert_eq!(sim.tee.counters().activations, 1);

    session.close().expect("close");
    assert!(!sim.platform.is_powered());
    assert_eq!(sim.platform.power_cycles(), (1, 1));
    assert_eq!(sim.tee.live_networks(), 0);
    assert_eq!(sim.tee.live_buffers(), 0);
    assert_eq!(sim.tee.mode(), None);
    assert_eq!(sim.memory.live_bytes(), baseline);
}

#[test]
fn test_shared_buffer_survives_one_network() {
    let sim = simulator();
    let device = sim.attach(DriverConfig::default()).unwrap();
    let session = device.open_session().unwrap();

    let first = session.create_network(&plain("a")).unwrap();
    let second = session.create_network(&plain("b")).unwrap();
    let shared = session.allocate_buffer(8192, false).unwrap();
    session.attach(first, shared).unwrap();
    session.attach(second, shared).unwrap();
    assert_eq!(session.buffer_info(shared).unwrap().ref_count, 2);

    session.destroy_network(first).unwrap();
    assert_eq!(session.buffer_info(shared).unwrap().ref_count, 1);
    assert!(matches!(
        session.destroy_buffer(shared),
        Err(NpuError::Usage { .. })
    ));
    assert!(matches!(
        session.network_report(first),
        Err(NpuError::NotFound { kind: "network", .. })
    ));

    session.run(second).expect("remaining network still runs");
    session.destroy_network(second).unwrap();
    session.destroy_buffer(shared).unwrap();
    assert!(session.buffers().is_empty());
    assert_eq!(sim.tee.live_buffers(), 0);
}

#[test]
fn test_fault_deactivates_and_counts_once() {
    for (outcome, kind) in [
        (RunOutcome::BusError, FaultKind::BusError),
        (RunOutcome::MmuException, FaultKind::MmuException),
        (RunOutcome::Spurious, FaultKind::SpuriousInterrupt),
    ] {
        let sim = simulator();
        let device = sim.attach(DriverConfig::default()).unwrap();
        let session = device.open_session().unwrap();
        let net = session.create_network(&plain("faulty")).unwrap();

        sim.tee.script([outcome]);
        match session.run(net) {
            Err(NpuError::HardwareFault { kind: k }) => assert_eq!(k, kind),
            other => panic!("expected {kind} fault, got {other:?}"),
        }

        let counters = sim.tee.counters();
        assert_eq!(counters.dumps, 1);
        assert_eq!(counters.deactivations, 1);
        assert_eq!(sim.tee.mode(), None);
        assert_eq!(device.report().mode, None);

        let stats = session.network_report(net).unwrap().stats;
        assert_eq!((stats.inferences, stats.failures), (0, 1));
        let global = device.report().stats;
        assert_eq!((global.failures, global.faults), (1, 1));

        session.run(net).expect("recovered");
        assert_eq!(sim.tee.counters().activations, 2);
        assert_eq!(device.report().stats.inferences, 1);
    }
}

#[test]
fn test_hang_times_out() {
    let sim = simulator();
    let config = DriverConfig::default().with_run_timeout(Duration::from_millis(50));
    let device = sim.attach(config).unwrap();
    let session = device.open_session().unwrap();
    let net = session.create_network(&plain("stuck")).unwrap();

    sim.tee.script([RunOutcome::Hang]);
    assert!(matches!(
        session.run(net),
        Err(NpuError::HardwareFault { kind: FaultKind::Timeout })
    ));
    assert_eq!(sim.tee.counters().deactivations, 1);

    session.run(net).expect("accelerator usable after timeout");
}

#[test]
fn test_profiling_folds_into_layers() {
    let sim = simulator();
    let device = sim.attach(DriverConfig::default()).unwrap();
    let session = device.open_session().unwrap();

    let data = container("profiled")
        .profiling(true)
        .layer(Layer::new(10, "conv_0"))
        .layer(Layer::new(11, "fc"))
        .operation(Operation { layer_index: 0, offset: 0, size: 16, kind: 1 })
        .operation(Operation { layer_index: 1, offset: 16, size: 64, kind: 4 })
        .operation(Operation { layer_index: 1, offset: 80, size: 32, kind: 4 })
        .operation(Operation { layer_index: 9, offset: 112, size: 8, kind: 5 })
        .build();
    let net = session.create_network(&data).unwrap();

    let report = session.run(net).unwrap();
    assert_eq!(report.profile, Some(FoldSummary { folded: 3, skipped: 1 }));

    let layers = session.network_report(net).unwrap().layers;
    assert_eq!(layers.len(), 2);
    assert_eq!((layers[0].uid, layers[0].cycles, layers[0].ops), (10, 100, 1));
    assert_eq!(layers[1].name, "fc");
    assert_eq!(layers[1].cycles, 200 + 300);
    assert_eq!(layers[1].time_ns, 2000 + 3000);
    assert_eq!(layers[1].bytes_in, 96);
    assert_eq!(layers[1].bytes_out, 48);

    session.run(net).unwrap();
    let layers = session.network_report(net).unwrap().layers;
    assert_eq!(layers[0].cycles, 200);
    assert_eq!(layers[1].ops, 4);
}

#[test]
fn test_reservation_excludes_other_sessions() {
    let sim = simulator();
    let device = sim.attach(DriverConfig::default()).unwrap();
    let owner = device.open_session().unwrap();
    let other = device.open_session().unwrap();
    let mine = owner.create_network(&plain("mine")).unwrap();
    let theirs = other.create_network(&plain("theirs")).unwrap();

    owner.reserve().unwrap();
    owner.reserve().unwrap();
    assert_eq!(device.report().reserved_by, Some(owner.id()));
    match other.run(theirs) {
        Err(NpuError::Busy { holder }) => assert_eq!(holder, owner.id()),
        res => panic!("expected Busy, got {res:?}"),
    }
    assert!(matches!(other.reserve(), Err(NpuError::Busy { .. })));
    assert_eq!(sim.tee.counters().starts, 0);

    owner.run(mine).unwrap();
    assert!(matches!(other.release_reservation(), Err(NpuError::Usage { .. })));

    // closing the holder frees the hardware
    drop(owner);
    assert_eq!(device.report().reserved_by, None);
    other.run(theirs).unwrap();

    // a rejected attempt never reached the hardware
    let stats = other.network_report(theirs).unwrap().stats;
    assert_eq!((stats.inferences, stats.failures), (1, 0));
}

#[test]
fn test_power_follows_sessions() {
    let sim = simulator();
    let device = sim.attach(DriverConfig::default()).unwrap();
    let a = device.open_session().unwrap();
    let b = device.open_session().unwrap();
    assert_ne!(a.id(), b.id());

    let net = a.create_network(&plain("p")).unwrap();
    a.run(net).unwrap();
    a.close().unwrap();
    assert!(sim.platform.is_powered());
    assert_eq!(sim.tee.mode(), Some(npu_chip::tee::npu_mode::NON_SECURE));

    drop(b);
    assert!(!sim.platform.is_powered());
    assert_eq!(sim.tee.mode(), None);

    let c = device.open_session().unwrap();
    assert!(sim.platform.is_powered());
    assert_eq!(sim.platform.power_cycles(), (2, 1));
    drop(c);
}

#[test]
fn test_failed_creation_leaves_nothing_behind() {
    let sim = simulator();
    let config = DriverConfig::default().with_session_limits(1, 1);
    let device = sim.attach(config).unwrap();
    let session = device.open_session().unwrap();
    session.create_network(&plain("one")).unwrap();
    session.allocate_buffer(4096, false).unwrap();
    let live = sim.memory.live_bytes();

    // host-side limit after the trusted side accepted
    assert!(matches!(
        session.create_network(&plain("two")),
        Err(NpuError::Resource { .. })
    ));
    assert!(matches!(
        session.allocate_buffer(4096, false),
        Err(NpuError::Resource { .. })
    ));
    assert_eq!(sim.tee.live_networks(), 1);
    assert_eq!(sim.tee.live_buffers(), 1);
    assert_eq!(sim.memory.live_bytes(), live);

    // trusted-side rejection
    let other = device.open_session().unwrap();
    sim.tee.fail_next(cmd::CREATE_NETWORK, result::OUT_OF_MEMORY);
    let err = other.create_network(&plain("three")).unwrap_err();
    assert_eq!(err.protocol_code(), Some(result::OUT_OF_MEMORY));
    assert_eq!(sim.memory.live_bytes(), live);
    assert_eq!(device.report().trusted_networks, 1);

    // malformed input never reaches the trusted side
    let mut broken = plain("broken");
    broken[0] = b'X';
    assert!(matches!(
        other.create_network(&broken),
        Err(NpuError::Format { .. })
    ));
    assert_eq!(device.report().stats.networks_created, 1);
}

#[test]
fn test_trusted_side_validation() {
    let sim = Simulator::new(&SimulatorConfig::default().with_signature_rejection(true));
    let device = sim.attach(DriverConfig::default()).unwrap();
    let session = device.open_session().unwrap();

    let foreign = container("foreign").target(7).build();
    let err = session.create_network(&foreign).unwrap_err();
    assert_eq!(err.protocol_code(), Some(result::BAD_FORMAT));
    assert!(err.to_string().contains("CreateNetwork"));

    let signed = container("signed")
        .security(SecurityMode::Signed, vec![0xA5; 64])
        .build();
    let err = session.create_network(&signed).unwrap_err();
    assert_eq!(err.protocol_code(), Some(result::SECURITY));
    assert_eq!(sim.tee.live_networks(), 0);
}

#[test]
fn test_secure_network_switches_mode() {
    let sim = simulator();
    let device = sim.attach(DriverConfig::default()).unwrap();
    let session = device.open_session().unwrap();

    let secure = container("secure")
        .security(SecurityMode::Encrypted, vec![1; 32])
        .build();
    let secure = session.create_network(&secure).unwrap();
    let normal = session.create_network(&plain("normal")).unwrap();
    assert!(session.network_report(secure).unwrap().secure);

    session.run(secure).unwrap();
    assert_eq!(device.report().mode, Some(NpuMode::Secure));
    session.run(normal).unwrap();
    assert_eq!(device.report().mode, Some(NpuMode::NonSecure));

    let counters = sim.tee.counters();
    assert_eq!((counters.activations, counters.deactivations), (2, 1));
}

#[test]
fn test_buffer_sources() {
    let sim = simulator();
    let device = sim.attach(DriverConfig::default()).unwrap();
    let producer = device.open_session().unwrap();
    let consumer = device.open_session().unwrap();

    assert!(matches!(
        producer.allocate_buffer(0, false),
        Err(NpuError::Usage { .. })
    ));
    let rounded = producer.allocate_buffer(100, false).unwrap();
    assert_eq!(producer.buffer_info(rounded).unwrap().size, 4096);

    let secure = producer.allocate_buffer(4096, true).unwrap();
    assert!(!producer.buffer_info(secure).unwrap().host_mapped);
    assert!(matches!(
        producer.read_buffer(secure, 0, 1),
        Err(NpuError::Usage { .. })
    ));

    // cross-session window by memory id
    let source = producer.allocate_buffer(16384, false).unwrap();
    let mem_id = producer.buffer_info(source).unwrap().mem_id;
    let window = consumer.buffer_from_mem_id(mem_id, 4096, 4096).unwrap();
    let info = consumer.buffer_info(window).unwrap();
    assert_eq!((info.mem_id, info.size, info.host_mapped), (mem_id, 4096, false));
    assert!(consumer.write_buffer(window, 0, &[1]).is_err());
    assert!(consumer.buffer_from_mem_id(mem_id, 16384, 4096).is_err());
    assert!(consumer.buffer_from_mem_id(0xdead, 0, 4096).is_err());

    // window of foreign memory
    let (foreign, exporter) = sim.memory.export(3 * 4096).unwrap();
    exporter.write(4096, b"camera frame").unwrap();
    let imported = consumer.import_buffer(foreign, 4096, 8192, false).unwrap();
    assert_eq!(consumer.read_buffer(imported, 0, 12).unwrap(), b"camera frame");
    consumer.write_buffer(imported, 8190, &[9, 9]).unwrap();
    assert!(consumer.write_buffer(imported, 8191, &[9, 9]).is_err());
    assert_eq!(exporter.read_vec(4096 + 8190, 2).unwrap(), vec![9, 9]);
    assert!(matches!(
        consumer.import_buffer(foreign, 100, 4096, false),
        Err(NpuError::Usage { .. })
    ));
    assert!(consumer.import_buffer(foreign, 0, 4 * 4096, false).is_err());
}

#[test]
fn test_slot_binding_checks() {
    let sim = simulator();
    let device = sim.attach(DriverConfig::default()).unwrap();
    let session = device.open_session().unwrap();
    let net = session.create_network(&plain("slots")).unwrap();
    let buf = session.allocate_buffer(4096, false).unwrap();
    let att = session.attach(net, buf).unwrap();

    assert!(matches!(
        session.set_input(net, att, 2),
        Err(NpuError::Usage { .. })
    ));
    assert!(matches!(
        session.set_output(net, att, 1),
        Err(NpuError::Usage { .. })
    ));
    session.set_input(net, att, 0).unwrap();
    session.set_output(net, att, 0).unwrap();

    session.detach(net, att).unwrap();
    assert!(matches!(
        session.set_input(net, att, 0),
        Err(NpuError::NotFound { kind: "attachment", .. })
    ));
    assert_eq!(session.buffer_info(buf).unwrap().ref_count, 0);
    session.destroy_buffer(buf).unwrap();
    assert!(session.destroy_buffer(buf).is_err());
}

#[test]
fn test_oversized_payload_uses_temporary_region() {
    let sim = simulator();
    let config = DriverConfig::default().with_channel_regions(4096, 4096);
    let device = sim.attach(config).unwrap();
    let session = device.open_session().unwrap();

    let big = ContainerBuilder::new("big")
        .area(MemoryArea::new(AreaKind::Code, 0, 32768))
        .code(vec![0x11; 20000])
        .build();
    let net = session.create_network(&big).unwrap();
    session.run(net).unwrap();
}
