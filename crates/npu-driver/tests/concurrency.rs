//! Concurrent sessions against one simulated NPU
//!
//! The simulator counts starts that arrive while another execution is in
//! flight; the hardware lock must keep that at zero.

use npu_driver::{DriverConfig, Simulator, SimulatorConfig};
use npu_models::{AreaKind, ContainerBuilder, MemoryArea};
use std::thread;
use std::time::Duration;

fn network(name: &str) -> Vec<u8> {
    ContainerBuilder::new(name)
        .area(MemoryArea::new(AreaKind::Code, 0, 8192))
        .input(MemoryArea::new(AreaKind::Input, 0x40_0000, 4096))
        .output(MemoryArea::new(AreaKind::Output, 0x50_0000, 4096))
        .code(vec![0x5A; 1024])
        .build()
}

#[test]
fn test_runs_are_mutually_exclusive() {
    const THREADS: u64 = 4;
    const RUNS: u64 = 10;

    let sim = Simulator::new(&SimulatorConfig::default().with_latency(Duration::from_millis(2)));
    let device = sim.attach(DriverConfig::default()).unwrap();

    thread::scope(|s| {
        for t in 0..THREADS {
            let device = device.clone();
            s.spawn(move || {
                let session = device.open_session().unwrap();
                let net = session.create_network(&network(&format!("net{t}"))).unwrap();
                for _ in 0..RUNS {
                    session.run(net).unwrap();
                }
                assert_eq!(session.network_report(net).unwrap().stats.inferences, RUNS);
            });
        }
    });

    let counters = sim.tee.counters();
    assert_eq!(counters.starts, THREADS * RUNS);
    assert_eq!(counters.overlaps, 0);
    assert_eq!(counters.max_concurrent, 1);

    let report = device.report();
    assert_eq!(report.sessions, 0);
    assert_eq!(report.stats.inferences, THREADS * RUNS);
    assert_eq!(report.stats.networks_created, THREADS);
    assert!(!sim.platform.is_powered());
}

#[test]
fn test_one_session_shared_by_threads() {
    let sim = Simulator::new(&SimulatorConfig::default());
    let device = sim.attach(DriverConfig::default()).unwrap();
    let session = device.open_session().unwrap();
    let nets: Vec<_> = (0..3)
        .map(|i| session.create_network(&network(&format!("n{i}"))).unwrap())
        .collect();

    thread::scope(|s| {
        for &net in &nets {
            let session = &session;
            s.spawn(move || {
                for _ in 0..5 {
                    session.run(net).unwrap();
                }
            });
        }
    });

    for &net in &nets {
        assert_eq!(session.network_report(net).unwrap().stats.inferences, 5);
    }
    assert_eq!(sim.tee.counters().overlaps, 0);
}

#[test]
fn test_teardown_races_with_runs() {
    let sim = Simulator::new(&SimulatorConfig::default());
    let device = sim.attach(DriverConfig::default()).unwrap();
    let runner = device.open_session().unwrap();
    let busy = runner.create_network(&network("busy")).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..20 {
                runner.run(busy).unwrap();
            }
        });
        s.spawn(|| {
            for i in 0..10 {
                let churn = device.open_session().unwrap();
                let net = churn.create_network(&network(&format!("churn{i}"))).unwrap();
                let buf = churn.allocate_buffer(4096, false).unwrap();
                churn.attach(net, buf).unwrap();
                churn.close().unwrap();
            }
        });
    });

    assert_eq!(sim.tee.live_networks(), 1);
    assert_eq!(sim.tee.live_buffers(), 0);
    assert_eq!(device.report().sessions, 1);
    assert!(sim.platform.is_powered());
}
