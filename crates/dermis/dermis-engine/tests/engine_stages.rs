//! The init driver walking the kernel from registration to operation.
//!
//! ```bash
//! cargo test -p dermis-engine --test engine_stages -- --nocapture
//! ```

use dermis_config::DermisConfig;
use dermis_core::{
    AcquisitionMode, DeviceDriver, DeviceRegistration, Error, Fill, FrameView, LayerDetails,
    LayerId, SensorId, SlotWriter, SystemState,
};
use dermis_engine::{DermisEngine, reclaim_stale};
use dermis_icc::{ProcessRegistry, ResourceRegistry};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

/// One layer of four sensors counting frames.
struct Counter;

impl DeviceDriver for Counter {
    fn details(&self, _layer: usize) -> LayerDetails {
        LayerDetails {
            name: "counter".into(),
            sensor_count: 4,
            module_count: 1,
            patch_count: 1,
            acquisition_rate: 200,
            buffer_count: 3,
        }
    }

    fn filler(&self, _layer: usize) -> Box<dyn Fill> {
        let mut frame = 0u16;
        Box::new(move |slot: &SlotWriter<'_>, map: &[SensorId]| {
            frame = frame.wrapping_add(1);
            for pos in 0..map.len() {
                slot.set(pos, frame);
            }
            Ok(())
        })
    }
}

fn counter() -> DeviceRegistration {
    DeviceRegistration {
        name: "counter".into(),
        layer_count: 1,
        sensor_count: 4,
        module_count: 1,
        patch_count: 1,
        driver: Arc::new(Counter),
    }
}

fn config(skip: bool) -> DermisConfig {
    DermisConfig {
        max_thread_delay_ms: 10,
        stop_grace_ms: 300,
        skip_calibration: skip,
        skip_regionalization: skip,
        ..DermisConfig::default()
    }
}

fn wait_state(engine: &DermisEngine, want: SystemState) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while engine.state() != want {
        assert!(
            Instant::now() < deadline,
            "stuck in {:?} waiting for {want:?}",
            engine.state()
        );
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn skipped_phases_reach_operation_after_devs() {
    let engine = DermisEngine::start(&config(true), ProcessRegistry::new()).unwrap();
    assert_eq!(engine.state(), SystemState::ReadyForSources);
    engine.kernel().register_device(counter()).unwrap();
    engine.command("devs");
    engine
        .wait_operational(Some(Duration::from_secs(2)))
        .unwrap();

    let frames = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&frames);
    let reader = engine
        .kernel()
        .attach_reader(
            LayerId(0),
            AcquisitionMode::Asap,
            Box::new(move |f: &FrameView<'_>| {
                if f.timestamp_ns() > 0 {
                    seen.fetch_add(1, Ordering::Relaxed);
                }
            }),
        )
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while frames.load(Ordering::Relaxed) < 3 {
        assert!(Instant::now() < deadline, "reader saw no frames");
        thread::sleep(Duration::from_millis(5));
    }
    assert!(reader.stop());

    let status = engine.status();
    log!("{:?}", status.layers);
    assert_eq!(status.phase, "op");
    assert!(status.layers[0].frames > 0);
    assert_eq!(engine.shutdown(), 0);
}

#[test]
fn operators_end_each_phase() {
    let engine = DermisEngine::start(&config(false), ProcessRegistry::new()).unwrap();
    engine.kernel().register_device(counter()).unwrap();
    engine.command("clbr");
    assert_eq!(engine.state(), SystemState::ReadyForSources);

    engine.command("devs");
    wait_state(&engine, SystemState::Calibrating);
    assert_eq!(
        engine.wait_operational(Some(Duration::from_millis(30))),
        Err(Error::Fail)
    );
    engine.command("clbr");
    wait_state(&engine, SystemState::Regionalizing);
    engine.command("rgn");
    engine
        .wait_operational(Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(engine.kernel().layout().unwrap().regions.regions.len(), 1);
    engine.shutdown();
}

#[test]
fn no_devices_fails_the_build() {
    let engine = DermisEngine::start(&config(true), ProcessRegistry::new()).unwrap();
    engine.command("devs");
    assert_eq!(
        engine.wait_operational(Some(Duration::from_secs(2))),
        Err(Error::TooLate)
    );
    assert_eq!(engine.state(), SystemState::Failed);
    assert_eq!(engine.status().phase, "fail");
    assert_eq!(
        engine.kernel().register_device(counter()).err(),
        Some(Error::TooLate)
    );
}

#[test]
fn shutdown_before_devs_stops_the_driver() {
    let engine = DermisEngine::start(&config(false), ProcessRegistry::new()).unwrap();
    let kernel = Arc::clone(engine.kernel());
    assert_eq!(engine.shutdown(), 0);
    assert_eq!(kernel.state(), SystemState::Exiting);
}

#[test]
fn stale_names_are_reclaimed_at_start() {
    let registry = ProcessRegistry::new();
    let _stale = registry.alloc("SKND0", 64).unwrap();
    let _lock = registry.alloc_rwlock("SKNL00").unwrap();
    let _foreign = registry.alloc("not-ours", 64).unwrap();

    assert_eq!(reclaim_stale(&*registry), 2);
    assert!(registry.name_available("SKND0"));
    assert!(!registry.name_available("not-ours"));

    let _again = registry.alloc("SKND1", 64).unwrap();
    let engine = DermisEngine::start(&config(true), Arc::clone(&registry) as Arc<dyn ResourceRegistry>).unwrap();
    assert!(registry.name_available("SKND1"));
    drop(engine);
}
