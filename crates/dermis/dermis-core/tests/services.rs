//! Services fed by internal readers, and connectors reading their output.
//!
//! ```bash
//! cargo test -p dermis-core --test services -- --nocapture
//! ```

use dermis_config::DermisConfig;
use dermis_core::{
    AcquisitionMode, Connector, Consume, DeviceDriver, DeviceRegistration, Error, Fill, FrameView,
    Kernel, LayerDetails, LayerId, LayerSelect, Outcome, SensorId, ServiceOutput, ServiceView, SlotWriter,
};
use dermis_icc::{ProcessRegistry, ResourceRegistry};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Writes to stderr with immediate flush to bypass test output capture.
macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

/// Two layers of constant readings: layer `k` reports `k + 1` everywhere.
struct Flat;

impl DeviceDriver for Flat {
    fn details(&self, layer: usize) -> LayerDetails {
        LayerDetails {
            name: format!("flat-{layer}"),
            sensor_count: 3,
            module_count: 1,
            patch_count: 1,
            acquisition_rate: 200,
            buffer_count: 3,
        }
    }

    fn filler(&self, layer: usize) -> Box<dyn Fill> {
        let value = layer as u16 + 1;
        Box::new(move |slot: &SlotWriter<'_>, map: &[SensorId]| {
            for pos in 0..map.len() {
                slot.set(pos, value);
            }
            Ok(())
        })
    }
}

const MAX_DELAY: Duration = Duration::from_millis(10);

fn operational() -> Arc<Kernel> {
    let cfg = DermisConfig {
        max_thread_delay_ms: 10,
        stop_grace_ms: 300,
        ..DermisConfig::default()
    };
    let registry: Arc<dyn ResourceRegistry> = ProcessRegistry::new();
    let k = Kernel::new(&cfg, registry);
    k.open_registration().unwrap();
    k.register_device(DeviceRegistration {
        name: "flat".into(),
        layer_count: 2,
        sensor_count: 6,
        module_count: 2,
        patch_count: 2,
        driver: Arc::new(Flat),
    })
    .unwrap();
    k.command("devs");
    k.build_structures().unwrap();
    k.spawn_writers().unwrap();
    assert_eq!(k.resume_all_devices(), Ok(Outcome::Complete));
    k.command("clbr");
    k.command("rgn");
    k.go_operational().unwrap();
    k
}

/// Consumer that sums the first reading of every frame into `total`.
fn summing(total: &Arc<AtomicU64>) -> impl FnMut(LayerId) -> Box<dyn Consume> + '_ {
    move |_| {
        let total = Arc::clone(total);
        Box::new(move |f: &FrameView<'_>| {
            if f.timestamp_ns() > 0 {
                total.fetch_add(u64::from(f.get(0)), Ordering::Relaxed);
            }
        })
    }
}

fn first_u64(view: &ServiceView<'_>) -> u64 {
    match view.results().get(..8) {
        Some(bytes) => u64::from_le_bytes(bytes.try_into().unwrap()),
        None => 0,
    }
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn services_need_the_operational_phase_and_valid_input() {
    let cfg = DermisConfig::default();
    let k = Kernel::new(&cfg, ProcessRegistry::new());
    assert_eq!(
        k.initialize_periodic_service("svc", 8, 4, "svc-lock", Duration::from_millis(10)),
        Err(Error::TooEarly)
    );

    let k = operational();
    assert_eq!(
        k.initialize_periodic_service("svc", 0, 4, "svc-lock", Duration::from_millis(10)),
        Err(Error::BadData)
    );
    assert_eq!(
        k.initialize_periodic_service("svc", 8, 4, "svc", Duration::from_millis(10)),
        Err(Error::BadName)
    );
    let id = k
        .initialize_periodic_service("svc", 8, 4, "svc-lock", Duration::from_millis(10))
        .unwrap();
    assert_eq!(
        k.initialize_sporadic_service("svc", 8, 4, "q", "s"),
        Err(Error::BadName)
    );
    assert_eq!(k.service_name(id).unwrap(), "svc");
    k.stop_service(id).unwrap();
    assert_eq!(k.stop_service(id), Err(Error::BadId));
    k.shutdown();
}

#[test]
fn periodic_service_publishes_through_its_lock() {
    let k = operational();
    let id = k
        .initialize_periodic_service("sum", 8, 1, "sum-lock", Duration::from_millis(10))
        .unwrap();
    let total = Arc::new(AtomicU64::new(0));
    assert_eq!(
        k.service_acquire_layer(id, LayerSelect::All, AcquisitionMode::Asap, summing(&total)),
        Ok(Outcome::Complete)
    );

    let feed = Arc::clone(&total);
    let func = move |out: &mut ServiceOutput<'_>| {
        let v = feed.load(Ordering::Relaxed);
        out.payload()[..8].copy_from_slice(&v.to_le_bytes());
        out.set_result_count(1);
    };
    assert_eq!(k.start_service(id, Box::new(func)), Ok(Outcome::Complete));

    let conn = Connector::periodic(k.registry(), "sum", "sum-lock", MAX_DELAY).unwrap();
    assert!(conn.is_alive());
    assert!(!conn.is_sporadic());
    assert_eq!(conn.request(None), Err(Error::Fail));

    wait_for("service output", || first_u64(&conn.lock(None).unwrap()) > 0);
    let view = conn.lock(None).unwrap();
    assert_eq!(view.result_count(), 1);
    assert!(view.timestamp_ns() > 0);
    conn.unlock(view);

    k.stop_service(id).unwrap();
    assert!(!conn.is_alive());
    assert_eq!(conn.lock(None).err(), Some(Error::Fail));
    conn.disconnect();
    assert!(k.registry().name_available("sum"));
    assert!(k.registry().name_available("sum-lock"));
    k.shutdown();
}

#[test]
fn sporadic_service_answers_connector_requests() {
    let k = operational();
    let id = k.initialize_sporadic_service("on-demand", 4, 2, "od-req", "od-resp").unwrap();
    let runs = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&runs);
    let func = move |out: &mut ServiceOutput<'_>| {
        let n = counter.fetch_add(1, Ordering::Relaxed) as u32 + 1;
        out.payload()[..4].copy_from_slice(&n.to_le_bytes());
        out.set_result_count(1);
    };
    assert_eq!(k.start_service(id, Box::new(func)), Ok(Outcome::Complete));

    let conn = Connector::sporadic(k.registry(), "on-demand", "od-req", "od-resp", MAX_DELAY).unwrap();
    assert!(conn.is_sporadic());
    for _ in 0..3 {
        conn.request(None).unwrap();
    }
    assert!(runs.load(Ordering::Relaxed) >= 1);
    let view = conn.lock(None).unwrap();
    let n = u32::from_le_bytes(view.data()[..4].try_into().unwrap());
    log!("service ran {n} times for 3 requests");
    assert!(n >= 1);
    drop(view);

    let cancel = AtomicBool::new(true);
    k.pause_service(id).unwrap();
    // A paused service still answers, without running.
    let before = runs.load(Ordering::Relaxed);
    conn.request(Some(&cancel)).ok();
    k.resume_service(id).unwrap();
    assert!(runs.load(Ordering::Relaxed) <= before + 1);

    k.stop_service(id).unwrap();
    assert_eq!(conn.request(None), Err(Error::Fail));
    k.shutdown();
}

#[test]
fn sporadic_readers_of_a_service_serve_read_requests() {
    let k = operational();
    let id = k
        .initialize_periodic_service("agg", 8, 1, "agg-lock", Duration::from_millis(20))
        .unwrap();
    let total = Arc::new(AtomicU64::new(0));
    assert_eq!(
        k.service_acquire_layer(id, LayerSelect::One(LayerId(1)), AcquisitionMode::Sporadic, summing(&total)),
        Ok(Outcome::Complete)
    );
    assert_eq!(
        k.service_acquire_layer(id, LayerSelect::One(LayerId(7)), AcquisitionMode::Sporadic, summing(&total)),
        Err(Error::BadId)
    );
    // Not started yet: no readers to ask.
    assert_eq!(k.service_request_read(id, LayerSelect::All, None), Err(Error::Fail));

    k.start_service(id, Box::new(|_: &mut ServiceOutput<'_>| {})).unwrap();
    let mut delivered = 0;
    for _ in 0..5 {
        assert_eq!(k.service_request_read(id, LayerSelect::All, None), Ok(Outcome::Complete));
        delivered = total.load(Ordering::Relaxed);
    }
    // Layer 1 reports 2; the very first read may still see an empty slot.
    assert!(delivered >= 8, "delivered {delivered}");

    k.service_request_read_nonblocking(id, LayerSelect::One(LayerId(1))).unwrap();
    assert_eq!(
        k.service_await_read_response(id, LayerSelect::One(LayerId(1)), None),
        Ok(Outcome::Complete)
    );
    assert_eq!(
        k.service_request_read(id, LayerSelect::One(LayerId(0)), None),
        Err(Error::Fail)
    );
    k.shutdown();
    assert!(k.registry().name_available("agg"));
}

#[test]
fn connecting_to_a_missing_or_mismatched_service_fails() {
    let k = operational();
    assert!(Connector::periodic(k.registry(), "nobody", "nobody-lock", MAX_DELAY).is_err());

    k.initialize_sporadic_service("spor", 4, 1, "sp-q", "sp-s").unwrap();
    assert_eq!(
        Connector::periodic(k.registry(), "spor", "sp-q", MAX_DELAY).err(),
        Some(Error::Fail)
    );
    // Initialized but never started.
    let conn = Connector::sporadic(k.registry(), "spor", "sp-q", "sp-s", MAX_DELAY).unwrap();
    assert!(!conn.is_alive());
    assert_eq!(conn.request_nonblocking(), Err(Error::Fail));
    drop(conn);
    k.shutdown();
}

#[test]
fn services_table_is_bounded() {
    let cfg = DermisConfig {
        max_services: 1,
        ..DermisConfig::default()
    };
    let k = Kernel::new(&cfg, ProcessRegistry::new());
    k.open_registration().unwrap();
    k.register_device(DeviceRegistration {
        name: "flat".into(),
        layer_count: 1,
        sensor_count: 3,
        module_count: 1,
        patch_count: 1,
        driver: Arc::new(Flat),
    })
    .unwrap();
    k.command("devs");
    k.build_structures().unwrap();
    k.spawn_writers().unwrap();
    k.command("clbr rgn");
    k.go_operational().unwrap();

    let first = k.initialize_sporadic_service("one", 1, 1, "1q", "1s").unwrap();
    assert_eq!(k.initialize_sporadic_service("two", 1, 1, "2q", "2s"), Err(Error::TooLate));
    k.stop_service(first).unwrap();
    assert!(k.initialize_sporadic_service("two", 1, 1, "2q", "2s").is_ok());
    k.shutdown();
}
