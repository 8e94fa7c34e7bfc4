//! Delivery tasks: readers that hand consistent frames of one layer to a
//! consumer, periodically or on request.

use crate::gate::Gate;
use crate::lifecycle::Lifecycle;
use dermis_icc::{FrameView, LayerRing, ReadStatus, ResourceRegistry, RingReader};
use dermis_rt::{PeriodicTimer, TaskFlags, TaskHandle, TimeStats, WaitError, now_ns};
use dermis_types::{AcquisitionMode, Error, LayerId, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

/// Receives the frames a delivery task reads.
pub trait Consume: Send {
    fn consume(&mut self, frame: &FrameView<'_>);
}

impl<F> Consume for F
where
    F: FnMut(&FrameView<'_>) + Send,
{
    fn consume(&mut self, frame: &FrameView<'_>) {
        self(frame)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaderStats {
    pub reads: u64,
    pub worst_ns: u64,
    /// 0 until the first read.
    pub best_ns: u64,
    pub accumulated_ns: u64,
    /// Current swap-protection estimate.
    pub protection_ns: u64,
    /// Non-blocking lock attempts lost to a concurrent swap.
    pub retries: u64,
}

#[derive(Default)]
struct Shared {
    exec: Mutex<TimeStats>,
    protection_ns: AtomicU64,
    retries: AtomicU64,
    prediction: AtomicBool,
}

pub(crate) struct DeliverySpec {
    pub ring: Arc<LayerRing>,
    pub mode: AcquisitionMode,
    pub consumer: Box<dyn Consume>,
    pub lifecycle: Arc<Lifecycle>,
    pub registry: Arc<dyn ResourceRegistry>,
    pub max_delay: Duration,
    pub stop_grace: Duration,
    /// Unique tag for the gate's registry names of a sporadic reader.
    pub tag: String,
}

/// Owner handle of a running delivery task. Dropping it stops the task.
pub struct DeliveryHandle {
    layer: LayerId,
    mode: AcquisitionMode,
    period: Duration,
    stop_grace: Duration,
    shared: Arc<Shared>,
    gate: Option<Arc<Gate>>,
    gate_names: Vec<String>,
    registry: Arc<dyn ResourceRegistry>,
    task: Option<TaskHandle>,
    flags: Arc<TaskFlags>,
}

fn gate_names(tag: &str) -> [String; 2] {
    [format!("SKNQ{tag}"), format!("SKNS{tag}")]
}

impl DeliveryHandle {
    pub(crate) fn spawn(spec: DeliverySpec) -> Result<Self> {
        let DeliverySpec {
            ring,
            mode,
            consumer,
            lifecycle,
            registry,
            max_delay,
            stop_grace,
            tag,
        } = spec;
        let layer = ring.layer();
        let period = mode.effective_period(ring.period());

        let mut names = Vec::new();
        let gate = if mode.is_sporadic() {
            let [req, resp] = gate_names(&tag);
            let request = registry.alloc_semaphore(&req, 0)?;
            names.push(req);
            let response = match registry.alloc_semaphore(&resp, 0) {
                Ok(s) => s,
                Err(e) => {
                    free_all(&registry, &names);
                    return Err(e.into());
                }
            };
            names.push(resp);
            Some(Arc::new(Gate::new(request, response, max_delay)))
        } else {
            None
        };

        let shared = Arc::new(Shared::default());
        shared.prediction.store(true, Ordering::Relaxed);
        let flags = Arc::new(TaskFlags::default());
        let task = DeliveryTask {
            reader: RingReader::new(ring),
            mode,
            period,
            consumer,
            lifecycle,
            max_delay,
            gate: gate.clone(),
            shared: Arc::clone(&shared),
        };
        let spawned = TaskHandle::spawn(format!("dermis-r{}", layer.0), Arc::clone(&flags), move |f| {
            task.run(f)
        });
        let task = match spawned {
            Ok(t) => t,
            Err(e) => {
                error!(%layer, error = %e, "could not spawn delivery task");
                free_all(&registry, &names);
                return Err(Error::NoMem);
            }
        };
        Ok(Self {
            layer,
            mode,
            period,
            stop_grace,
            shared,
            gate,
            gate_names: names,
            registry,
            task: Some(task),
            flags,
        })
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }

    pub fn mode(&self) -> AcquisitionMode {
        self.mode
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Disable delivery; idempotent.
    pub fn pause(&self) {
        self.flags.set_must_pause(true);
    }

    pub fn resume(&self) {
        self.flags.set_must_pause(false);
    }

    /// Whether the task has noticed a pause (its own or its layer's).
    pub fn is_paused(&self) -> bool {
        self.flags.is_paused()
    }

    pub fn is_running(&self) -> bool {
        self.flags.is_running()
    }

    /// Stop the task within one period plus the stop grace. Returns whether
    /// it left in time.
    pub fn stop(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return true;
        };
        let in_time = task.stop(self.period + self.stop_grace);
        // The gate goes away only after its owner is gone.
        free_all(&self.registry, &self.gate_names);
        self.gate_names.clear();
        in_time
    }

    pub fn set_swap_skip_prediction(&self, enabled: bool) {
        self.shared.prediction.store(enabled, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ReaderStats {
        let exec = *self.shared.exec.lock();
        ReaderStats {
            reads: exec.count,
            worst_ns: exec.worst_ns,
            best_ns: if exec.count == 0 { 0 } else { exec.best_ns },
            accumulated_ns: exec.accumulated_ns,
            protection_ns: self.shared.protection_ns.load(Ordering::Relaxed),
            retries: self.shared.retries.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn gate(&self) -> Option<GateRef> {
        self.gate.as_ref().map(|g| GateRef {
            gate: Arc::clone(g),
            owner: Arc::clone(&self.flags),
        })
    }

    /// Ask a sporadic task for one read and wait for it. `Fail` for periodic
    /// tasks, when `cancel` is raised, or when the task stops.
    pub fn request(&self, cancel: Option<&AtomicBool>) -> Result<()> {
        self.gate().ok_or(Error::Fail)?.request(cancel)
    }

    pub fn request_nonblocking(&self) -> Result<()> {
        self.gate().ok_or(Error::Fail)?.request_nonblocking();
        Ok(())
    }

    pub fn await_response(&self, cancel: Option<&AtomicBool>) -> Result<()> {
        self.gate().ok_or(Error::Fail)?.await_response(cancel)
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A gate together with its owner's flags, usable without holding the handle.
#[derive(Clone)]
pub(crate) struct GateRef {
    gate: Arc<Gate>,
    owner: Arc<TaskFlags>,
}

impl GateRef {
    pub fn request_nonblocking(&self) {
        self.gate.request_nonblocking();
    }

    pub fn await_response(&self, cancel: Option<&AtomicBool>) -> Result<()> {
        let owner = &self.owner;
        self.gate
            .await_response(cancel, || owner.must_stop() || !owner.is_running())
    }

    pub fn request(&self, cancel: Option<&AtomicBool>) -> Result<()> {
        self.request_nonblocking();
        self.await_response(cancel)
    }
}

fn free_all(registry: &Arc<dyn ResourceRegistry>, names: &[String]) {
    for n in names {
        registry.free(n);
    }
}

struct DeliveryTask {
    reader: RingReader,
    mode: AcquisitionMode,
    period: Duration,
    consumer: Box<dyn Consume>,
    lifecycle: Arc<Lifecycle>,
    max_delay: Duration,
    gate: Option<Arc<Gate>>,
    shared: Arc<Shared>,
}

impl DeliveryTask {
    fn run(mut self, flags: &TaskFlags) {
        let layer = self.reader.ring().layer();
        info!(%layer, mode = ?self.mode, period = ?self.period, "delivery task started");
        let mut timer = PeriodicTimer::new(self.period);

        loop {
            if flags.must_stop() || self.lifecycle.is_terminal() {
                break;
            }
            let idle = flags.must_pause() || self.reader.ring().header().is_paused();
            flags.set_paused(idle);
            if idle {
                match &self.gate {
                    Some(gate) => {
                        gate.acknowledge_pending();
                        std::thread::sleep(self.max_delay);
                    }
                    None => timer.wait_period(),
                }
                continue;
            }

            if let Some(gate) = &self.gate {
                match gate.wait_request(self.max_delay) {
                    Ok(()) => {}
                    Err(WaitError::Invalid) => break,
                    Err(_) => continue,
                }
                if flags.must_stop() || flags.must_pause() || self.lifecycle.is_terminal() {
                    gate.respond_all();
                    continue;
                }
            }

            if !self.read_once(flags) {
                break;
            }

            match &self.gate {
                Some(gate) => {
                    gate.respond_all();
                }
                None => timer.wait_period(),
            }
        }

        // Nobody may be left waiting on a task that is gone.
        if let Some(gate) = &self.gate {
            gate.respond_all();
        }
        info!(%layer, "delivery task stopped");
    }

    /// One read; false when the ring is no longer usable.
    fn read_once(&mut self, flags: &TaskFlags) -> bool {
        self.reader
            .set_swap_skip_prediction(self.shared.prediction.load(Ordering::Relaxed));
        let wait = self.max_delay.min(self.period);
        let started = now_ns();
        let ring = Arc::clone(self.reader.ring());
        let lifecycle = &self.lifecycle;
        let shared = &self.shared;
        let consumer = &mut self.consumer;
        let status = self.reader.read(
            wait,
            || flags.must_stop() || flags.must_pause() || ring.header().is_paused() || lifecycle.is_terminal(),
            || {
                shared.retries.fetch_add(1, Ordering::Relaxed);
            },
            |frame| consumer.consume(frame),
        );
        match status {
            Ok(ReadStatus::Delivered) => {
                self.shared.exec.lock().record(now_ns() - started);
                self.shared
                    .protection_ns
                    .store(self.reader.protection_ns(), Ordering::Relaxed);
                true
            }
            Ok(ReadStatus::Stale) => {
                debug!(layer = %ring.layer(), "stale frame skipped");
                true
            }
            Ok(ReadStatus::Aborted) => true,
            Err(e) => {
                error!(layer = %ring.layer(), error = %e, "slot lock unusable; delivery task stops");
                false
            }
        }
    }
}
