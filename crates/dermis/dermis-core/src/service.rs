//! Services: named aggregators fed by internal delivery tasks that publish
//! one output region, periodically or on request.
//!
//! The output region starts with a [`ServiceHeader`]; the payload follows at
//! [`PAYLOAD_OFFSET`]. The service task writes the payload under the output
//! rw-lock and connectors read it under the same lock.

use crate::delivery::{Consume, DeliveryHandle, DeliverySpec, GateRef};
use crate::gate::Gate;
use crate::kernel::Kernel;
use crate::lifecycle::{Lifecycle, SystemState};
use dermis_mmap::SharedMap;
use dermis_rt::{PeriodicTimer, TaskFlags, TaskHandle, TimedRwLock, WaitError, as_ns, in_task_context, now_ns};
use dermis_types::{AcquisitionMode, Error, LayerId, Outcome, Result, ServiceId};
use std::mem::size_of;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// "DERMISSV" in ASCII.
pub const SERVICE_MAGIC: u64 = 0x4445_524D_4953_5356;
pub const SERVICE_VERSION: u64 = 1;

pub const MODE_PERIODIC: u32 = 1;
pub const MODE_SPORADIC: u32 = 2;

pub const STATUS_DEAD: u32 = 0;
pub const STATUS_ALIVE: u32 = 1;

/// Payload starts on a cache line after the header.
pub const PAYLOAD_OFFSET: usize = size_of::<ServiceHeader>().next_multiple_of(64);

#[repr(C)]
pub struct ServiceHeader {
    pub magic: u64,
    pub version: u64,
    pub mode: u32,
    pub status: AtomicU32,
    pub period_ns: u64,
    pub elem_size: u64,
    pub elem_count: u64,
    /// Monotonic time of the last completed run.
    pub timestamp: AtomicU64,
    /// Elements of the payload filled by the last run.
    pub result_count: AtomicU64,
}

impl ServiceHeader {
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.magic != SERVICE_MAGIC {
            return Err("Bad magic");
        }
        if self.version != SERVICE_VERSION {
            return Err("Bad version");
        }
        if self.mode != MODE_PERIODIC && self.mode != MODE_SPORADIC {
            return Err("Bad mode");
        }
        Ok(())
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_ALIVE
    }

    pub fn payload_bytes(&self) -> usize {
        (self.elem_size * self.elem_count) as usize
    }
}

/// Name of the rw-lock guarding a sporadic service's output.
pub fn sporadic_lock_name(service: &str) -> String {
    format!("{service}$OUT")
}

/// Header of a mapped service region.
///
/// Callers must have validated that the region is at least
/// `PAYLOAD_OFFSET` bytes long.
pub(crate) fn header_of(region: &SharedMap) -> &ServiceHeader {
    // SAFETY: the region is page aligned, at least PAYLOAD_OFFSET bytes long,
    // and its first bytes hold a ServiceHeader written at allocation.
    unsafe { &*(region.as_ptr() as *const ServiceHeader) }
}

/// What a service function writes into.
pub struct ServiceOutput<'a> {
    payload: &'a mut [u8],
    elem_size: usize,
    result_count: u64,
}

impl ServiceOutput<'_> {
    pub fn payload(&mut self) -> &mut [u8] {
        self.payload
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Number of elements the payload holds.
    pub fn capacity(&self) -> usize {
        self.payload.len() / self.elem_size.max(1)
    }

    /// Record how many elements this run produced; capped at capacity.
    pub fn set_result_count(&mut self, count: usize) {
        self.result_count = count.min(self.capacity()) as u64;
    }
}

/// Body of a service task, run once per period or per request.
pub trait ServiceFn: Send {
    fn run(&mut self, out: &mut ServiceOutput<'_>);
}

impl<F> ServiceFn for F
where
    F: FnMut(&mut ServiceOutput<'_>) + Send,
{
    fn run(&mut self, out: &mut ServiceOutput<'_>) {
        self(out)
    }
}

/// Which layers an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerSelect {
    One(LayerId),
    All,
}

impl LayerSelect {
    fn matches(self, layer: LayerId) -> bool {
        match self {
            LayerSelect::One(l) => l == layer,
            LayerSelect::All => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ServiceKind {
    Periodic { period: Duration },
    Sporadic,
}

struct ReaderPlan {
    layer: LayerId,
    mode: AcquisitionMode,
    consumer: Option<Box<dyn Consume>>,
}

pub(crate) struct ServiceSlot {
    name: String,
    kind: ServiceKind,
    region: Arc<SharedMap>,
    lock: Arc<TimedRwLock>,
    gate: Option<Arc<Gate>>,
    /// Registry names to free on stop.
    names: Vec<String>,
    plans: Vec<ReaderPlan>,
    readers: Vec<DeliveryHandle>,
    task: Option<TaskHandle>,
    flags: Arc<TaskFlags>,
}

impl ServiceSlot {
    fn header(&self) -> &ServiceHeader {
        header_of(&self.region)
    }

    fn period(&self) -> Duration {
        match self.kind {
            ServiceKind::Periodic { period } => period,
            ServiceKind::Sporadic => Duration::ZERO,
        }
    }
}

struct ServiceTask {
    name: String,
    region: Arc<SharedMap>,
    lock: Arc<TimedRwLock>,
    gate: Option<Arc<Gate>>,
    period: Duration,
    max_delay: Duration,
    lifecycle: Arc<Lifecycle>,
    func: Box<dyn ServiceFn>,
}

impl ServiceTask {
    fn run(mut self, flags: &TaskFlags) {
        info!(service = %self.name, "service task started");
        match self.gate.clone() {
            Some(gate) => self.run_sporadic(flags, &gate),
            None => self.run_periodic(flags),
        }
        info!(service = %self.name, "service task stopped");
    }

    fn must_leave(&self, flags: &TaskFlags) -> bool {
        flags.must_stop() || self.lifecycle.is_terminal()
    }

    fn run_periodic(&mut self, flags: &TaskFlags) {
        let mut timer = PeriodicTimer::new(self.period);
        while !self.must_leave(flags) {
            if flags.must_pause() {
                flags.set_paused(true);
                timer.wait_period();
                continue;
            }
            flags.set_paused(false);
            if !self.produce(flags) {
                break;
            }
            timer.wait_period();
        }
    }

    fn run_sporadic(&mut self, flags: &TaskFlags, gate: &Gate) {
        while !self.must_leave(flags) {
            if flags.must_pause() {
                flags.set_paused(true);
                gate.acknowledge_pending();
                std::thread::sleep(self.max_delay);
                continue;
            }
            flags.set_paused(false);
            match gate.wait_request(self.max_delay) {
                Ok(()) => {}
                Err(WaitError::Invalid) => break,
                Err(_) => continue,
            }
            let alive = flags.must_pause() || self.must_leave(flags) || self.produce(flags);
            gate.respond_all();
            if !alive {
                break;
            }
        }
        gate.respond_all();
    }

    /// One run of the service function; false when the output lock is gone.
    fn produce(&mut self, flags: &TaskFlags) -> bool {
        let wait = self.max_delay.min(self.period.max(Duration::from_millis(1)));
        let hold = loop {
            match self.lock.write_for(wait) {
                Ok(hold) => break hold,
                Err(WaitError::Invalid) => return false,
                Err(_) if self.must_leave(flags) => return true,
                Err(_) => {}
            }
        };
        let header = header_of(&self.region);
        let len = header.payload_bytes();
        // SAFETY: the payload lies inside the region and is only touched
        // mutably by this task, under the output write lock held in `hold`.
        let payload =
            unsafe { std::slice::from_raw_parts_mut(self.region.as_ptr().add(PAYLOAD_OFFSET), len) };
        let mut out = ServiceOutput {
            payload,
            elem_size: header.elem_size as usize,
            result_count: header.result_count.load(Ordering::Relaxed),
        };
        self.func.run(&mut out);
        header.result_count.store(out.result_count, Ordering::Release);
        header.timestamp.store(now_ns(), Ordering::Release);
        drop(hold);
        true
    }
}

impl Kernel {
    /// Create a periodic service whose output is guarded by `lock_name`.
    pub fn initialize_periodic_service(
        &self,
        name: &str,
        elem_size: usize,
        count: usize,
        lock_name: &str,
        period: Duration,
    ) -> Result<ServiceId> {
        if period.is_zero() {
            return Err(Error::BadData);
        }
        self.initialize_service(name, elem_size, count, ServiceKind::Periodic { period }, &[lock_name])
    }

    /// Create a sporadic service answering on `request_name`/`response_name`.
    pub fn initialize_sporadic_service(
        &self,
        name: &str,
        elem_size: usize,
        count: usize,
        request_name: &str,
        response_name: &str,
    ) -> Result<ServiceId> {
        self.initialize_service(
            name,
            elem_size,
            count,
            ServiceKind::Sporadic,
            &[request_name, response_name],
        )
    }

    fn initialize_service(
        &self,
        name: &str,
        elem_size: usize,
        count: usize,
        kind: ServiceKind,
        sync_names: &[&str],
    ) -> Result<ServiceId> {
        if in_task_context() {
            return Err(Error::BadContext);
        }
        if elem_size == 0 || count == 0 {
            return Err(Error::BadData);
        }
        match self.lifecycle.state() {
            s if s.is_terminal() => return Err(Error::TooLate),
            s if s < SystemState::Operational => return Err(Error::TooEarly),
            _ => {}
        }

        let lock_name = match kind {
            ServiceKind::Periodic { .. } => sync_names[0].to_owned(),
            ServiceKind::Sporadic => sporadic_lock_name(name),
        };
        let mut wanted: Vec<&str> = vec![name];
        wanted.extend_from_slice(sync_names);
        if matches!(kind, ServiceKind::Sporadic) {
            wanted.push(&lock_name);
        }
        for (i, n) in wanted.iter().enumerate() {
            if n.is_empty() || !self.registry.name_available(n) || wanted[..i].contains(n) {
                return Err(Error::BadName);
            }
        }

        let mut services = self.services.lock();
        let free_slot = match services.iter().position(Option::is_none) {
            Some(i) => i,
            None if services.len() < self.max_services => {
                services.push(None);
                services.len() - 1
            }
            None => return Err(Error::TooLate),
        };

        let payload = elem_size.checked_mul(count).ok_or(Error::BadData)?;
        let mut names = Vec::new();
        let built = self.allocate_service(name, elem_size, count, payload, &kind, sync_names, &lock_name, &mut names);
        let (region, lock, gate) = match built {
            Ok(parts) => parts,
            Err(e) => {
                for n in &names {
                    self.registry.free(n);
                }
                return Err(e);
            }
        };

        services[free_slot] = Some(ServiceSlot {
            name: name.to_owned(),
            kind,
            region,
            lock,
            gate,
            names,
            plans: Vec::new(),
            readers: Vec::new(),
            task: None,
            flags: Arc::new(TaskFlags::default()),
        });
        let id = ServiceId(free_slot as u16);
        info!(service = name, %id, elem_size, count, "service initialized");
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn allocate_service(
        &self,
        name: &str,
        elem_size: usize,
        count: usize,
        payload: usize,
        kind: &ServiceKind,
        sync_names: &[&str],
        lock_name: &str,
        names: &mut Vec<String>,
    ) -> Result<(Arc<SharedMap>, Arc<TimedRwLock>, Option<Arc<Gate>>)> {
        let region = self.registry.alloc(name, PAYLOAD_OFFSET + payload)?;
        names.push(name.to_owned());
        let (mode, period_ns) = match kind {
            ServiceKind::Periodic { period } => (MODE_PERIODIC, as_ns(*period)),
            ServiceKind::Sporadic => (MODE_SPORADIC, 0),
        };
        // SAFETY: freshly allocated, large enough for the header, not yet
        // visible to anyone else.
        unsafe {
            ptr::write(
                region.as_ptr() as *mut ServiceHeader,
                ServiceHeader {
                    magic: SERVICE_MAGIC,
                    version: SERVICE_VERSION,
                    mode,
                    status: AtomicU32::new(STATUS_DEAD),
                    period_ns,
                    elem_size: elem_size as u64,
                    elem_count: count as u64,
                    timestamp: AtomicU64::new(0),
                    result_count: AtomicU64::new(0),
                },
            );
        }

        let lock = self.registry.alloc_rwlock(lock_name)?;
        names.push(lock_name.to_owned());

        let gate = match kind {
            ServiceKind::Periodic { .. } => None,
            ServiceKind::Sporadic => {
                let request = self.registry.alloc_semaphore(sync_names[0], 0)?;
                names.push(sync_names[0].to_owned());
                let response = self.registry.alloc_semaphore(sync_names[1], 0)?;
                names.push(sync_names[1].to_owned());
                Some(Arc::new(Gate::new(request, response, self.max_delay)))
            }
        };
        Ok((region, lock, gate))
    }

    fn with_service<R>(&self, id: ServiceId, f: impl FnOnce(&mut ServiceSlot) -> Result<R>) -> Result<R> {
        let mut services = self.services.lock();
        let slot = services
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(Error::BadId)?;
        f(slot)
    }

    /// Feed the service from `target` through internal delivery tasks.
    ///
    /// `make_consumer` is called once per layer. Readers of a started service
    /// start right away, others with the service.
    pub fn service_acquire_layer(
        &self,
        id: ServiceId,
        target: LayerSelect,
        mode: AcquisitionMode,
        mut make_consumer: impl FnMut(LayerId) -> Box<dyn Consume>,
    ) -> Result<Outcome> {
        if let AcquisitionMode::Periodic { period } = mode
            && period.is_zero()
        {
            return Err(Error::BadData);
        }
        let layers: Vec<LayerId> = match target {
            LayerSelect::One(l) => {
                self.layer_cell(l)?;
                vec![l]
            }
            LayerSelect::All => self.layer_ids(),
        };
        let started = self.with_service(id, |s| Ok(s.task.is_some()))?;
        let mut plans: Vec<ReaderPlan> = layers
            .into_iter()
            .map(|layer| ReaderPlan {
                layer,
                mode,
                consumer: Some(make_consumer(layer)),
            })
            .collect();

        if !started {
            let n = plans.len();
            self.with_service(id, |s| {
                s.plans.append(&mut plans);
                Ok(())
            })?;
            return Outcome::from_counts(n, n);
        }

        let (attempted, readers) = self.spawn_readers(&mut plans);
        let succeeded = readers.len();
        self.with_service(id, |s| {
            s.readers.extend(readers);
            Ok(())
        })?;
        Outcome::from_counts(attempted, succeeded)
    }

    fn spawn_readers(&self, plans: &mut [ReaderPlan]) -> (usize, Vec<DeliveryHandle>) {
        let mut readers = Vec::new();
        for plan in plans.iter_mut() {
            let Some(consumer) = plan.consumer.take() else {
                continue;
            };
            match self.spawn_delivery(plan.layer, plan.mode, consumer) {
                Ok(r) => readers.push(r),
                Err(e) => warn!(layer = %plan.layer, error = %e, "service reader failed to start"),
            }
        }
        (plans.len(), readers)
    }

    pub(crate) fn spawn_delivery(
        &self,
        layer: LayerId,
        mode: AcquisitionMode,
        consumer: Box<dyn Consume>,
    ) -> Result<DeliveryHandle> {
        let cell = self.layer_cell(layer)?;
        DeliveryHandle::spawn(DeliverySpec {
            ring: Arc::clone(&cell.ring),
            mode,
            consumer,
            lifecycle: Arc::clone(&self.lifecycle),
            registry: Arc::clone(&self.registry),
            max_delay: self.max_delay,
            stop_grace: self.stop_grace,
            tag: self.next_tag(),
        })
    }

    /// Start the service's readers, then its task.
    ///
    /// `Partial` when some readers failed; `Fail` when all of them did.
    pub fn start_service(&self, id: ServiceId, func: Box<dyn ServiceFn>) -> Result<Outcome> {
        let mut plans = self.with_service(id, |s| {
            if s.task.is_some() {
                return Err(Error::Fail);
            }
            Ok(std::mem::take(&mut s.plans))
        })?;
        let (attempted, readers) = self.spawn_readers(&mut plans);
        let outcome = Outcome::from_counts(attempted, readers.len())?;

        self.with_service(id, |s| {
            let task = ServiceTask {
                name: s.name.clone(),
                region: Arc::clone(&s.region),
                lock: Arc::clone(&s.lock),
                gate: s.gate.clone(),
                period: s.period(),
                max_delay: self.max_delay,
                lifecycle: Arc::clone(&self.lifecycle),
                func,
            };
            let handle = TaskHandle::spawn(format!("dermis-s{}", id.0), Arc::clone(&s.flags), move |f| {
                task.run(f)
            })
            .map_err(|e| {
                warn!(service = %s.name, error = %e, "could not spawn service task");
                Error::NoMem
            })?;
            s.task = Some(handle);
            s.readers.extend(readers);
            s.header().status.store(STATUS_ALIVE, Ordering::Release);
            info!(service = %s.name, readers = s.readers.len(), "service started");
            Ok(outcome)
        })
    }

    pub fn pause_service(&self, id: ServiceId) -> Result<()> {
        self.with_service(id, |s| {
            s.flags.set_must_pause(true);
            s.readers.iter().for_each(DeliveryHandle::pause);
            Ok(())
        })
    }

    pub fn resume_service(&self, id: ServiceId) -> Result<()> {
        self.with_service(id, |s| {
            s.flags.set_must_pause(false);
            s.readers.iter().for_each(DeliveryHandle::resume);
            Ok(())
        })
    }

    /// Mark the service dead, stop its task and readers, then release its
    /// region and names.
    pub fn stop_service(&self, id: ServiceId) -> Result<()> {
        let slot = self
            .services
            .lock()
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(Error::BadId)?;
        self.teardown_service(slot);
        Ok(())
    }

    pub(crate) fn teardown_service(&self, mut slot: ServiceSlot) {
        slot.header().status.store(STATUS_DEAD, Ordering::Release);
        let longest = slot
            .readers
            .iter()
            .map(DeliveryHandle::period)
            .fold(slot.period(), Duration::max);
        let grace = longest + self.stop_grace;
        if let Some(task) = slot.task.take()
            && !task.stop(grace)
        {
            warn!(service = %slot.name, "service task outlived its grace period");
        }
        for reader in slot.readers.drain(..) {
            reader.stop();
        }
        for n in &slot.names {
            self.registry.free(n);
        }
        info!(service = %slot.name, "service stopped");
    }

    fn service_gates(&self, id: ServiceId, target: LayerSelect) -> Result<Vec<GateRef>> {
        self.with_service(id, |s| {
            Ok(s.readers
                .iter()
                .filter(|r| target.matches(r.layer()))
                .filter_map(DeliveryHandle::gate)
                .collect())
        })
    }

    /// Ask the service's sporadic readers of `target` for a read and wait.
    pub fn service_request_read(
        &self,
        id: ServiceId,
        target: LayerSelect,
        cancel: Option<&AtomicBool>,
    ) -> Result<Outcome> {
        let gates = self.service_gates(id, target)?;
        if gates.is_empty() {
            return Err(Error::Fail);
        }
        gates.iter().for_each(GateRef::request_nonblocking);
        let ok = gates.iter().filter(|g| g.await_response(cancel).is_ok()).count();
        Outcome::from_counts(gates.len(), ok)
    }

    pub fn service_request_read_nonblocking(&self, id: ServiceId, target: LayerSelect) -> Result<Outcome> {
        let gates = self.service_gates(id, target)?;
        if gates.is_empty() {
            return Err(Error::Fail);
        }
        gates.iter().for_each(GateRef::request_nonblocking);
        Ok(Outcome::Complete)
    }

    pub fn service_await_read_response(
        &self,
        id: ServiceId,
        target: LayerSelect,
        cancel: Option<&AtomicBool>,
    ) -> Result<Outcome> {
        let gates = self.service_gates(id, target)?;
        if gates.is_empty() {
            return Err(Error::Fail);
        }
        let ok = gates.iter().filter(|g| g.await_response(cancel).is_ok()).count();
        Outcome::from_counts(gates.len(), ok)
    }

    pub fn service_name(&self, id: ServiceId) -> Result<String> {
        self.with_service(id, |s| Ok(s.name.clone()))
    }
}
