//! The engine's central state: devices, layers, writers and services, gated
//! by the lifecycle.

use crate::command::{self, Command};
use crate::delivery::{Consume, DeliveryHandle};
use crate::device::{BusyGuard, DeviceCell, DeviceRegistration, DeviceState, LayerDetails, Registered, Shape};
use crate::layout::{CalibrationData, LayerInfo, Layout, RegionTable, Regionalization};
use crate::lifecycle::{Lifecycle, SystemState};
use crate::service::ServiceSlot;
use crate::status::{DeviceStatus, LayerStatus, StatusSnapshot};
use crate::writer::{LayerCell, WriterTask};
use dermis_config::DermisConfig;
use dermis_icc::{LayerRing, ResourceRegistry, RingConfig};
use dermis_rt::{TaskFlags, TaskHandle, in_task_context, stop_all};
use dermis_types::{
    AcquisitionMode, DeviceId, Error, ID_SPACE, LayerId, MAX_BUFFERS, Outcome, Result, SensorId,
};
use parking_lot::{Mutex, RwLock};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct Device {
    cell: Arc<DeviceCell>,
    shape: Shape,
    state: DeviceState,
    /// Layers owned by the device, empty until structures are built.
    layers: Range<usize>,
    /// Keeps the driver busy from registration until structures are built.
    registration: Option<BusyGuard>,
}

struct WriterSlot {
    flags: Arc<TaskFlags>,
    task: Option<TaskHandle>,
}

#[derive(Default)]
struct LayoutState {
    regions: RegionTable,
    calibration: CalibrationData,
    regionalized: bool,
}

pub struct Kernel {
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) registry: Arc<dyn ResourceRegistry>,
    pub(crate) max_delay: Duration,
    pub(crate) stop_grace: Duration,
    pub(crate) max_services: usize,
    pub(crate) services: Mutex<Vec<Option<ServiceSlot>>>,
    max_devices: usize,
    default_buffers: usize,
    started: Instant,
    devices: Mutex<Vec<Device>>,
    layers: RwLock<Vec<Arc<LayerCell>>>,
    writers: Mutex<Vec<WriterSlot>>,
    layout: RwLock<LayoutState>,
    /// Writers are held paused for a sensor remap.
    regionalizing: AtomicBool,
    tags: AtomicU64,
}

impl Kernel {
    pub fn new(config: &DermisConfig, registry: Arc<dyn ResourceRegistry>) -> Arc<Self> {
        let max_delay = config.max_thread_delay();
        Arc::new(Self {
            lifecycle: Arc::new(Lifecycle::new(max_delay)),
            registry,
            max_delay,
            stop_grace: config.stop_grace(),
            max_services: config.max_services.min(ID_SPACE as usize),
            services: Mutex::new(Vec::new()),
            max_devices: config.max_devices.min(ID_SPACE as usize),
            default_buffers: config.buffer_count.clamp(1, MAX_BUFFERS),
            started: Instant::now(),
            devices: Mutex::new(Vec::new()),
            layers: RwLock::new(Vec::new()),
            writers: Mutex::new(Vec::new()),
            layout: RwLock::new(LayoutState::default()),
            regionalizing: AtomicBool::new(false),
            tags: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> SystemState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<dyn ResourceRegistry> {
        &self.registry
    }

    pub fn max_thread_delay(&self) -> Duration {
        self.max_delay
    }

    pub(crate) fn next_tag(&self) -> String {
        format!("{:X}", self.tags.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn layer_cell(&self, id: LayerId) -> Result<Arc<LayerCell>> {
        self.layers.read().get(id.index()).cloned().ok_or(Error::BadId)
    }

    pub(crate) fn layer_ids(&self) -> Vec<LayerId> {
        self.layers.read().iter().map(|l| l.info.id).collect()
    }

    // Registration.

    /// `Init -> ReadyForSources`.
    pub fn open_registration(&self) -> Result<()> {
        if self.lifecycle.advance(SystemState::Init, SystemState::ReadyForSources) {
            Ok(())
        } else {
            Err(Error::TooLate)
        }
    }

    /// Register a device, or revive a paused one under its old identity.
    pub fn register_device(&self, reg: DeviceRegistration) -> Result<Registered> {
        if in_task_context() {
            return Err(Error::BadContext);
        }
        if reg.name.is_empty()
            || reg.layer_count == 0
            || reg.sensor_count == 0
            || reg.module_count == 0
            || reg.patch_count == 0
        {
            return Err(Error::BadData);
        }

        let mut devices = self.devices.lock();
        let known = devices.iter().position(|d| d.cell.name == reg.name);
        match self.lifecycle.state() {
            SystemState::Init => Err(Error::TooEarly),
            SystemState::ReadyForSources => {
                if known.is_some() {
                    return Err(Error::InUse);
                }
                let layers: u64 = devices.iter().map(|d| u64::from(d.shape.layers)).sum();
                if devices.len() >= self.max_devices || layers + u64::from(reg.layer_count) > ID_SPACE {
                    return Err(Error::TooLate);
                }
                let id = DeviceId(devices.len() as u16);
                let cell = DeviceCell::new(id, reg.name.clone(), Arc::clone(&reg.driver));
                let registration = Some(BusyGuard::new(&cell, &reg.driver));
                devices.push(Device {
                    cell,
                    shape: reg.shape(),
                    state: DeviceState::Initializing,
                    layers: 0..0,
                    registration,
                });
                info!(device = %reg.name, %id, layers = reg.layer_count, "device registered");
                Ok(Registered { id, revived: false })
            }
            s if s.is_terminal() => Err(Error::TooLate),
            s if s < SystemState::TasksSpawned => match known {
                Some(_) => Err(Error::InUse),
                None => Err(Error::TooLate),
            },
            _ => {
                let Some(index) = known else {
                    return Err(Error::TooLate);
                };
                self.settle(&mut devices[index]);
                let dev = &mut devices[index];
                if dev.state != DeviceState::Paused || dev.shape != reg.shape() {
                    return Err(Error::InUse);
                }
                // Claim the device so a concurrent revival or resume backs off.
                dev.state = DeviceState::Initializing;
                let cell = Arc::clone(&dev.cell);
                let layers = dev.layers.clone();
                drop(devices);
                self.revive(cell, layers, reg)
            }
        }
    }

    fn revive(&self, cell: Arc<DeviceCell>, layers: Range<usize>, reg: DeviceRegistration) -> Result<Registered> {
        let old: Vec<TaskHandle> = {
            let mut writers = self.writers.lock();
            layers.clone().filter_map(|i| writers.get_mut(i)?.task.take()).collect()
        };
        let grace = self.writer_grace(layers.clone());
        let stuck = stop_all(old, grace);
        if stuck > 0 {
            warn!(device = %cell.name, stuck, "old writers did not stop before revival");
        }

        *cell.driver.lock() = Arc::clone(&reg.driver);
        cell.set_bad_mark(false);
        self.spawn_device_writers(&cell, layers);

        let mut devices = self.devices.lock();
        if let Some(dev) = devices.get_mut(cell.id.index()) {
            dev.state = DeviceState::Paused;
        }
        info!(device = %cell.name, id = %cell.id, "device revived");
        Ok(Registered {
            id: cell.id,
            revived: true,
        })
    }

    /// Wait for registration to open, then register.
    pub fn register_device_blocking(&self, reg: DeviceRegistration, cancel: Option<&AtomicBool>) -> Result<Registered> {
        if in_task_context() {
            return Err(Error::BadContext);
        }
        self.lifecycle
            .wait_until(|s| s >= SystemState::ReadyForSources, cancel, None)?;
        self.register_device(reg)
    }

    /// Close registration ("devs").
    pub fn no_more_devices(&self) -> Result<()> {
        // Registrations run under the device lock, so none is in flight here
        // and the sources are introduced right away.
        let _devices = self.devices.lock();
        self.lifecycle.update(|s| match *s {
            SystemState::ReadyForSources => {
                *s = SystemState::NoMoreSources;
                Ok(())
            }
            SystemState::Init => Err(Error::TooEarly),
            _ => Err(Error::TooLate),
        })?;
        self.lifecycle
            .advance(SystemState::NoMoreSources, SystemState::SourcesIntroduced);
        Ok(())
    }

    // Structures.

    /// Ask every device for its layers and create their rings.
    pub fn build_structures(&self) -> Result<()> {
        match self.lifecycle.state() {
            SystemState::SourcesIntroduced => {}
            s if s < SystemState::SourcesIntroduced => return Err(Error::TooEarly),
            _ => return Err(Error::TooLate),
        }

        let mut devices = self.devices.lock();
        let mut cells = Vec::new();
        for dev in devices.iter_mut() {
            let driver = Arc::clone(&*dev.cell.driver.lock());
            let details: Vec<LayerDetails> = (0..dev.shape.layers as usize).map(|k| driver.details(k)).collect();
            if let Some(bad) = details.iter().find(|d| {
                d.sensor_count == 0
                    || d.module_count == 0
                    || d.patch_count == 0
                    || u64::from(d.sensor_count) > ID_SPACE
            }) {
                warn!(device = %dev.cell.name, layer = %bad.name, "layer has no sensors, modules or patches; device is bad");
                dev.state = DeviceState::Bad;
                continue;
            }
            let total: u32 = details.iter().map(|d| d.sensor_count).sum();
            if total != dev.shape.sensors {
                warn!(device = %dev.cell.name, declared = dev.shape.sensors, reported = total, "sensor count differs from registration");
            }

            let first = cells.len();
            for (k, d) in details.into_iter().enumerate() {
                let info = self.layer_info(LayerId(cells.len() as u16), dev.cell.id, k, d);
                let cfg = RingConfig::new(info.buffer_count, info.sensor_count, info.acquisition_rate);
                let ring = LayerRing::create(&self.registry, info.id, cfg)?;
                debug!(layer = %info.id, name = %info.name, buffers = info.buffer_count, "layer ring created");
                cells.push(LayerCell::new(info, Arc::new(ring)));
            }
            dev.layers = first..cells.len();
            dev.state = DeviceState::Initialized;
        }
        // Drivers are no longer needed as a whole; writers take their own guards.
        for dev in devices.iter_mut() {
            dev.registration = None;
        }
        drop(devices);

        if cells.is_empty() {
            warn!("no layers to acquire");
            return Err(Error::BadData);
        }
        let infos: Vec<LayerInfo> = cells.iter().map(|c| c.info.clone()).collect();
        self.layout.write().regions = RegionTable::single(&infos);
        info!(layers = cells.len(), "structures built");
        *self.layers.write() = cells;
        self.lifecycle
            .advance(SystemState::SourcesIntroduced, SystemState::StructuresBuilt);
        Ok(())
    }

    fn layer_info(&self, id: LayerId, device: DeviceId, index: usize, d: LayerDetails) -> LayerInfo {
        let mut rate = d.acquisition_rate;
        if rate == 0 {
            warn!(layer = %d.name, "acquisition rate 0; using 1 Hz");
            rate = 1;
        }
        let buffers = match d.buffer_count {
            0 => self.default_buffers,
            b if b > MAX_BUFFERS => {
                warn!(layer = %d.name, requested = b, max = MAX_BUFFERS, "too many buffers; capping");
                MAX_BUFFERS
            }
            b => b,
        };
        LayerInfo {
            id,
            device,
            index_in_device: index,
            name: d.name,
            sensor_count: d.sensor_count as usize,
            module_count: d.module_count,
            patch_count: d.patch_count,
            acquisition_rate: rate,
            buffer_count: buffers,
        }
    }

    /// Create every writer, paused, and enter calibration.
    pub fn spawn_writers(&self) -> Result<Outcome> {
        match self.lifecycle.state() {
            SystemState::StructuresBuilt => {}
            s if s < SystemState::StructuresBuilt => return Err(Error::TooEarly),
            _ => return Err(Error::TooLate),
        }
        let layer_count = self.layers.read().len();
        *self.writers.lock() = (0..layer_count)
            .map(|_| WriterSlot {
                flags: TaskFlags::new_paused(),
                task: None,
            })
            .collect();

        let devices: Vec<(Arc<DeviceCell>, Range<usize>)> = self
            .devices
            .lock()
            .iter()
            .filter(|d| d.state != DeviceState::Bad)
            .map(|d| (Arc::clone(&d.cell), d.layers.clone()))
            .collect();
        let succeeded: usize = devices
            .into_iter()
            .map(|(cell, layers)| self.spawn_device_writers(&cell, layers))
            .sum();

        let outcome = Outcome::from_counts(layer_count, succeeded);
        if outcome.is_err() {
            return outcome;
        }
        self.lifecycle
            .advance(SystemState::StructuresBuilt, SystemState::TasksSpawned);
        self.lifecycle
            .advance(SystemState::TasksSpawned, SystemState::Calibrating);
        outcome
    }

    /// Spawn fresh, paused writers for `layers`; returns how many started.
    fn spawn_device_writers(&self, cell: &Arc<DeviceCell>, layers: Range<usize>) -> usize {
        let driver = Arc::clone(&*cell.driver.lock());
        let count = layers.len().max(1) as u32;
        let mut started = 0;
        for i in layers {
            let Ok(layer) = self.layer_cell(LayerId(i as u16)) else {
                continue;
            };
            let k = layer.info.index_in_device;
            let task = WriterTask {
                filler: driver.filler(k),
                offset: layer.info.period() / count * k as u32,
                layer,
                device: Arc::clone(cell),
                lifecycle: Arc::clone(&self.lifecycle),
            };
            let flags = TaskFlags::new_paused();
            match task.spawn(Arc::clone(&flags)) {
                Ok(handle) => {
                    if let Some(slot) = self.writers.lock().get_mut(i) {
                        *slot = WriterSlot {
                            flags,
                            task: Some(handle),
                        };
                    }
                    started += 1;
                }
                Err(e) => warn!(layer = i, error = %e, "could not spawn writer"),
            }
        }
        started
    }

    fn writer_grace(&self, layers: Range<usize>) -> Duration {
        let cells = self.layers.read();
        let longest = layers
            .filter_map(|i| cells.get(i))
            .map(|c| c.info.period())
            .max()
            .unwrap_or_default();
        longest + self.stop_grace
    }

    // Calibration and regionalization.

    fn in_phase(&self, phase: SystemState) -> Result<()> {
        match self.lifecycle.state() {
            s if s == phase => Ok(()),
            s if s < phase => Err(Error::TooEarly),
            _ => Err(Error::TooLate),
        }
    }

    pub fn submit_calibration(&self, data: CalibrationData) -> Result<()> {
        self.in_phase(SystemState::Calibrating)?;
        data.validate(&self.layer_infos())?;
        self.layout.write().calibration = data;
        info!("calibration data stored");
        Ok(())
    }

    /// End calibration ("clbr").
    pub fn end_calibration(&self) -> Result<()> {
        self.in_phase(SystemState::Calibrating)?;
        self.lifecycle
            .advance(SystemState::Calibrating, SystemState::Regionalizing);
        Ok(())
    }

    /// Apply a regionalization: pause every writer, remap sensors, store the
    /// region table, then resume the writers of working devices.
    pub fn regionalize(&self, data: Regionalization) -> Result<()> {
        self.in_phase(SystemState::Regionalizing)?;
        let infos = self.layer_infos();
        data.table.validate(&infos)?;
        for order in &data.orders {
            let info = infos.get(order.layer.index()).ok_or(Error::BadData)?;
            order.validate(info.sensor_count)?;
        }

        self.regionalizing.store(true, Ordering::Release);
        let result = self.remap(data);
        self.regionalizing.store(false, Ordering::Release);
        self.release_working_writers();
        result
    }

    fn remap(&self, data: Regionalization) -> Result<()> {
        let flags: Vec<Arc<TaskFlags>> = self
            .writers
            .lock()
            .iter()
            .map(|w| Arc::clone(&w.flags))
            .collect();
        flags.iter().for_each(|f| f.set_must_pause(true));
        for f in &flags {
            while !f.wait_paused(self.max_delay, || self.lifecycle.is_terminal()) {
                if self.lifecycle.is_terminal() {
                    return Err(Error::TooLate);
                }
            }
        }

        let cells = self.layers.read();
        for order in data.orders {
            if let Some(cell) = cells.get(order.layer.index()) {
                let map: Arc<[SensorId]> = order.order.into();
                *cell.sensor_map.write() = map;
            }
        }
        let mut layout = self.layout.write();
        layout.regions = data.table;
        layout.regionalized = true;
        info!("sensors regionalized");
        Ok(())
    }

    fn release_working_writers(&self) {
        let mut devices = self.devices.lock();
        devices.iter_mut().for_each(|d| self.settle(d));
        let writers = self.writers.lock();
        for dev in devices.iter().filter(|d| d.state == DeviceState::Working) {
            for i in dev.layers.clone() {
                if let Some(w) = writers.get(i) {
                    w.flags.set_must_pause(false);
                }
            }
        }
    }

    /// End regionalization ("rgn"); without submitted data every layer keeps
    /// its order and the single default region.
    pub fn end_regionalization(&self) -> Result<()> {
        self.in_phase(SystemState::Regionalizing)?;
        {
            let mut layout = self.layout.write();
            if !layout.regionalized {
                layout.regions = RegionTable::single(&self.layer_infos());
                info!("regionalization skipped; single default region");
            }
        }
        self.lifecycle
            .advance(SystemState::Regionalizing, SystemState::RegionalizationDone);
        Ok(())
    }

    pub fn go_operational(&self) -> Result<()> {
        self.in_phase(SystemState::RegionalizationDone)?;
        self.lifecycle
            .advance(SystemState::RegionalizationDone, SystemState::Operational);
        Ok(())
    }

    /// Apply every command found in `text`. Commands invalid in the current
    /// phase are logged and ignored.
    pub fn command(&self, text: &str) {
        for cmd in command::scan(text) {
            let state = self.lifecycle.state();
            let applied = match cmd {
                Command::Devs => self.no_more_devices(),
                Command::Clbr => self.end_calibration(),
                Command::Rgn => self.end_regionalization(),
            };
            match applied {
                Ok(()) => info!(command = cmd.keyword(), "command applied"),
                Err(e) => warn!(command = cmd.keyword(), phase = state.phase_name(), error = %e, "invalid command"),
            }
        }
    }

    // Device control.

    fn tasks_phase(&self) -> Result<()> {
        match self.lifecycle.state() {
            SystemState::Failed => Err(Error::TooLate),
            s if s < SystemState::TasksSpawned => Err(Error::TooEarly),
            _ => Ok(()),
        }
    }

    pub fn pause_device(&self, id: DeviceId) -> Result<()> {
        self.tasks_phase()?;
        let mut devices = self.devices.lock();
        let dev = devices.get_mut(id.index()).ok_or(Error::BadId)?;
        self.settle(dev);
        match dev.state {
            DeviceState::Paused => return Ok(()),
            DeviceState::Working | DeviceState::Initialized => {}
            DeviceState::Initializing => return Err(Error::TooEarly),
            DeviceState::Bad => return Err(Error::Fail),
        }
        dev.state = DeviceState::Paused;
        let writers = self.writers.lock();
        for i in dev.layers.clone() {
            if let Some(w) = writers.get(i) {
                w.flags.set_must_pause(true);
            }
        }
        info!(device = %dev.cell.name, "device paused");
        Ok(())
    }

    pub fn resume_device(&self, id: DeviceId) -> Result<()> {
        self.tasks_phase()?;
        let mut devices = self.devices.lock();
        let dev = devices.get_mut(id.index()).ok_or(Error::BadId)?;
        self.settle(dev);
        match dev.state {
            DeviceState::Working => return Ok(()),
            DeviceState::Paused | DeviceState::Initialized => {}
            DeviceState::Initializing => return Err(Error::TooEarly),
            DeviceState::Bad => return Err(Error::Fail),
        }
        dev.state = DeviceState::Working;
        dev.cell.set_bad_mark(false);
        if !self.regionalizing.load(Ordering::Acquire) {
            let writers = self.writers.lock();
            for i in dev.layers.clone() {
                if let Some(w) = writers.get(i) {
                    w.flags.set_must_pause(false);
                }
            }
        }
        info!(device = %dev.cell.name, "device resumed");
        Ok(())
    }

    fn wait_tasks(&self, cancel: Option<&AtomicBool>) -> Result<()> {
        self.lifecycle
            .wait_until(|s| s >= SystemState::TasksSpawned, cancel, None)
            .map(|_| ())
    }

    pub fn pause_device_blocking(&self, id: DeviceId, cancel: Option<&AtomicBool>) -> Result<()> {
        self.wait_tasks(cancel)?;
        self.pause_device(id)
    }

    pub fn resume_device_blocking(&self, id: DeviceId, cancel: Option<&AtomicBool>) -> Result<()> {
        self.wait_tasks(cancel)?;
        self.resume_device(id)
    }

    pub fn resume_all_devices(&self) -> Result<Outcome> {
        let ids: Vec<DeviceId> = self.devices.lock().iter().map(|d| d.cell.id).collect();
        let ok = ids.iter().filter(|id| self.resume_device(**id).is_ok()).count();
        Outcome::from_counts(ids.len(), ok)
    }

    pub fn device_state(&self, id: DeviceId) -> Result<DeviceState> {
        let mut devices = self.devices.lock();
        let dev = devices.get_mut(id.index()).ok_or(Error::BadId)?;
        self.settle(dev);
        Ok(dev.state)
    }

    /// A writer whose fill failed pauses itself and marks its device. From
    /// then on the whole device is paused, so it can be resumed or revived.
    fn settle(&self, dev: &mut Device) {
        if dev.state != DeviceState::Working || !dev.cell.is_marked_bad() {
            return;
        }
        dev.state = DeviceState::Paused;
        let writers = self.writers.lock();
        for i in dev.layers.clone() {
            if let Some(w) = writers.get(i) {
                w.flags.set_must_pause(true);
            }
        }
        warn!(device = %dev.cell.name, "fill failed; device paused");
    }

    /// Whether the writer of `layer` has noticed a pause.
    pub fn writer_paused(&self, layer: LayerId) -> Result<bool> {
        self.writers
            .lock()
            .get(layer.index())
            .map(|w| w.flags.is_paused())
            .ok_or(Error::BadId)
    }

    // Layout access.

    fn layer_infos(&self) -> Vec<LayerInfo> {
        self.layers.read().iter().map(|c| c.info.clone()).collect()
    }

    fn layout_snapshot(&self) -> Layout {
        let layout = self.layout.read();
        Layout {
            layers: self.layer_infos(),
            regions: layout.regions.clone(),
            calibration: layout.calibration.clone(),
        }
    }

    /// The data structures, once operational.
    pub fn layout(&self) -> Result<Layout> {
        match self.lifecycle.state() {
            s if s.is_terminal() => Err(Error::TooLate),
            s if s < SystemState::Operational => Err(Error::TooEarly),
            _ => Ok(self.layout_snapshot()),
        }
    }

    pub fn layout_blocking(&self, cancel: Option<&AtomicBool>) -> Result<Layout> {
        self.lifecycle
            .wait_until(|s| s >= SystemState::Operational, cancel, None)?;
        Ok(self.layout_snapshot())
    }

    /// Sensor order of `layer` as currently applied by its writer.
    pub fn sensor_map(&self, layer: LayerId) -> Result<Vec<SensorId>> {
        Ok(self.layer_cell(layer)?.sensor_map.read().to_vec())
    }

    // Readers.

    /// Start a delivery task on `layer`.
    pub fn attach_reader(
        &self,
        layer: LayerId,
        mode: AcquisitionMode,
        consumer: Box<dyn Consume>,
    ) -> Result<DeliveryHandle> {
        match self.lifecycle.state() {
            s if s.is_terminal() => return Err(Error::TooLate),
            s if s < SystemState::Operational => return Err(Error::TooEarly),
            _ => {}
        }
        if let AcquisitionMode::Periodic { period } = mode
            && period.is_zero()
        {
            return Err(Error::BadData);
        }
        self.spawn_delivery(layer, mode, consumer)
    }

    // Status and teardown.

    pub fn status(&self) -> StatusSnapshot {
        let state = self.lifecycle.state();
        let devices: Vec<DeviceStatus> = {
            let mut devices = self.devices.lock();
            devices.iter_mut().for_each(|d| self.settle(d));
            devices
                .iter()
                .map(|d| DeviceStatus {
                    id: d.cell.id,
                    name: d.cell.name.clone(),
                    state: d.state,
                    marked_bad: d.cell.is_marked_bad(),
                })
                .collect()
        };
        let layers = self
            .layers
            .read()
            .iter()
            .map(|c| {
                let stats = *c.stats.lock();
                LayerStatus::new(
                    c.info.id,
                    c.info.name.clone(),
                    c.info.device,
                    c.ring.header().is_paused(),
                    stats,
                )
            })
            .collect();
        StatusSnapshot {
            phase: state.phase_name(),
            state,
            uptime_ms: self.started.elapsed().as_millis() as u64,
            devices,
            layers,
            services: self.services.lock().iter().flatten().count(),
        }
    }

    /// Enter `Exiting` (unless already failed), stop services and writers,
    /// and release the rings. Returns how many tasks had to be detached.
    pub fn shutdown(&self) -> usize {
        self.lifecycle.exit();

        let services: Vec<ServiceSlot> = self.services.lock().iter_mut().filter_map(Option::take).collect();
        for slot in services {
            self.teardown_service(slot);
        }

        let layer_count = self.layers.read().len();
        let grace = self.writer_grace(0..layer_count);
        let tasks: Vec<TaskHandle> = self
            .writers
            .lock()
            .iter_mut()
            .filter_map(|w| w.task.take())
            .collect();
        let stuck = stop_all(tasks, grace);
        if stuck > 0 {
            warn!(stuck, "writers detached at shutdown");
        }

        for dev in self.devices.lock().iter_mut() {
            dev.registration = None;
        }
        self.layers.write().clear();
        info!("engine shut down");
        stuck
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        let tasks_left = self.writers.get_mut().iter().any(|w| w.task.is_some());
        if tasks_left || !self.layers.get_mut().is_empty() {
            self.shutdown();
        }
    }
}
