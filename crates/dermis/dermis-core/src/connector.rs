//! Client side of a service: attach to its output region by name and read it.

use crate::gate::Gate;
use crate::service::{
    MODE_PERIODIC, MODE_SPORADIC, PAYLOAD_OFFSET, ServiceHeader, header_of, sporadic_lock_name,
};
use dermis_icc::ResourceRegistry;
use dermis_mmap::SharedMap;
use dermis_rt::{ReadHold, TimedRwLock, WaitError};
use dermis_types::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

pub struct Connector {
    name: String,
    registry: Arc<dyn ResourceRegistry>,
    region: Arc<SharedMap>,
    lock: Arc<TimedRwLock>,
    gate: Option<Gate>,
    attached: Vec<String>,
    max_delay: Duration,
}

impl Connector {
    /// Connect to the periodic service `name` whose output lock is `lock_name`.
    pub fn periodic(
        registry: &Arc<dyn ResourceRegistry>,
        name: &str,
        lock_name: &str,
        max_delay: Duration,
    ) -> Result<Self> {
        let mut c = Self::attach_region(registry, name, MODE_PERIODIC, max_delay)?;
        c.lock = registry.attach_rwlock(lock_name)?;
        c.attached.push(lock_name.to_owned());
        Ok(c)
    }

    /// Connect to the sporadic service `name`.
    pub fn sporadic(
        registry: &Arc<dyn ResourceRegistry>,
        name: &str,
        request_name: &str,
        response_name: &str,
        max_delay: Duration,
    ) -> Result<Self> {
        let mut c = Self::attach_region(registry, name, MODE_SPORADIC, max_delay)?;
        let lock_name = sporadic_lock_name(name);
        c.lock = registry.attach_rwlock(&lock_name)?;
        c.attached.push(lock_name);
        let request = registry.attach_semaphore(request_name)?;
        c.attached.push(request_name.to_owned());
        let response = registry.attach_semaphore(response_name)?;
        c.attached.push(response_name.to_owned());
        c.gate = Some(Gate::new(request, response, max_delay));
        Ok(c)
    }

    fn attach_region(
        registry: &Arc<dyn ResourceRegistry>,
        name: &str,
        mode: u32,
        max_delay: Duration,
    ) -> Result<Self> {
        let region = registry.attach(name)?;
        // Dropping `c` on a failed check releases the region again.
        let c = Self {
            name: name.to_owned(),
            registry: Arc::clone(registry),
            region,
            lock: TimedRwLock::new(""),
            gate: None,
            attached: vec![name.to_owned()],
            max_delay,
        };
        if c.region.len() < PAYLOAD_OFFSET {
            return Err(Error::BadData);
        }
        let h = c.header();
        if h.validate().is_err() || c.region.len() < PAYLOAD_OFFSET + h.payload_bytes() {
            return Err(Error::BadData);
        }
        if h.mode != mode {
            return Err(Error::Fail);
        }
        debug!(service = name, "connected");
        Ok(c)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> &ServiceHeader {
        header_of(&self.region)
    }

    pub fn is_alive(&self) -> bool {
        self.header().is_alive()
    }

    pub fn is_sporadic(&self) -> bool {
        self.header().mode == MODE_SPORADIC
    }

    /// Share-lock the output. Fails when the service is not alive, the lock
    /// is gone, or `cancel` is raised while waiting.
    pub fn lock(&self, cancel: Option<&AtomicBool>) -> Result<ServiceView<'_>> {
        loop {
            if !self.is_alive() {
                return Err(Error::Fail);
            }
            match self.lock.read_for(self.max_delay) {
                Ok(hold) => {
                    if !self.is_alive() {
                        return Err(Error::Fail);
                    }
                    return Ok(ServiceView {
                        _hold: hold,
                        header: self.header(),
                        region: &self.region,
                    });
                }
                Err(WaitError::Invalid) => return Err(Error::Fail),
                Err(_) => {
                    if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                        return Err(Error::Fail);
                    }
                }
            }
        }
    }

    /// Release a view taken with [`lock`](Self::lock).
    pub fn unlock(&self, view: ServiceView<'_>) {
        drop(view);
    }

    fn gate(&self) -> Result<&Gate> {
        if !self.is_alive() {
            return Err(Error::Fail);
        }
        self.gate.as_ref().ok_or(Error::Fail)
    }

    pub fn request(&self, cancel: Option<&AtomicBool>) -> Result<()> {
        self.gate()?.request(cancel, || !self.is_alive())
    }

    pub fn request_nonblocking(&self) -> Result<()> {
        self.gate()?.request_nonblocking();
        Ok(())
    }

    pub fn await_response(&self, cancel: Option<&AtomicBool>) -> Result<()> {
        self.gate()?.await_response(cancel, || !self.is_alive())
    }

    pub fn disconnect(self) {}
}

impl Drop for Connector {
    fn drop(&mut self) {
        for n in &self.attached {
            self.registry.free(n);
        }
        debug!(service = %self.name, "disconnected");
    }
}

/// The service output, share-locked.
pub struct ServiceView<'a> {
    _hold: ReadHold,
    header: &'a ServiceHeader,
    region: &'a SharedMap,
}

impl ServiceView<'_> {
    pub fn timestamp_ns(&self) -> u64 {
        self.header.timestamp.load(Ordering::Acquire)
    }

    pub fn result_count(&self) -> usize {
        self.header.result_count.load(Ordering::Acquire) as usize
    }

    pub fn elem_size(&self) -> usize {
        self.header.elem_size as usize
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: the payload lies inside the region (checked on connect) and
        // the service only writes it under the write lock this view excludes.
        unsafe {
            std::slice::from_raw_parts(
                self.region.as_ptr().add(PAYLOAD_OFFSET),
                self.header.payload_bytes(),
            )
        }
    }

    /// Elements filled by the last run.
    pub fn results(&self) -> &[u8] {
        let end = (self.result_count() * self.elem_size()).min(self.header.payload_bytes());
        &self.data()[..end]
    }
}
