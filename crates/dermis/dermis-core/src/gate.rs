//! Request/response gate of sporadic tasks.
//!
//! Callers post `request` and wait on `response`. The owning task consumes a
//! request, does one round of work, then answers everyone who asked in the
//! meantime with a single broadcast.

use dermis_rt::{Semaphore, WaitError};
use dermis_types::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

pub struct Gate {
    request: Arc<Semaphore>,
    response: Arc<Semaphore>,
    max_delay: Duration,
}

impl Gate {
    /// `max_delay` bounds every single wait of `await_response`.
    pub fn new(request: Arc<Semaphore>, response: Arc<Semaphore>, max_delay: Duration) -> Self {
        Self {
            request,
            response,
            max_delay,
        }
    }

    pub fn request_nonblocking(&self) {
        self.request.post();
    }

    /// Wait for the owner to answer.
    ///
    /// Gives up with `Fail` when `cancel` is raised, when `owner_gone` says
    /// the owner stopped, or when the gate is invalidated.
    pub fn await_response(
        &self,
        cancel: Option<&AtomicBool>,
        owner_gone: impl Fn() -> bool,
    ) -> Result<()> {
        loop {
            match self.response.wait_for(self.max_delay) {
                Ok(()) => return Ok(()),
                Err(WaitError::Invalid) => return Err(Error::Fail),
                Err(WaitError::Timeout) | Err(WaitError::WouldBlock) => {
                    if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) || owner_gone() {
                        return Err(Error::Fail);
                    }
                }
            }
        }
    }

    pub fn request(&self, cancel: Option<&AtomicBool>, owner_gone: impl Fn() -> bool) -> Result<()> {
        self.request_nonblocking();
        self.await_response(cancel, owner_gone)
    }

    /// Owner side: wait for the next request.
    pub fn wait_request(&self, timeout: Duration) -> std::result::Result<(), WaitError> {
        self.request.wait_for(timeout)
    }

    /// Owner side: answer the request just served and every request that
    /// arrived while it was being served.
    ///
    /// Returns the number of extra requests drained.
    pub fn respond_all(&self) -> u64 {
        let mut drained = 0;
        while self.request.try_wait().is_ok() {
            drained += 1;
        }
        for _ in 0..=drained {
            self.response.post();
        }
        if drained > 0 {
            debug!(gate = %self.request.name(), drained, "answered batched requests");
        }
        drained
    }

    /// Owner side, when not serving: swallow pending requests and answer them
    /// without doing any work.
    pub fn acknowledge_pending(&self) {
        if self.request.try_wait().is_ok() {
            self.respond_all();
        }
    }
}
