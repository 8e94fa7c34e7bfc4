//! Timed readers-writer lock and counting semaphore.
//!
//! Both are invalidatable: once torn down, every blocked and future waiter
//! gets [`WaitError::Invalid`] instead of hanging. That is the only way a task
//! blocked on a peer that is going away can notice, so every wait in the
//! engine goes through these rather than bare `parking_lot` locks.
//!
//! Locks are held through owned guards (an `Arc` of the lock) because a
//! writer keeps its slot locked across cycles and hands it over at swap time.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("would block")]
    WouldBlock,
    #[error("timed out")]
    Timeout,
    #[error("primitive invalidated")]
    Invalid,
}

#[derive(Debug)]
struct RwState {
    readers: u32,
    writer: bool,
    valid: bool,
}

/// Readers-writer lock with try and deadline acquisition.
#[derive(Debug)]
pub struct TimedRwLock {
    name: String,
    state: Mutex<RwState>,
    cv: Condvar,
}

impl TimedRwLock {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(RwState {
                readers: 0,
                writer: false,
                valid: true,
            }),
            cv: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    pub fn try_read(self: &Arc<Self>) -> Result<ReadHold, WaitError> {
        let mut st = self.state.lock();
        if !st.valid {
            return Err(WaitError::Invalid);
        }
        if st.writer {
            return Err(WaitError::WouldBlock);
        }
        st.readers += 1;
        Ok(ReadHold(Arc::clone(self)))
    }

    pub fn read_for(self: &Arc<Self>, timeout: Duration) -> Result<ReadHold, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if !st.valid {
                return Err(WaitError::Invalid);
            }
            if !st.writer {
                st.readers += 1;
                return Ok(ReadHold(Arc::clone(self)));
            }
            if self.cv.wait_until(&mut st, deadline).timed_out() {
                return if !st.valid {
                    Err(WaitError::Invalid)
                } else if !st.writer {
                    st.readers += 1;
                    Ok(ReadHold(Arc::clone(self)))
                } else {
                    Err(WaitError::Timeout)
                };
            }
        }
    }

    pub fn try_write(self: &Arc<Self>) -> Result<WriteHold, WaitError> {
        let mut st = self.state.lock();
        if !st.valid {
            return Err(WaitError::Invalid);
        }
        if st.writer || st.readers > 0 {
            return Err(WaitError::WouldBlock);
        }
        st.writer = true;
        Ok(WriteHold(Arc::clone(self)))
    }

    pub fn write_for(self: &Arc<Self>, timeout: Duration) -> Result<WriteHold, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if !st.valid {
                return Err(WaitError::Invalid);
            }
            if !st.writer && st.readers == 0 {
                st.writer = true;
                return Ok(WriteHold(Arc::clone(self)));
            }
            if self.cv.wait_until(&mut st, deadline).timed_out() {
                return if !st.valid {
                    Err(WaitError::Invalid)
                } else if !st.writer && st.readers == 0 {
                    st.writer = true;
                    Ok(WriteHold(Arc::clone(self)))
                } else {
                    Err(WaitError::Timeout)
                };
            }
        }
    }

    /// Wake every waiter with `Invalid`; holders keep their guards until drop.
    pub fn invalidate(&self) {
        self.state.lock().valid = false;
        self.cv.notify_all();
    }

    fn release_read(&self) {
        let mut st = self.state.lock();
        st.readers = st.readers.saturating_sub(1);
        if st.readers == 0 {
            self.cv.notify_all();
        }
    }

    fn release_write(&self) {
        self.state.lock().writer = false;
        self.cv.notify_all();
    }
}

/// Shared hold on a [`TimedRwLock`]; released on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the hold is dropped"]
pub struct ReadHold(Arc<TimedRwLock>);

impl ReadHold {
    pub fn lock(&self) -> &Arc<TimedRwLock> {
        &self.0
    }
}

impl Drop for ReadHold {
    fn drop(&mut self) {
        self.0.release_read();
    }
}

/// Exclusive hold on a [`TimedRwLock`]; released on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the hold is dropped"]
pub struct WriteHold(Arc<TimedRwLock>);

impl WriteHold {
    pub fn lock(&self) -> &Arc<TimedRwLock> {
        &self.0
    }
}

impl Drop for WriteHold {
    fn drop(&mut self) {
        self.0.release_write();
    }
}

#[derive(Debug)]
struct SemState {
    count: u64,
    valid: bool,
}

/// Counting semaphore used for sporadic request/response handshakes.
#[derive(Debug)]
pub struct Semaphore {
    name: String,
    state: Mutex<SemState>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(name: impl Into<String>, initial: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(SemState {
                count: initial,
                valid: true,
            }),
            cv: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post(&self) {
        let mut st = self.state.lock();
        st.count += 1;
        self.cv.notify_one();
    }

    pub fn value(&self) -> u64 {
        self.state.lock().count
    }

    pub fn try_wait(&self) -> Result<(), WaitError> {
        let mut st = self.state.lock();
        if !st.valid {
            return Err(WaitError::Invalid);
        }
        if st.count == 0 {
            return Err(WaitError::WouldBlock);
        }
        st.count -= 1;
        Ok(())
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<(), WaitError> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if !st.valid {
                return Err(WaitError::Invalid);
            }
            if st.count > 0 {
                st.count -= 1;
                return Ok(());
            }
            if self.cv.wait_until(&mut st, deadline).timed_out() {
                return if !st.valid {
                    Err(WaitError::Invalid)
                } else if st.count > 0 {
                    st.count -= 1;
                    Ok(())
                } else {
                    Err(WaitError::Timeout)
                };
            }
        }
    }

    pub fn invalidate(&self) {
        self.state.lock().valid = false;
        self.cv.notify_all();
    }
}
