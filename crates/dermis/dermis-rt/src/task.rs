use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

thread_local! {
    static IN_TASK: Cell<bool> = const { Cell::new(false) };
}

/// True on threads spawned through [`TaskHandle::spawn`].
///
/// Several control operations block on engine tasks and must not be called by
/// one of them.
pub fn in_task_context() -> bool {
    IN_TASK.with(Cell::get)
}

#[derive(Debug, Default)]
struct RunState {
    paused: bool,
    running: bool,
}

/// Control flags shared between a task and whoever manages it.
#[derive(Debug, Default)]
pub struct TaskFlags {
    must_stop: AtomicBool,
    must_pause: AtomicBool,
    state: Mutex<RunState>,
    changed: Condvar,
}

impl TaskFlags {
    pub fn new_paused() -> Arc<Self> {
        let flags = Self::default();
        flags.must_pause.store(true, Ordering::Relaxed);
        Arc::new(flags)
    }

    #[inline]
    pub fn must_stop(&self) -> bool {
        self.must_stop.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.must_stop.store(true, Ordering::Release);
    }

    #[inline]
    pub fn must_pause(&self) -> bool {
        self.must_pause.load(Ordering::Acquire)
    }

    pub fn set_must_pause(&self, pause: bool) {
        self.must_pause.store(pause, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Reported by the task itself once it has noticed a pause request.
    pub fn set_paused(&self, paused: bool) {
        let mut st = self.state.lock();
        if st.paused != paused {
            st.paused = paused;
            self.changed.notify_all();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Wait until the task confirms it is paused, it exits, or `abort` says so.
    ///
    /// Returns whether the task is paused (or gone).
    pub fn wait_paused(&self, timeout: Duration, abort: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            if st.paused || !st.running {
                return true;
            }
            if abort() || Instant::now() >= deadline {
                return false;
            }
            let step = (Instant::now() + Duration::from_millis(10)).min(deadline);
            self.changed.wait_until(&mut st, step);
        }
    }

    fn set_running(&self, running: bool) {
        let mut st = self.state.lock();
        st.running = running;
        if !running {
            st.paused = false;
        }
        self.changed.notify_all();
    }

    fn wait_exit(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let mut st = self.state.lock();
        while st.running {
            if self.changed.wait_until(&mut st, deadline).timed_out() {
                return !st.running;
            }
        }
        true
    }
}

struct ExitMark(Arc<TaskFlags>);

impl Drop for ExitMark {
    fn drop(&mut self) {
        self.0.set_running(false);
    }
}

/// Owner side of one engine task thread.
pub struct TaskHandle {
    name: String,
    flags: Arc<TaskFlags>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn `body` on a named thread.
    ///
    /// The task counts as running from the moment this returns, so a stop
    /// issued right away still waits for it.
    pub fn spawn<F>(name: impl Into<String>, flags: Arc<TaskFlags>, body: F) -> io::Result<Self>
    where
        F: FnOnce(&TaskFlags) + Send + 'static,
    {
        let name = name.into();
        flags.set_running(true);
        let inner = Arc::clone(&flags);
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            IN_TASK.with(|c| c.set(true));
            let _exit = ExitMark(Arc::clone(&inner));
            body(&inner);
        });
        match spawned {
            Ok(join) => Ok(Self {
                name,
                flags,
                join: Some(join),
            }),
            Err(e) => {
                flags.set_running(false);
                Err(e)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> &Arc<TaskFlags> {
        &self.flags
    }

    /// Ask the task to stop and wait up to `grace` for it to leave.
    ///
    /// A task still running after the grace period is detached and reported;
    /// returns whether it exited in time.
    pub fn stop(mut self, grace: Duration) -> bool {
        self.flags.request_stop();
        self.finish(grace)
    }

    /// Wait for a task already told to stop.
    pub fn finish(&mut self, grace: Duration) -> bool {
        if self.flags.wait_exit(grace) {
            if let Some(join) = self.join.take()
                && join.join().is_err()
            {
                warn!(task = %self.name, "task panicked");
            }
            debug!(task = %self.name, "task stopped");
            true
        } else {
            warn!(task = %self.name, ?grace, "task did not stop in time; detaching");
            self.join.take();
            false
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.flags.request_stop();
        }
    }
}

/// Stop a group of tasks together: all are told first, then each gets what
/// is left of the shared grace period.
pub fn stop_all(tasks: impl IntoIterator<Item = TaskHandle>, grace: Duration) -> usize {
    let mut tasks: Vec<TaskHandle> = tasks.into_iter().collect();
    for t in &tasks {
        t.flags.request_stop();
    }
    let deadline = Instant::now() + grace;
    let mut stuck = 0;
    for t in &mut tasks {
        let left = deadline.saturating_duration_since(Instant::now());
        if !t.finish(left) {
            stuck += 1;
        }
    }
    stuck
}
