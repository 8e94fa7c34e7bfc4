//! Process-wide lifecycle state machine.
//!
//! States only move forward. `Exiting` and `Failed` are absorbing and can be
//! entered from anywhere; every wait on the state gives up once one of them
//! is reached.

use dermis_types::{Error, Result};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Init,
    ReadyForSources,
    NoMoreSources,
    SourcesIntroduced,
    StructuresBuilt,
    TasksSpawned,
    Calibrating,
    Regionalizing,
    RegionalizationDone,
    Operational,
    Exiting,
    Failed,
}

impl SystemState {
    /// Short phase name shown on the status surface.
    pub fn phase_name(self) -> &'static str {
        match self {
            SystemState::Init => "init",
            SystemState::ReadyForSources => "devs",
            SystemState::NoMoreSources | SystemState::SourcesIntroduced => "nodevs",
            SystemState::StructuresBuilt | SystemState::TasksSpawned => "built",
            SystemState::Calibrating => "clbr",
            SystemState::Regionalizing => "rgn",
            SystemState::RegionalizationDone => "preop",
            SystemState::Operational => "op",
            SystemState::Exiting => "exit",
            SystemState::Failed => "fail",
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, SystemState::Exiting | SystemState::Failed)
    }

    /// Writers exist and the state is not terminal.
    #[inline]
    pub fn tasks_running(self) -> bool {
        self >= SystemState::TasksSpawned && !self.is_terminal()
    }
}

pub struct Lifecycle {
    state: Mutex<SystemState>,
    changed: Condvar,
    step: Duration,
}

impl Lifecycle {
    /// `step` bounds every single wait so cancellation flags are polled.
    pub fn new(step: Duration) -> Self {
        Self {
            state: Mutex::new(SystemState::Init),
            changed: Condvar::new(),
            step,
        }
    }

    #[inline]
    pub fn state(&self) -> SystemState {
        *self.state.lock()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Move `from -> to`; fails if the current state is not `from`.
    pub fn advance(&self, from: SystemState, to: SystemState) -> bool {
        let mut st = self.state.lock();
        if *st != from || to <= from {
            return false;
        }
        *st = to;
        drop(st);
        info!(from = from.phase_name(), to = to.phase_name(), ?to, "state change");
        self.changed.notify_all();
        true
    }

    /// Run `f` with the state locked; `f` may replace it with a later state.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut SystemState) -> R) -> R {
        let mut st = self.state.lock();
        let before = *st;
        let r = f(&mut st);
        let after = *st;
        drop(st);
        if after != before {
            info!(to = after.phase_name(), ?after, "state change");
            self.changed.notify_all();
        }
        r
    }

    pub fn fail(&self) {
        self.enter_terminal(SystemState::Failed);
    }

    pub fn exit(&self) {
        self.enter_terminal(SystemState::Exiting);
    }

    fn enter_terminal(&self, to: SystemState) {
        let mut st = self.state.lock();
        if st.is_terminal() {
            return;
        }
        *st = to;
        drop(st);
        info!(to = to.phase_name(), "state change");
        self.changed.notify_all();
    }

    /// Block until `pred` holds for the state.
    ///
    /// Gives up with `TooLate` when a terminal state is reached first, and
    /// with `Fail` when `cancel` is raised or `timeout` passes.
    pub fn wait_until(
        &self,
        pred: impl Fn(SystemState) -> bool,
        cancel: Option<&AtomicBool>,
        timeout: Option<Duration>,
    ) -> Result<SystemState> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.state.lock();
        loop {
            if pred(*st) {
                return Ok(*st);
            }
            if st.is_terminal() {
                return Err(Error::TooLate);
            }
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                return Err(Error::Fail);
            }
            let mut wake = Instant::now() + self.step;
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(Error::Fail);
                }
                wake = wake.min(d);
            }
            self.changed.wait_until(&mut st, wake);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn advances_only_forward_from_the_expected_state() {
        let lc = Lifecycle::new(Duration::from_millis(5));
        assert!(!lc.advance(SystemState::ReadyForSources, SystemState::NoMoreSources));
        assert!(lc.advance(SystemState::Init, SystemState::ReadyForSources));
        assert!(!lc.advance(SystemState::ReadyForSources, SystemState::Init));
        assert_eq!(lc.state().phase_name(), "devs");
    }

    #[test]
    fn terminal_states_absorb() {
        let lc = Lifecycle::new(Duration::from_millis(5));
        lc.fail();
        lc.exit();
        assert_eq!(lc.state(), SystemState::Failed);
        assert!(!lc.advance(SystemState::Failed, SystemState::Failed));
    }

    #[test]
    fn waiters_wake_on_progress_and_on_failure() {
        let lc = Arc::new(Lifecycle::new(Duration::from_millis(5)));
        let l2 = Arc::clone(&lc);
        let waiter = thread::spawn(move || {
            l2.wait_until(|s| s >= SystemState::ReadyForSources, None, None)
        });
        thread::sleep(Duration::from_millis(10));
        lc.advance(SystemState::Init, SystemState::ReadyForSources);
        assert_eq!(waiter.join().unwrap(), Ok(SystemState::ReadyForSources));

        let l3 = Arc::clone(&lc);
        let waiter =
            thread::spawn(move || l3.wait_until(|s| s == SystemState::Operational, None, None));
        thread::sleep(Duration::from_millis(10));
        lc.fail();
        assert_eq!(waiter.join().unwrap(), Err(Error::TooLate));
    }

    #[test]
    fn wait_honors_cancel_and_timeout() {
        let lc = Lifecycle::new(Duration::from_millis(2));
        let cancel = AtomicBool::new(true);
        assert_eq!(
            lc.wait_until(|s| s == SystemState::Operational, Some(&cancel), None),
            Err(Error::Fail)
        );
        assert_eq!(
            lc.wait_until(
                |s| s == SystemState::Operational,
                None,
                Some(Duration::from_millis(10))
            ),
            Err(Error::Fail)
        );
    }
}
