//! Drives a [`Kernel`] through its initialization stages on a dedicated
//! thread, while operators feed it text commands.

use dermis_config::DermisConfig;
use dermis_core::{Error, Kernel, Outcome, Result, StatusSnapshot, SystemState};
use dermis_icc::{NAME_PREFIX, ResourceRegistry};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

pub struct DermisEngine {
    kernel: Arc<Kernel>,
    stop: Arc<AtomicBool>,
    init: Option<JoinHandle<()>>,
}

impl DermisEngine {
    /// Reclaim names left over by a previous run, open device registration
    /// and start the init driver.
    pub fn start(config: &DermisConfig, registry: Arc<dyn ResourceRegistry>) -> io::Result<Self> {
        let stale = reclaim_stale(registry.as_ref());
        if stale > 0 {
            warn!(stale, "reclaimed names left by a previous run");
        }

        let kernel = Kernel::new(config, registry);
        kernel.open_registration().map_err(io::Error::other)?;
        let stop = Arc::new(AtomicBool::new(false));
        let stages = Stages {
            skip_calibration: config.skip_calibration,
            skip_regionalization: config.skip_regionalization,
        };
        let init = thread::Builder::new().name("dermis-init".into()).spawn({
            let kernel = Arc::clone(&kernel);
            let stop = Arc::clone(&stop);
            move || stages.drive(&kernel, &stop)
        })?;
        info!("engine started; waiting for devices");
        Ok(Self {
            kernel,
            stop,
            init: Some(init),
        })
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn state(&self) -> SystemState {
        self.kernel.state()
    }

    /// Forward an operator command line ("devs", "clbr", "rgn").
    pub fn command(&self, text: &str) {
        self.kernel.command(text);
    }

    pub fn status(&self) -> StatusSnapshot {
        self.kernel.status()
    }

    /// Block until operational; `TooLate` if initialization failed, `Fail`
    /// on timeout.
    pub fn wait_operational(&self, timeout: Option<Duration>) -> Result<()> {
        self.kernel
            .lifecycle()
            .wait_until(|s| s == SystemState::Operational, None, timeout)
            .map(|_| ())
    }

    /// Stop the init driver, then every task. Returns how many tasks had to
    /// be detached.
    pub fn shutdown(mut self) -> usize {
        self.halt()
    }

    fn halt(&mut self) -> usize {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(init) = self.init.take()
            && init.join().is_err()
        {
            error!("init driver panicked");
        }
        self.kernel.shutdown()
    }
}

impl Drop for DermisEngine {
    fn drop(&mut self) {
        if self.init.is_some() {
            self.halt();
        }
    }
}

/// Free every engine-reserved name still held in `registry`.
pub fn reclaim_stale(registry: &dyn ResourceRegistry) -> usize {
    registry
        .names_with_prefix(NAME_PREFIX)
        .iter()
        .filter(|name| registry.make_available(name))
        .count()
}

#[derive(Debug, Clone, Copy)]
struct Stages {
    skip_calibration: bool,
    skip_regionalization: bool,
}

impl Stages {
    fn drive(self, kernel: &Kernel, stop: &AtomicBool) {
        match self.run(kernel, stop) {
            Ok(()) => info!("engine operational"),
            Err(_) if stop.load(Ordering::Relaxed) || kernel.lifecycle().is_terminal() => {
                info!(phase = kernel.state().phase_name(), "init driver stopped");
            }
            Err(e) => {
                error!(error = %e, phase = kernel.state().phase_name(), "initialization failed");
                kernel.lifecycle().fail();
            }
        }
    }

    fn run(self, kernel: &Kernel, stop: &AtomicBool) -> Result<()> {
        let lifecycle = kernel.lifecycle();
        lifecycle.wait_until(|s| s >= SystemState::SourcesIntroduced, Some(stop), None)?;

        kernel.build_structures()?;
        if kernel.spawn_writers()? == Outcome::Partial {
            warn!("some writers failed to start");
        }
        // Bad devices never resume; the rest still acquire.
        if !matches!(kernel.resume_all_devices(), Ok(Outcome::Complete)) {
            warn!("some devices did not resume");
        }

        if self.skip_calibration {
            already_done(kernel.end_calibration())?;
        } else {
            info!("calibrating; send \"clbr\" to finish");
        }
        lifecycle.wait_until(|s| s >= SystemState::Regionalizing, Some(stop), None)?;

        if self.skip_regionalization {
            already_done(kernel.end_regionalization())?;
        } else {
            info!("regionalizing; send \"rgn\" to finish");
        }
        lifecycle.wait_until(|s| s >= SystemState::RegionalizationDone, Some(stop), None)?;

        kernel.go_operational()
    }
}

/// An operator may have ended the phase first.
fn already_done(r: Result<()>) -> Result<()> {
    match r {
        Err(Error::TooLate) => Ok(()),
        r => r,
    }
}
