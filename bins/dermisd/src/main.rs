mod virtual_device;

use anyhow::Context;
use dermis_config::DermisConfig;
use dermis_core::{Kernel, StatusSnapshot};
use dermis_engine::DermisEngine;
use dermis_icc::ProcessRegistry;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use virtual_device::VirtualDevice;

const STATUS_EVERY: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => DermisConfig::load(path.as_str()).with_context(|| format!("loading {path}"))?,
        None => DermisConfig::default(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let engine = DermisEngine::start(&config, ProcessRegistry::new()).context("starting engine")?;
    let devices = if config.devices.is_empty() {
        vec![VirtualDevice::fallback()]
    } else {
        config.devices.clone()
    };
    for dev in &devices {
        let reg = engine
            .kernel()
            .register_device(VirtualDevice::registration(dev))
            .with_context(|| format!("registering device {}", dev.name))?;
        info!(device = %dev.name, id = %reg.id, "virtual device registered");
    }

    let done = Arc::new(AtomicBool::new(false));
    let reporter = config
        .status_path
        .as_ref()
        .map(|path| spawn_reporter(Arc::clone(engine.kernel()), PathBuf::from(path), Arc::clone(&done)))
        .transpose()
        .context("starting status reporter")?;

    info!("commands: devs, clbr, rgn; quit to exit");
    for line in std::io::stdin().lock().lines() {
        let line = line.context("reading commands")?;
        if line.trim() == "quit" {
            break;
        }
        engine.command(&line);
        if engine.state().is_terminal() {
            warn!(phase = engine.state().phase_name(), "engine stopped");
            break;
        }
    }

    let stuck = engine.shutdown();
    if stuck > 0 {
        warn!(stuck, "tasks detached at exit");
    }
    done.store(true, Ordering::Relaxed);
    if let Some(reporter) = reporter
        && reporter.join().is_err()
    {
        warn!("status reporter panicked");
    }
    Ok(())
}

/// Rewrite the status file every [`STATUS_EVERY`], and once more on exit.
fn spawn_reporter(kernel: Arc<Kernel>, path: PathBuf, done: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name("dermis-status".into()).spawn(move || {
        loop {
            let last = done.load(Ordering::Relaxed);
            if let Err(e) = write_status(&kernel.status(), &path) {
                warn!(error = %e, path = %path.display(), "status not written");
            }
            if last {
                break;
            }
            thread::sleep(STATUS_EVERY);
        }
    })
}

fn write_status(status: &StatusSnapshot, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(status)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
