//! `Machine`: wires a [`PhysicalBus`], a [`CoprocessorManager`], a
//! [`DebuggerIntegration`], and the `LoopCpu` worker factory together into
//! one runnable unit. This is the crate `ie-machined` (and the test harness
//! under `tests/support`) construct directly.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ie_bus::constants::{COPROC_BASE, COPROC_SIZE, DEFAULT_BUS_SIZE, MIN_BUS_SIZE};
use ie_bus::{CpuKind, MapIoError, PhysicalBus};
use ie_coproc::manager::{CoprocessorManager, DebuggerHandle, WorkerFactory};
use ie_coproc::worker_cpu::WorkerCPU;
use ie_debug::DebuggerIntegration;
use ie_worker::LoopCpu;
use serde::Serialize;

/// Resolved configuration for one [`Machine`]. `Default` matches what
/// `ie-machined` runs with if no environment variables are set; `from_env`
/// layers `IE_SERVICE_DIR`, `IE_BUS_SIZE`, and `IE_STATUS_BIND` on top.
#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub bus_size: usize,
    pub service_dir: PathBuf,
    /// If set, `ie-machined` serves the read-only status surface here.
    pub status_bind: Option<SocketAddr>,
    /// `EnvFilter` directive string for `ie-machined` to apply, if the
    /// operator wants something other than `RUST_LOG` (read first) or the
    /// built-in default. Never itself consulted by `Machine`; carried on the
    /// config purely so one env-var pass resolves everything `ie-machined`
    /// needs before `tracing_subscriber` initializes.
    pub log_filter: Option<String>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            bus_size: DEFAULT_BUS_SIZE,
            service_dir: PathBuf::from("./services"),
            status_bind: None,
            log_filter: None,
        }
    }
}

impl MachineConfig {
    pub fn from_env() -> Self {
        let mut cfg = MachineConfig::default();
        if let Ok(raw) = std::env::var("IE_BUS_SIZE") {
            match raw.parse() {
                Ok(n) => cfg.bus_size = n,
                Err(err) => tracing::warn!(%raw, %err, "ignoring unparseable IE_BUS_SIZE"),
            }
        }
        if let Ok(raw) = std::env::var("IE_SERVICE_DIR") {
            cfg.service_dir = PathBuf::from(raw);
        }
        if let Ok(raw) = std::env::var("IE_STATUS_BIND") {
            match raw.parse() {
                Ok(addr) => cfg.status_bind = Some(addr),
                Err(err) => tracing::warn!(%raw, %err, "ignoring unparseable IE_STATUS_BIND"),
            }
        }
        if let Ok(raw) = std::env::var("IE_LOG") {
            cfg.log_filter = Some(raw);
        }
        cfg
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("failed to prepare service directory {path}: {source}")]
    ServiceDir { path: PathBuf, source: std::io::Error },
    #[error("failed to map coprocessor MMIO range: {0}")]
    MapIo(#[from] MapIoError),
}

fn loop_cpu_factory() -> WorkerFactory {
    Arc::new(|kind: CpuKind, bus: Arc<PhysicalBus>, region: (u32, u32)| {
        Arc::new(LoopCpu::new(kind, bus, region)) as Arc<dyn WorkerCPU>
    })
}

/// One running instance: a physical bus, its coprocessor manager, and the
/// debugger registry they share.
pub struct Machine {
    bus: Arc<PhysicalBus>,
    manager: Arc<CoprocessorManager>,
    debugger: Arc<DebuggerIntegration>,
    config: MachineConfig,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        std::fs::create_dir_all(&config.service_dir).map_err(|source| MachineError::ServiceDir {
            path: config.service_dir.clone(),
            source,
        })?;

        let bus_size = config.bus_size.max(MIN_BUS_SIZE);
        let bus = Arc::new(PhysicalBus::new(bus_size));
        let debugger = Arc::new(DebuggerIntegration::new());
        let handle: Arc<dyn DebuggerHandle> = debugger.clone();

        let manager = Arc::new(CoprocessorManager::new(
            bus.clone(),
            config.service_dir.clone(),
            Some(handle),
            loop_cpu_factory(),
        ));

        bus.map_io(COPROC_BASE, COPROC_BASE + COPROC_SIZE - 1, manager.io_handler())?;

        tracing::info!(
            bus_size,
            service_dir = %config.service_dir.display(),
            "machine ready"
        );

        Ok(Machine { bus, manager, debugger, config })
    }

    pub fn bus(&self) -> &Arc<PhysicalBus> {
        &self.bus
    }

    pub fn manager(&self) -> &Arc<CoprocessorManager> {
        &self.manager
    }

    pub fn debugger(&self) -> &Arc<DebuggerIntegration> {
        &self.debugger
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Stops every active worker. Intended for graceful shutdown; safe to
    /// call more than once.
    pub fn shutdown(&self) {
        self.manager.stop_all();
    }
}

/// The optional read-only status surface (§4.10): never mutates machine
/// state, purely a debugging convenience layered on `axum`.
pub mod status;
