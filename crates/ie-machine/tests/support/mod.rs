use std::sync::Arc;

use ie_bus::constants::MIN_BUS_SIZE;
use ie_machine::{Machine, MachineConfig};
use tempfile::TempDir;

/// Builds a `Machine` over a fresh temp service directory, seeded with a
/// placeholder "svc.bin" — `LoopCpu` never interprets the bytes of a loaded
/// image, so any non-empty file satisfies `START`.
pub fn harness() -> (Arc<Machine>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("svc.bin"), [0u8; 16]).unwrap();

    let config = MachineConfig {
        bus_size: MIN_BUS_SIZE,
        service_dir: dir.path().to_path_buf(),
        status_bind: None,
        log_filter: None,
    };
    (Arc::new(Machine::new(config).unwrap()), dir)
}
