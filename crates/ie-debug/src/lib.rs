//! `DebuggerIntegration`: lets a human operator register any emulated CPU
//! (workers included), freeze/resume it, and single-step it under a
//! breakpoint trap loop.
//!
//! This is the sole implementor of `ie_coproc::manager::DebuggerHandle` —
//! `ie-coproc` depends only on that trait, never on this crate, so the
//! manager can drive registration without creating a cycle.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use ie_coproc::manager::{DebuggerHandle, Pausable};
use ie_coproc::worker_cpu::{BreakpointHit, WorkerCPU};

/// How often the trap loop checks its stop channel between `step()` calls.
const TRAP_STOP_POLL: Duration = Duration::from_millis(1);

struct TrapLoop {
    stop_tx: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

struct Registration {
    label: &'static str,
    cpu: Arc<dyn WorkerCPU>,
    pausable: Arc<dyn Pausable>,
    trap: Option<TrapLoop>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    cpus: std::collections::HashMap<i64, Registration>,
}

/// The debugger's CPU registry. One instance is shared (via `Arc`) between
/// `ie-machine`'s wiring (which hands it to `CoprocessorManager`) and any
/// operator-facing surface that wants to pause/resume/step a worker.
#[derive(Default)]
pub struct DebuggerIntegration {
    inner: Mutex<Inner>,
}

impl DebuggerIntegration {
    pub fn new() -> Self {
        DebuggerIntegration::default()
    }

    /// Forwards a breakpoint sink to the named CPU's own trait-level
    /// channel (used for hits detected during normal `execute()`, as
    /// opposed to this debugger's own trap-mode loop below).
    pub fn set_breakpoint_channel(&self, monitor_id: i64, sink: mpsc::Sender<BreakpointHit>, cpu_id: u32) {
        let inner = self.inner.lock().unwrap();
        if let Some(reg) = inner.cpus.get(&monitor_id) {
            reg.cpu.set_breakpoint_channel(sink, cpu_id);
        }
    }

    pub fn pause(&self, monitor_id: i64) -> bool {
        if monitor_id == -1 {
            return false;
        }
        let pausable = {
            let inner = self.inner.lock().unwrap();
            inner.cpus.get(&monitor_id).map(|r| r.pausable.clone())
        };
        pausable.map(|p| p.pause()).unwrap_or(false)
    }

    pub fn unpause(&self, monitor_id: i64) -> bool {
        if monitor_id == -1 {
            return false;
        }
        let pausable = {
            let inner = self.inner.lock().unwrap();
            inner.cpus.get(&monitor_id).map(|r| r.pausable.clone())
        };
        pausable.map(|p| p.unpause()).unwrap_or(false)
    }

    pub fn is_frozen(&self, monitor_id: i64) -> Option<bool> {
        let inner = self.inner.lock().unwrap();
        inner.cpus.get(&monitor_id).map(|r| r.pausable.is_frozen())
    }

    pub fn label_of(&self, monitor_id: i64) -> Option<&'static str> {
        let inner = self.inner.lock().unwrap();
        inner.cpus.get(&monitor_id).map(|r| r.label)
    }

    /// Starts the breakpoint trap loop for `monitor_id` on a dedicated
    /// thread: drives the CPU via `step()`, checking `has_breakpoint(pc)`
    /// after every step. On a hit, emits one `BreakpointHit` on `sink` and
    /// exits, leaving the CPU not-running. A no-op if a trap loop is already
    /// running for this CPU.
    pub fn start_trap_mode(&self, monitor_id: i64, sink: mpsc::Sender<BreakpointHit>, cpu_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        let Some(reg) = inner.cpus.get_mut(&monitor_id) else {
            return;
        };
        if reg.trap.is_some() {
            return;
        }

        let cpu = reg.cpu.clone();
        let (stop_tx, stop_rx) = mpsc::channel();
        let join = thread::spawn(move || {
            loop {
                if stop_rx.recv_timeout(TRAP_STOP_POLL).is_ok() {
                    return;
                }
                cpu.step();
                let pc = cpu.get_register("pc").unwrap_or(0) as u32;
                if cpu.has_breakpoint(pc) {
                    let _ = sink.send(BreakpointHit { cpu_id, address: pc });
                    cpu.set_running(false);
                    return;
                }
            }
        });

        reg.trap = Some(TrapLoop { stop_tx, join: Some(join) });
    }

    /// Closes the trap loop's stop channel and waits for it to exit, then
    /// clears the CPU's running flag. A no-op if no trap loop is active.
    pub fn stop_trap_mode(&self, monitor_id: i64) {
        let trap = {
            let mut inner = self.inner.lock().unwrap();
            inner.cpus.get_mut(&monitor_id).and_then(|r| r.trap.take())
        };
        let Some(mut trap) = trap else {
            return;
        };
        drop(trap.stop_tx);
        if let Some(handle) = trap.join.take() {
            let _ = handle.join();
        }
        let inner = self.inner.lock().unwrap();
        if let Some(reg) = inner.cpus.get(&monitor_id) {
            reg.cpu.set_running(false);
        }
    }
}

impl DebuggerHandle for DebuggerIntegration {
    fn register_cpu(&self, label: &'static str, cpu: Arc<dyn WorkerCPU>, control: Arc<dyn Pausable>) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.cpus.insert(
            id,
            Registration { label, cpu, pausable: control, trap: None },
        );
        tracing::info!(label, monitor_id = id, "debugger registered a CPU");
        id
    }

    fn unregister_cpu(&self, monitor_id: i64) {
        if monitor_id == -1 {
            return;
        }
        self.stop_trap_mode(monitor_id);
        let mut inner = self.inner.lock().unwrap();
        inner.cpus.remove(&monitor_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ie_coproc::worker_cpu::{DisassembledInstruction, RegisterValue};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeCpu {
        pc: AtomicU32,
        running: AtomicBool,
        breakpoints: Mutex<Vec<u32>>,
    }

    impl FakeCpu {
        fn new() -> Self {
            FakeCpu { pc: AtomicU32::new(0), running: AtomicBool::new(true), breakpoints: Mutex::new(Vec::new()) }
        }
    }

    impl WorkerCPU for FakeCpu {
        fn reset(&self) {}
        fn set_pc(&self, addr: u32) {
            self.pc.store(addr, Ordering::Relaxed);
        }
        fn set_running(&self, running: bool) {
            self.running.store(running, Ordering::Relaxed);
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::Relaxed)
        }
        fn is_halted(&self) -> bool {
            false
        }
        fn execute(&self) {}
        fn step(&self) -> u64 {
            self.pc.fetch_add(1, Ordering::Relaxed);
            1
        }
        fn set_breakpoint(&self, addr: u32) {
            self.breakpoints.lock().unwrap().push(addr);
        }
        fn clear_breakpoint(&self, addr: u32) {
            self.breakpoints.lock().unwrap().retain(|&a| a != addr);
        }
        fn clear_all_breakpoints(&self) {
            self.breakpoints.lock().unwrap().clear();
        }
        fn has_breakpoint(&self, addr: u32) -> bool {
            self.breakpoints.lock().unwrap().contains(&addr)
        }
        fn list_breakpoints(&self) -> Vec<u32> {
            self.breakpoints.lock().unwrap().clone()
        }
        fn set_breakpoint_channel(&self, _sink: mpsc::Sender<BreakpointHit>, _cpu_id: u32) {}
        fn get_registers(&self) -> Vec<RegisterValue> {
            Vec::new()
        }
        fn get_register(&self, name: &str) -> Option<u64> {
            match name {
                "pc" => Some(self.pc.load(Ordering::Relaxed) as u64),
                _ => None,
            }
        }
        fn set_register(&self, _name: &str, _value: u64) -> bool {
            false
        }
        fn read_memory(&self, _addr: u32, _len: usize) -> Vec<u8> {
            Vec::new()
        }
        fn write_memory(&self, _addr: u32, _bytes: &[u8]) {}
        fn disassemble(&self, _addr: u32, _count: usize) -> Vec<DisassembledInstruction> {
            Vec::new()
        }
    }

    struct FakePausable {
        frozen: Mutex<bool>,
    }
    impl Pausable for FakePausable {
        fn pause(&self) -> bool {
            *self.frozen.lock().unwrap() = true;
            true
        }
        fn unpause(&self) -> bool {
            *self.frozen.lock().unwrap() = false;
            true
        }
        fn is_frozen(&self) -> bool {
            *self.frozen.lock().unwrap()
        }
    }

    #[test]
    fn monitor_ids_never_repeat() {
        let debugger = DebuggerIntegration::new();
        let a = debugger.register_cpu("a", Arc::new(FakeCpu::new()), Arc::new(FakePausable { frozen: Mutex::new(false) }));
        let b = debugger.register_cpu("b", Arc::new(FakeCpu::new()), Arc::new(FakePausable { frozen: Mutex::new(false) }));
        assert_ne!(a, b);
        debugger.unregister_cpu(a);
        let c = debugger.register_cpu("c", Arc::new(FakeCpu::new()), Arc::new(FakePausable { frozen: Mutex::new(false) }));
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn unregister_guards_against_negative_one() {
        let debugger = DebuggerIntegration::new();
        debugger.unregister_cpu(-1);
        debugger.pause(-1);
        debugger.unpause(-1);
    }

    #[test]
    fn pause_unpause_delegate_to_pausable() {
        let debugger = DebuggerIntegration::new();
        let id = debugger.register_cpu("x", Arc::new(FakeCpu::new()), Arc::new(FakePausable { frozen: Mutex::new(false) }));
        assert_eq!(debugger.is_frozen(id), Some(false));
        assert!(debugger.pause(id));
        assert_eq!(debugger.is_frozen(id), Some(true));
        assert!(debugger.unpause(id));
        assert_eq!(debugger.is_frozen(id), Some(false));
    }

    #[test]
    fn unregister_is_idempotent() {
        let debugger = DebuggerIntegration::new();
        let id = debugger.register_cpu("x", Arc::new(FakeCpu::new()), Arc::new(FakePausable { frozen: Mutex::new(false) }));
        debugger.unregister_cpu(id);
        debugger.unregister_cpu(id);
    }

    #[test]
    fn trap_mode_emits_one_hit_and_stops_running() {
        let debugger = DebuggerIntegration::new();
        let cpu = Arc::new(FakeCpu::new());
        cpu.set_breakpoint(3);
        let id = debugger.register_cpu("x", cpu.clone(), Arc::new(FakePausable { frozen: Mutex::new(false) }));

        let (tx, rx) = mpsc::channel();
        debugger.start_trap_mode(id, tx, 42);

        let hit = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(hit.cpu_id, 42);
        assert_eq!(hit.address, 3);

        // Give the trap thread a moment to clear `running` after the send.
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cpu.is_running());
    }

    #[test]
    fn stop_trap_mode_joins_and_clears_running() {
        let debugger = DebuggerIntegration::new();
        let cpu = Arc::new(FakeCpu::new());
        let id = debugger.register_cpu("x", cpu.clone(), Arc::new(FakePausable { frozen: Mutex::new(false) }));

        let (tx, _rx) = mpsc::channel();
        debugger.start_trap_mode(id, tx, 1);
        debugger.stop_trap_mode(id);
        assert!(!cpu.is_running());
    }
}
