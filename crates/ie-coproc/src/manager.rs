//! `CoprocessorManager`: the command plane. Owns the shadow register file,
//! the worker table, and the completion tracker behind one coarse-grained
//! mutex, and is registered on the [`PhysicalBus`] as the I/O handler for the
//! coprocessor MMIO range.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ie_bus::constants::COPROC_BASE;
use ie_bus::{CpuKind, IoHandler, PhysicalBus};

use crate::completion::{CompletionTracker, PollError};
use crate::regfile::MMIORegisterFile;
use crate::ring::RingMailbox;
use crate::sanitize;
use crate::wire::{reg, CmdError, CmdStatus, Command, RequestDescriptor, TicketStatus};
use crate::worker_cpu::WorkerCPU;

const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const WAIT_POLL_INTERVAL: Duration = Duration::from_micros(100);
const DEFAULT_WAIT_TIMEOUT_MS: u32 = 1000;
const MAX_NAME_LEN: usize = 255;

/// What the manager tells the outside world about a worker it wants tracked
/// for debugging (freeze/resume, breakpoints). Kept as a trait here — rather
/// than a dependency on `ie-debug` — so `ie-coproc` never depends on the
/// crate that depends on it; `ie-debug::DebuggerIntegration` implements it.
pub trait DebuggerHandle: Send + Sync {
    fn register_cpu(&self, label: &'static str, cpu: Arc<dyn WorkerCPU>, control: Arc<dyn Pausable>) -> i64;
    fn unregister_cpu(&self, monitor_id: i64);
}

/// The freeze/resume surface a registered worker exposes to its debugger
/// registration. `ie-debug`'s pause/unpause calls land here.
pub trait Pausable: Send + Sync {
    /// Stops the worker's execute loop and waits up to the manager's stop
    /// timeout for it to drain. Returns `false` (leaving the worker running,
    /// `suspected_stuck` set) if the loop did not drain in time.
    fn pause(&self) -> bool;
    /// Restarts the worker's execute loop on a fresh thread.
    fn unpause(&self) -> bool;
    fn is_frozen(&self) -> bool;
}

/// Builds the concrete `WorkerCPU` for a freshly-started worker. Injected at
/// construction rather than depended on directly, since the reference
/// implementation (`ie_worker::LoopCpu`) lives in a crate that depends on
/// this one's `WorkerCPU` trait.
pub type WorkerFactory =
    Arc<dyn Fn(CpuKind, Arc<PhysicalBus>, (u32, u32)) -> Arc<dyn WorkerCPU> + Send + Sync>;

struct WorkerControl {
    done_rx: Mutex<Option<mpsc::Receiver<()>>>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
    frozen: Mutex<bool>,
    suspected_stuck: AtomicBool,
}

struct WorkerPause {
    cpu: Arc<dyn WorkerCPU>,
    control: Arc<WorkerControl>,
}

impl Pausable for WorkerPause {
    fn pause(&self) -> bool {
        let mut frozen = self.control.frozen.lock().unwrap();
        if *frozen {
            return true;
        }
        self.cpu.set_running(false);
        let done = self.control.done_rx.lock().unwrap().take();
        let drained = match done {
            Some(rx) => rx.recv_timeout(WORKER_STOP_TIMEOUT).is_ok(),
            None => true,
        };
        if !drained {
            self.control.suspected_stuck.store(true, Ordering::Relaxed);
            return false;
        }
        if let Some(handle) = self.control.join.lock().unwrap().take() {
            let _ = handle.join();
        }
        *frozen = true;
        self.control.suspected_stuck.store(false, Ordering::Relaxed);
        true
    }

    fn unpause(&self) -> bool {
        let mut frozen = self.control.frozen.lock().unwrap();
        if !*frozen {
            return true;
        }
        self.cpu.set_running(true);
        let (done_tx, done_rx) = mpsc::channel();
        *self.control.done_rx.lock().unwrap() = Some(done_rx);
        let cpu = self.cpu.clone();
        let handle = thread::spawn(move || {
            cpu.execute();
            let _ = done_tx.send(());
        });
        *self.control.join.lock().unwrap() = Some(handle);
        *frozen = false;
        self.control.suspected_stuck.store(false, Ordering::Relaxed);
        true
    }

    fn is_frozen(&self) -> bool {
        *self.control.frozen.lock().unwrap()
    }
}

struct Worker {
    cpu_type: CpuKind,
    cpu: Arc<dyn WorkerCPU>,
    control: Arc<WorkerControl>,
    pausable: Arc<dyn Pausable>,
    monitor_id: i64,
}

/// A snapshot of one active worker, for debugger and status-surface
/// listings.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub cpu_type: CpuKind,
    pub label: &'static str,
    pub frozen: bool,
    pub suspected_stuck: bool,
}

struct Inner {
    regs: MMIORegisterFile,
    workers: [Option<Worker>; 6],
    completions: CompletionTracker,
}

impl Inner {
    fn refresh_worker_state(&mut self) {
        let mut mask = 0u32;
        for (i, w) in self.workers.iter().enumerate() {
            if w.is_some() {
                mask |= 1 << i;
            }
        }
        self.regs.set(reg::WORKER_STATE, mask);
    }

    fn finish(&mut self, status: CmdStatus, error: CmdError) {
        self.regs.set(reg::CMD_STATUS, status as u32);
        self.regs.set(reg::CMD_ERROR, error.code());
        self.refresh_worker_state();
    }

    fn worker_present(&self, kind: CpuKind) -> bool {
        self.workers[kind.slot()].is_some()
    }

    fn presence_table(&self) -> [bool; 6] {
        let mut out = [false; 6];
        for (i, w) in self.workers.iter().enumerate() {
            out[i] = w.is_some();
        }
        out
    }
}

/// The coprocessor control plane. Constructed once per [`Machine`] (in
/// `ie-machine`) and registered on the bus as the handler for the COPROC
/// range.
pub struct CoprocessorManager {
    inner: Mutex<Inner>,
    bus: Arc<PhysicalBus>,
    base_dir: PathBuf,
    debugger: Option<Arc<dyn DebuggerHandle>>,
    factory: WorkerFactory,
}

impl CoprocessorManager {
    pub fn new(
        bus: Arc<PhysicalBus>,
        base_dir: PathBuf,
        debugger: Option<Arc<dyn DebuggerHandle>>,
        factory: WorkerFactory,
    ) -> Self {
        CoprocessorManager {
            inner: Mutex::new(Inner {
                regs: MMIORegisterFile::new(),
                workers: Default::default(),
                completions: CompletionTracker::new(),
            }),
            bus,
            base_dir,
            debugger,
            factory,
        }
    }

    /// Wraps `self` for registration on the bus. `PhysicalBus::map_io` needs
    /// an owned `Box<dyn IoHandler>`; `CoprocessorManager` exposes its MMIO
    /// behavior through inherent `read8`/`write8` instead of implementing
    /// `IoHandler` directly, since `Arc<CoprocessorManager>` can't implement
    /// a foreign trait (`Arc` isn't `#[fundamental]`).
    pub fn io_handler(self: &Arc<Self>) -> Box<dyn IoHandler> {
        Box::new(ManagerIo(self.clone()))
    }

    fn read8(&self, addr: u32) -> u8 {
        let local = addr - COPROC_BASE;
        let inner = self.inner.lock().unwrap();
        inner.regs.read_byte(local)
    }

    fn write8(&self, addr: u32, val: u8) {
        let local = addr - COPROC_BASE;
        let dispatch = {
            let mut inner = self.inner.lock().unwrap();
            inner.regs.write_byte(local, val)
        };
        if dispatch {
            self.dispatch_command(val);
        }
    }

    fn dispatch_command(&self, cmd_byte: u8) {
        match Command::try_from(cmd_byte) {
            Ok(Command::Start) => self.cmd_start(),
            Ok(Command::Stop) => self.cmd_stop(),
            Ok(Command::Enqueue) => self.cmd_enqueue(),
            Ok(Command::Poll) => self.cmd_poll(),
            Ok(Command::Wait) => self.cmd_wait(),
            Err(()) => {
                let mut inner = self.inner.lock().unwrap();
                inner.finish(CmdStatus::Error, CmdError::None);
            }
        }
    }

    fn cmd_start(&self) {
        let (cpu_type_raw, name_ptr) = {
            let inner = self.inner.lock().unwrap();
            (inner.regs.get(reg::CPU_TYPE), inner.regs.get(reg::NAME_PTR))
        };

        let kind = match CpuKind::try_from(cpu_type_raw) {
            Ok(k) => k,
            Err(_) => return self.finish(CmdStatus::Error, CmdError::InvalidCpu),
        };

        let name_bytes = self.bus.read_cstr(name_ptr, MAX_NAME_LEN);
        let name = match std::str::from_utf8(&name_bytes) {
            Ok(s) => s,
            Err(_) => return self.finish(CmdStatus::Error, CmdError::PathInvalid),
        };

        let resolved = match sanitize::sanitize(&self.base_dir, name) {
            Ok(p) => p,
            Err(err) => {
                tracing::debug!(%name, %err, "START rejected an unsanitary path");
                return self.finish(CmdStatus::Error, CmdError::PathInvalid);
            }
        };

        let bytes = match fs::read(&resolved) {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(path = %resolved.display(), %err, "service binary read failed");
                return self.finish(CmdStatus::Error, CmdError::NotFound);
            }
        };

        let region = kind.region();
        let region_len = (region.1 - region.0) as usize + 1;
        if bytes.len() > region_len {
            tracing::warn!(kind = kind.label(), len = bytes.len(), region_len, "service binary too large for its region");
            return self.finish(CmdStatus::Error, CmdError::LoadFailed);
        }

        let previous = {
            let mut inner = self.inner.lock().unwrap();
            inner.workers[kind.slot()].take()
        };
        if let Some(old) = previous {
            self.stop_and_unregister(old);
        }

        self.bus.load(region.0, &bytes);

        let cpu = (self.factory)(kind, self.bus.clone(), region);
        cpu.reset();
        cpu.set_pc(region.0);
        cpu.set_running(true);

        let (done_tx, done_rx) = mpsc::channel();
        let control = Arc::new(WorkerControl {
            done_rx: Mutex::new(Some(done_rx)),
            join: Mutex::new(None),
            frozen: Mutex::new(false),
            suspected_stuck: AtomicBool::new(false),
        });

        let thread_cpu = cpu.clone();
        let join = thread::spawn(move || {
            thread_cpu.execute();
            let _ = done_tx.send(());
        });
        *control.join.lock().unwrap() = Some(join);

        let pausable: Arc<dyn Pausable> = Arc::new(WorkerPause {
            cpu: cpu.clone(),
            control: control.clone(),
        });
        let monitor_id = self
            .debugger
            .as_ref()
            .map(|d| d.register_cpu(kind.label(), cpu.clone(), pausable.clone()))
            .unwrap_or(-1);

        tracing::info!(kind = kind.label(), path = %resolved.display(), "worker started");

        let mut inner = self.inner.lock().unwrap();
        inner.workers[kind.slot()] = Some(Worker {
            cpu_type: kind,
            cpu,
            control,
            pausable,
            monitor_id,
        });
        inner.finish(CmdStatus::Ok, CmdError::None);
    }

    fn cmd_stop(&self) {
        let cpu_type_raw = self.inner.lock().unwrap().regs.get(reg::CPU_TYPE);
        let kind = match CpuKind::try_from(cpu_type_raw) {
            Ok(k) => k,
            Err(_) => return self.finish(CmdStatus::Error, CmdError::InvalidCpu),
        };

        let worker = {
            let mut inner = self.inner.lock().unwrap();
            inner.workers[kind.slot()].take()
        };

        let Some(worker) = worker else {
            return self.finish(CmdStatus::Error, CmdError::NoWorker);
        };

        self.stop_and_unregister(worker);
        tracing::info!(kind = kind.label(), "worker stopped");
        self.finish(CmdStatus::Ok, CmdError::None);
    }

    fn cmd_enqueue(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.completions.sweep_ttl();
        inner.completions.sweep_cap();

        let cpu_type_raw = inner.regs.get(reg::CPU_TYPE);
        let kind = match CpuKind::try_from(cpu_type_raw) {
            Ok(k) => k,
            Err(_) => {
                inner.regs.set(reg::TICKET, 0);
                return inner.finish(CmdStatus::Error, CmdError::InvalidCpu);
            }
        };

        if !inner.worker_present(kind) {
            inner.regs.set(reg::TICKET, 0);
            return inner.finish(CmdStatus::Error, CmdError::NoWorker);
        }

        let ring = RingMailbox::for_kind(kind);
        if ring.is_full(&self.bus) {
            inner.regs.set(reg::TICKET, 0);
            return inner.finish(CmdStatus::Error, CmdError::QueueFull);
        }

        let ticket = inner.completions.allocate(kind);
        let req = RequestDescriptor {
            ticket,
            cpu_type: kind.code(),
            op: inner.regs.get(reg::OP),
            flags: 0,
            req_ptr: inner.regs.get(reg::REQ_PTR),
            req_len: inner.regs.get(reg::REQ_LEN),
            resp_ptr: inner.regs.get(reg::RESP_PTR),
            resp_cap: inner.regs.get(reg::RESP_CAP),
        };

        match ring.push_request(&self.bus, req) {
            Ok(_) => {
                inner.regs.set(reg::TICKET, ticket);
                inner.finish(CmdStatus::Ok, CmdError::None);
            }
            Err(_) => {
                // Lost the race against the worker between our is_full()
                // check and this push — treat identically to a pre-observed
                // full ring. The ticket we tentatively allocated is simply
                // never referenced again; it will be TTL-swept.
                inner.regs.set(reg::TICKET, 0);
                inner.finish(CmdStatus::Error, CmdError::QueueFull);
            }
        }
    }

    fn cmd_poll(&self) {
        let mut inner = self.inner.lock().unwrap();
        let ticket = inner.regs.get(reg::TICKET);

        self.refresh_from_ring_if_pending(&mut inner, ticket);

        let present = inner.presence_table();
        let result = inner
            .completions
            .poll(ticket, |kind| present[kind.slot()]);

        match result {
            Ok(r) => {
                inner.regs.set(reg::TICKET_STATUS, r.status.code());
                inner.finish(CmdStatus::Ok, CmdError::None);
            }
            Err(PollError::StaleTicket) => {
                inner.regs.set(reg::TICKET_STATUS, TicketStatus::Error.code());
                inner.finish(CmdStatus::Error, CmdError::StaleTicket);
            }
        }
    }

    fn cmd_wait(&self) {
        let (ticket, timeout_raw, kind) = {
            let inner = self.inner.lock().unwrap();
            let ticket = inner.regs.get(reg::TICKET);
            let timeout = inner.regs.get(reg::TIMEOUT);
            let kind = inner.completions.cpu_type_of(ticket);
            (ticket, timeout, kind)
        };

        let Some(kind) = kind else {
            let mut inner = self.inner.lock().unwrap();
            inner.regs.set(reg::TICKET_STATUS, TicketStatus::Error.code());
            return inner.finish(CmdStatus::Error, CmdError::StaleTicket);
        };

        let timeout_ms = if timeout_raw == 0 { DEFAULT_WAIT_TIMEOUT_MS } else { timeout_raw };
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);

        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                self.refresh_from_ring_if_pending(&mut inner, ticket);

                let present = inner.presence_table();
                match inner.completions.poll(ticket, |k| present[k.slot()]) {
                    Ok(r) if r.status.is_terminal() => {
                        inner.regs.set(reg::TICKET_STATUS, r.status.code());
                        inner.finish(CmdStatus::Ok, CmdError::None);
                        return;
                    }
                    Ok(_) => {}
                    Err(PollError::StaleTicket) => {
                        inner.regs.set(reg::TICKET_STATUS, TicketStatus::Error.code());
                        inner.finish(CmdStatus::Error, CmdError::StaleTicket);
                        return;
                    }
                }
            }

            if Instant::now() >= deadline {
                let mut inner = self.inner.lock().unwrap();
                inner.completions.complete(ticket, TicketStatus::Timeout, 0, 0);
                let present = inner.presence_table();
                let _ = inner.completions.poll(ticket, |k| present[k.slot()]);
                inner.regs.set(reg::TICKET_STATUS, TicketStatus::Timeout.code());
                inner.finish(CmdStatus::Ok, CmdError::None);
                return;
            }

            let _ = kind; // region reserved for a future per-kind backoff tune
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// If `ticket` isn't already cached with a terminal status, scans its
    /// ring for one and folds it into the completion cache. Pure
    /// bookkeeping shared by `POLL` and `WAIT`'s loop.
    fn refresh_from_ring_if_pending(&self, inner: &mut Inner, ticket: u32) {
        let Some(kind) = inner.completions.cpu_type_of(ticket) else {
            return;
        };
        if inner.completions.is_cached_terminal(ticket) {
            return;
        }
        let ring = RingMailbox::for_kind(kind);
        if let Some(resp) = ring.find_response(&self.bus, ticket) {
            if let Ok(status) = TicketStatus::try_from(resp.status) {
                if status.is_terminal() {
                    inner
                        .completions
                        .complete(ticket, status, resp.result_code, resp.resp_len);
                }
            }
        }
    }

    fn stop_and_unregister(&self, worker: Worker) {
        worker.cpu.set_running(false);
        if let Some(rx) = worker.control.done_rx.lock().unwrap().take() {
            let _ = rx.recv_timeout(WORKER_STOP_TIMEOUT);
        }
        if let Some(handle) = worker.control.join.lock().unwrap().take() {
            let _ = handle.join();
        }
        if worker.monitor_id >= 0 {
            if let Some(d) = &self.debugger {
                d.unregister_cpu(worker.monitor_id);
            }
        }
    }

    fn finish(&self, status: CmdStatus, error: CmdError) {
        let mut inner = self.inner.lock().unwrap();
        inner.finish(status, error);
    }

    /// Snapshot of every active worker, for the debugger listing and the
    /// optional status HTTP surface.
    pub fn get_active_workers(&self) -> Vec<WorkerSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .workers
            .iter()
            .flatten()
            .map(|w| WorkerSnapshot {
                cpu_type: w.cpu_type,
                label: w.cpu_type.label(),
                frozen: *w.control.frozen.lock().unwrap(),
                suspected_stuck: w.control.suspected_stuck.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Freezes the worker of `kind` directly (equivalent to what the
    /// debugger's `pause(monitor_id)` does, reachable without knowing the
    /// worker's monitor id). `false` if there is no such worker or the
    /// 2-second drain timeout elapsed.
    pub fn pause_worker(&self, kind: CpuKind) -> bool {
        let pausable = {
            let inner = self.inner.lock().unwrap();
            inner.workers[kind.slot()].as_ref().map(|w| w.pausable.clone())
        };
        pausable.map(|p| p.pause()).unwrap_or(false)
    }

    pub fn unpause_worker(&self, kind: CpuKind) -> bool {
        let pausable = {
            let inner = self.inner.lock().unwrap();
            inner.workers[kind.slot()].as_ref().map(|w| w.pausable.clone())
        };
        pausable.map(|p| p.unpause()).unwrap_or(false)
    }

    /// Shutdown path: stops every active worker (2-second per-worker
    /// timeout) and clears the table.
    pub fn stop_all(&self) {
        let workers: Vec<Worker> = {
            let mut inner = self.inner.lock().unwrap();
            inner.workers.iter_mut().filter_map(|slot| slot.take()).collect()
        };
        for w in workers {
            self.stop_and_unregister(w);
        }
        let mut inner = self.inner.lock().unwrap();
        inner.refresh_worker_state();
    }
}

/// Thin `IoHandler` adapter: `PhysicalBus::map_io` needs a `Box<dyn
/// IoHandler>`, and the orphan rules forbid implementing a foreign trait
/// directly for `Arc<CoprocessorManager>`.
struct ManagerIo(Arc<CoprocessorManager>);

impl IoHandler for ManagerIo {
    fn read8(&self, addr: u32) -> u8 {
        self.0.read8(addr)
    }
    fn write8(&self, addr: u32, val: u8) {
        self.0.write8(addr, val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ie_bus::constants::DEFAULT_BUS_SIZE;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    /// A minimal `WorkerCPU` for manager-level tests: spins on its ring
    /// until told to stop, echoing every request back with `result_code=0`.
    struct EchoCpu {
        bus: Arc<PhysicalBus>,
        region: (u32, u32),
        running: AtomicBool,
        processed: AtomicU64,
        pc: StdMutex<u32>,
    }

    impl EchoCpu {
        fn new(bus: Arc<PhysicalBus>, region: (u32, u32)) -> Self {
            EchoCpu {
                bus,
                region,
                running: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                pc: StdMutex::new(region.0),
            }
        }
    }

    impl WorkerCPU for EchoCpu {
        fn reset(&self) {
            self.processed.store(0, Ordering::Relaxed);
        }
        fn set_pc(&self, addr: u32) {
            *self.pc.lock().unwrap() = addr;
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
        fn execute(&self) {
            let kind = if self.region == CpuKind::Ie32.region() {
                CpuKind::Ie32
            } else {
                CpuKind::X86
            };
            let ring = RingMailbox::for_kind(kind);
            while self.is_running() {
                if let Some((slot, req)) = ring.pop_request(&self.bus) {
                    ring.complete_request(
                        &self.bus,
                        slot,
                        crate::wire::ResponseDescriptor {
                            ticket: req.ticket,
                            status: TicketStatus::Ok.code(),
                            result_code: 0,
                            resp_len: 0,
                        },
                    );
                    self.processed.fetch_add(1, Ordering::Relaxed);
                } else {
                    thread::sleep(Duration::from_micros(200));
                }
            }
        }
        fn step(&self) -> u64 {
            0
        }
        fn set_breakpoint(&self, _addr: u32) {}
        fn clear_breakpoint(&self, _addr: u32) {}
        fn clear_all_breakpoints(&self) {}
        fn has_breakpoint(&self, _addr: u32) -> bool {
            false
        }
        fn list_breakpoints(&self) -> Vec<u32> {
            Vec::new()
        }
        fn set_breakpoint_channel(&self, _sink: mpsc::Sender<crate::worker_cpu::BreakpointHit>, _cpu_id: u32) {}
        fn get_registers(&self) -> Vec<crate::worker_cpu::RegisterValue> {
            Vec::new()
        }
        fn get_register(&self, _name: &str) -> Option<u64> {
            None
        }
        fn set_register(&self, _name: &str, _value: u64) -> bool {
            false
        }
        fn read_memory(&self, addr: u32, len: usize) -> Vec<u8> {
            self.bus.read_bytes(addr, len)
        }
        fn write_memory(&self, addr: u32, bytes: &[u8]) {
            self.bus.write_bytes(addr, bytes);
        }
        fn disassemble(&self, _addr: u32, _count: usize) -> Vec<crate::worker_cpu::DisassembledInstruction> {
            Vec::new()
        }
    }

    fn echo_factory() -> WorkerFactory {
        Arc::new(|_kind, bus, region| Arc::new(EchoCpu::new(bus, region)) as Arc<dyn WorkerCPU>)
    }

    fn setup() -> (Arc<PhysicalBus>, Arc<CoprocessorManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("svc.bin"), b"\x00\x00\x00\x00").unwrap();
        let bus = Arc::new(PhysicalBus::new(DEFAULT_BUS_SIZE));
        let manager = Arc::new(CoprocessorManager::new(
            bus.clone(),
            dir.path().to_path_buf(),
            None,
            echo_factory(),
        ));
        bus.map_io(
            COPROC_BASE,
            COPROC_BASE + ie_bus::constants::COPROC_SIZE - 1,
            manager.io_handler(),
        )
        .unwrap();
        (bus, manager, dir)
    }

    fn start_ie32(bus: &PhysicalBus) {
        bus.write32(COPROC_BASE + reg::CPU_TYPE, CpuKind::Ie32.code());
        let name_addr = 0x500000;
        bus.write_bytes(name_addr, b"svc.bin\0");
        bus.write32(COPROC_BASE + reg::NAME_PTR, name_addr);
        bus.write32(COPROC_BASE + reg::CMD, Command::Start as u32);
    }

    #[test]
    fn start_then_enqueue_then_poll_reports_ok() {
        let (bus, _manager, _dir) = setup();
        start_ie32(&bus);
        assert_eq!(bus.read32(COPROC_BASE + reg::CMD_STATUS), CmdStatus::Ok as u32);

        bus.write32(COPROC_BASE + reg::OP, 0);
        bus.write32(COPROC_BASE + reg::REQ_PTR, 0x410000);
        bus.write32(COPROC_BASE + reg::REQ_LEN, 8);
        bus.write32(COPROC_BASE + reg::RESP_PTR, 0x410100);
        bus.write32(COPROC_BASE + reg::RESP_CAP, 16);
        bus.write32(COPROC_BASE + reg::CMD, Command::Enqueue as u32);
        assert_eq!(bus.read32(COPROC_BASE + reg::CMD_STATUS), CmdStatus::Ok as u32);
        let ticket = bus.read32(COPROC_BASE + reg::TICKET);
        assert_ne!(ticket, 0);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            bus.write32(COPROC_BASE + reg::CMD, Command::Poll as u32);
            let status = bus.read32(COPROC_BASE + reg::TICKET_STATUS);
            if status == TicketStatus::Ok.code() {
                break;
            }
            assert!(Instant::now() < deadline, "worker never completed the ticket");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn invalid_cpu_type_on_start_is_reported() {
        let (bus, _manager, _dir) = setup();
        bus.write32(COPROC_BASE + reg::CPU_TYPE, 0);
        bus.write32(COPROC_BASE + reg::CMD, Command::Start as u32);
        assert_eq!(bus.read32(COPROC_BASE + reg::CMD_STATUS), CmdStatus::Error as u32);
        assert_eq!(bus.read32(COPROC_BASE + reg::CMD_ERROR), CmdError::InvalidCpu.code());
    }

    #[test]
    fn enqueue_without_worker_resets_ticket_to_zero() {
        let (bus, _manager, _dir) = setup();
        bus.write32(COPROC_BASE + reg::CPU_TYPE, CpuKind::X86.code());
        bus.write32(COPROC_BASE + reg::CMD, Command::Enqueue as u32);
        assert_eq!(bus.read32(COPROC_BASE + reg::TICKET), 0);
        assert_eq!(bus.read32(COPROC_BASE + reg::CMD_ERROR), CmdError::NoWorker.code());
    }

    /// A `WorkerCPU` that never drains its ring, so its queue can be filled
    /// deterministically from outside the real dispatch thread.
    struct StalledCpu;
    impl WorkerCPU for StalledCpu {
        fn reset(&self) {}
        fn set_pc(&self, _addr: u32) {}
        fn set_running(&self, _running: bool) {}
        fn is_running(&self) -> bool {
            false
        }
        fn is_halted(&self) -> bool {
            false
        }
        fn execute(&self) {}
        fn step(&self) -> u64 {
            0
        }
        fn set_breakpoint(&self, _addr: u32) {}
        fn clear_breakpoint(&self, _addr: u32) {}
        fn clear_all_breakpoints(&self) {}
        fn has_breakpoint(&self, _addr: u32) -> bool {
            false
        }
        fn list_breakpoints(&self) -> Vec<u32> {
            Vec::new()
        }
        fn set_breakpoint_channel(&self, _sink: mpsc::Sender<crate::worker_cpu::BreakpointHit>, _cpu_id: u32) {}
        fn get_registers(&self) -> Vec<crate::worker_cpu::RegisterValue> {
            Vec::new()
        }
        fn get_register(&self, _name: &str) -> Option<u64> {
            None
        }
        fn set_register(&self, _name: &str, _value: u64) -> bool {
            false
        }
        fn read_memory(&self, _addr: u32, _len: usize) -> Vec<u8> {
            Vec::new()
        }
        fn write_memory(&self, _addr: u32, _bytes: &[u8]) {}
        fn disassemble(&self, _addr: u32, _count: usize) -> Vec<crate::worker_cpu::DisassembledInstruction> {
            Vec::new()
        }
    }

    #[test]
    fn queue_full_once_ring_is_saturated() {
        let (bus, manager, _dir) = setup();
        {
            let cpu: Arc<dyn WorkerCPU> = Arc::new(StalledCpu);
            let control = Arc::new(WorkerControl {
                done_rx: Mutex::new(None),
                join: Mutex::new(None),
                frozen: Mutex::new(false),
                suspected_stuck: AtomicBool::new(false),
            });
            let pausable: Arc<dyn Pausable> = Arc::new(WorkerPause {
                cpu: cpu.clone(),
                control: control.clone(),
            });
            let mut inner = manager.inner.lock().unwrap();
            inner.workers[CpuKind::Ie32.slot()] = Some(Worker {
                cpu_type: CpuKind::Ie32,
                cpu,
                control,
                pausable,
                monitor_id: -1,
            });
        }

        bus.write32(COPROC_BASE + reg::CPU_TYPE, CpuKind::Ie32.code());
        bus.write32(COPROC_BASE + reg::OP, 0);
        for _ in 0..(ie_bus::constants::RING_CAPACITY as u32 - 1) {
            bus.write32(COPROC_BASE + reg::CMD, Command::Enqueue as u32);
            assert_eq!(bus.read32(COPROC_BASE + reg::CMD_STATUS), CmdStatus::Ok as u32);
            assert_ne!(bus.read32(COPROC_BASE + reg::TICKET), 0);
        }

        bus.write32(COPROC_BASE + reg::CMD, Command::Enqueue as u32);
        assert_eq!(bus.read32(COPROC_BASE + reg::CMD_STATUS), CmdStatus::Error as u32);
        assert_eq!(bus.read32(COPROC_BASE + reg::CMD_ERROR), CmdError::QueueFull.code());
        assert_eq!(bus.read32(COPROC_BASE + reg::TICKET), 0);
    }

    #[test]
    fn path_escaping_base_dir_is_rejected() {
        let (bus, _manager, _dir) = setup();
        bus.write32(COPROC_BASE + reg::CPU_TYPE, CpuKind::Ie32.code());
        let name_addr = 0x500000;
        bus.write_bytes(name_addr, b"../../etc/passwd\0");
        bus.write32(COPROC_BASE + reg::NAME_PTR, name_addr);
        bus.write32(COPROC_BASE + reg::CMD, Command::Start as u32);
        assert_eq!(bus.read32(COPROC_BASE + reg::CMD_ERROR), CmdError::PathInvalid.code());
    }

    #[test]
    fn stop_without_worker_is_no_worker() {
        let (bus, _manager, _dir) = setup();
        bus.write32(COPROC_BASE + reg::CPU_TYPE, CpuKind::Z80.code());
        bus.write32(COPROC_BASE + reg::CMD, Command::Stop as u32);
        assert_eq!(bus.read32(COPROC_BASE + reg::CMD_ERROR), CmdError::NoWorker.code());
    }

    #[test]
    fn worker_down_reported_after_manual_removal() {
        let (bus, manager, _dir) = setup();
        start_ie32(&bus);
        bus.write32(COPROC_BASE + reg::OP, 0);
        bus.write32(COPROC_BASE + reg::REQ_PTR, 0x410000);
        bus.write32(COPROC_BASE + reg::REQ_LEN, 8);
        bus.write32(COPROC_BASE + reg::RESP_PTR, 0x410100);
        bus.write32(COPROC_BASE + reg::RESP_CAP, 16);
        bus.write32(COPROC_BASE + reg::CMD, Command::Enqueue as u32);
        // Rip the worker out from behind the manager's back.
        {
            let mut inner = manager.inner.lock().unwrap();
            inner.workers[CpuKind::Ie32.slot()] = None;
        }
        bus.write32(COPROC_BASE + reg::CMD, Command::Poll as u32);
        assert_eq!(bus.read32(COPROC_BASE + reg::TICKET_STATUS), TicketStatus::WorkerDown.code());
    }

    #[test]
    fn two_read_eviction_then_stale() {
        let (bus, manager, _dir) = setup();
        start_ie32(&bus);
        let ticket = {
            let mut inner = manager.inner.lock().unwrap();
            let t = inner.completions.allocate(CpuKind::Ie32);
            inner.completions.complete(t, TicketStatus::Ok, 0, 4);
            t
        };
        bus.write32(COPROC_BASE + reg::TICKET, ticket);

        bus.write32(COPROC_BASE + reg::CMD, Command::Poll as u32);
        assert_eq!(bus.read32(COPROC_BASE + reg::TICKET_STATUS), TicketStatus::Ok.code());

        bus.write32(COPROC_BASE + reg::CMD, Command::Poll as u32);
        assert_eq!(bus.read32(COPROC_BASE + reg::TICKET_STATUS), TicketStatus::Ok.code());

        bus.write32(COPROC_BASE + reg::CMD, Command::Poll as u32);
        assert_eq!(bus.read32(COPROC_BASE + reg::CMD_ERROR), CmdError::StaleTicket.code());
    }
}
