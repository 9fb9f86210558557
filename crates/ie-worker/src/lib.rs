//! `LoopCpu`: the reference `WorkerCPU`. It is not an instruction-set
//! interpreter — it never decodes a guest ISA — but a genuine service loop
//! that dequeues requests off its assigned ring, computes one of a small
//! fixed set of operations, and publishes the response, exactly the way a
//! real worker CPU would from the manager's point of view.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Mutex};
use std::time::Duration;

use ie_bus::{CpuKind, PhysicalBus};
use ie_coproc::ring::RingMailbox;
use ie_coproc::wire::{ResponseDescriptor, TicketStatus};
use ie_coproc::worker_cpu::{BreakpointHit, DisassembledInstruction, RegisterValue, WorkerCPU};

const IDLE_SLEEP: Duration = Duration::from_micros(200);

/// `OP` table. Anything outside this set yields `result_code=1`,
/// `resp_len=0`, and a terminal `Error` status.
mod op {
    pub const ECHO: u32 = 0;
    pub const SUM32: u32 = 1;
    pub const REVERSE: u32 = 2;
}

struct BreakpointSink {
    sender: mpsc::Sender<BreakpointHit>,
    cpu_id: u32,
}

pub struct LoopCpu {
    bus: std::sync::Arc<PhysicalBus>,
    kind: CpuKind,
    load_base: u32,
    running: AtomicBool,
    processed_count: AtomicU64,
    last_ticket: AtomicU32,
    breakpoints: Mutex<Vec<u32>>,
    sink: Mutex<Option<BreakpointSink>>,
}

impl LoopCpu {
    pub fn new(kind: CpuKind, bus: std::sync::Arc<PhysicalBus>, region: (u32, u32)) -> Self {
        LoopCpu {
            bus,
            kind,
            load_base: region.0,
            running: AtomicBool::new(false),
            processed_count: AtomicU64::new(0),
            last_ticket: AtomicU32::new(0),
            breakpoints: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
        }
    }

    /// The worker's conceptual program counter: its load base offset by how
    /// many tickets it has processed so far. There is no real instruction
    /// stream to advance through, so this is the closest analogue a debugger
    /// can meaningfully single-step and set breakpoints against.
    fn pc(&self) -> u32 {
        self.load_base
            .wrapping_add(self.processed_count.load(Ordering::Relaxed) as u32)
    }

    fn compute(op_code: u32, payload: &[u8]) -> (u32, Vec<u8>, TicketStatus) {
        match op_code {
            op::ECHO => (0, payload.to_vec(), TicketStatus::Ok),
            op::SUM32 => {
                let sum: u32 = payload
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                    .fold(0u32, |acc, v| acc.wrapping_add(v));
                (0, sum.to_le_bytes().to_vec(), TicketStatus::Ok)
            }
            op::REVERSE => {
                let mut out = payload.to_vec();
                out.reverse();
                (0, out, TicketStatus::Ok)
            }
            _ => (1, Vec::new(), TicketStatus::Error),
        }
    }

    /// Dequeues and answers exactly one pending request, if any. Returns
    /// `true` if a request was processed, `false` if the ring was empty.
    fn process_one(&self) -> bool {
        let ring = RingMailbox::for_kind(self.kind);
        let Some((slot, req)) = ring.pop_request(&self.bus) else {
            return false;
        };

        let payload = self.bus.read_bytes(req.req_ptr, req.req_len as usize);
        let (result_code, resp_bytes, status) = Self::compute(req.op, &payload);
        let resp_len = resp_bytes.len().min(req.resp_cap as usize);
        self.bus.write_bytes(req.resp_ptr, &resp_bytes[..resp_len]);

        ring.complete_request(
            &self.bus,
            slot,
            ResponseDescriptor {
                ticket: req.ticket,
                status: status.code(),
                result_code,
                resp_len: resp_len as u32,
            },
        );

        self.last_ticket.store(req.ticket, Ordering::Relaxed);
        self.processed_count.fetch_add(1, Ordering::Relaxed);

        let pc = self.pc();
        if self.breakpoints.lock().unwrap().contains(&pc) {
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                let _ = sink.sender.send(BreakpointHit {
                    cpu_id: sink.cpu_id,
                    address: pc,
                });
            }
        }

        true
    }
}

impl WorkerCPU for LoopCpu {
    fn reset(&self) {
        self.processed_count.store(0, Ordering::Relaxed);
        self.last_ticket.store(0, Ordering::Relaxed);
    }

    fn set_pc(&self, _addr: u32) {
        // `pc` is derived from `load_base` + `processed_count`; the load
        // base itself is fixed at construction, so there is nothing further
        // to set here beyond the reset `execute()`/`step()` already do.
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
        tracing::debug!(kind = self.kind.label(), "worker service loop started");
        while self.is_running() {
            if !self.process_one() {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        tracing::debug!(kind = self.kind.label(), "worker service loop stopped");
    }

    fn step(&self) -> u64 {
        if self.process_one() {
            1
        } else {
            0
        }
    }

    fn set_breakpoint(&self, addr: u32) {
        let mut bps = self.breakpoints.lock().unwrap();
        if !bps.contains(&addr) {
            bps.push(addr);
        }
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

    fn set_breakpoint_channel(&self, sink: mpsc::Sender<BreakpointHit>, cpu_id: u32) {
        *self.sink.lock().unwrap() = Some(BreakpointSink { sender: sink, cpu_id });
    }

    fn get_registers(&self) -> Vec<RegisterValue> {
        vec![
            RegisterValue { name: "pc", group: "core", width: 32, value: self.pc() as u64 },
            RegisterValue {
                name: "last_ticket",
                group: "core",
                width: 32,
                value: self.last_ticket.load(Ordering::Relaxed) as u64,
            },
            RegisterValue {
                name: "processed_count",
                group: "core",
                width: 64,
                value: self.processed_count.load(Ordering::Relaxed),
            },
        ]
    }

    fn get_register(&self, name: &str) -> Option<u64> {
        match name {
            "pc" => Some(self.pc() as u64),
            "last_ticket" => Some(self.last_ticket.load(Ordering::Relaxed) as u64),
            "processed_count" => Some(self.processed_count.load(Ordering::Relaxed)),
            _ => None,
        }
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

    fn disassemble(&self, _addr: u32, _count: usize) -> Vec<DisassembledInstruction> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ie_bus::constants::DEFAULT_BUS_SIZE;
    use ie_coproc::wire::RequestDescriptor;
    use std::sync::Arc;

    fn push(bus: &PhysicalBus, kind: CpuKind, ticket: u32, op_code: u32, req_ptr: u32, req_len: u32, resp_ptr: u32) {
        let ring = RingMailbox::for_kind(kind);
        ring.push_request(
            bus,
            RequestDescriptor {
                ticket,
                cpu_type: kind.code(),
                op: op_code,
                flags: 0,
                req_ptr,
                req_len,
                resp_ptr,
                resp_cap: 64,
            },
        )
        .unwrap();
    }

    #[test]
    fn echo_copies_payload_verbatim() {
        let bus = Arc::new(PhysicalBus::new(DEFAULT_BUS_SIZE));
        bus.write_bytes(0x410000, b"hello");
        push(&bus, CpuKind::Ie32, 1, op::ECHO, 0x410000, 5, 0x410100);

        let cpu = LoopCpu::new(CpuKind::Ie32, bus.clone(), CpuKind::Ie32.region());
        assert_eq!(cpu.step(), 1);

        let ring = RingMailbox::for_kind(CpuKind::Ie32);
        let resp = ring.find_response(&bus, 1).unwrap();
        assert_eq!(resp.status, TicketStatus::Ok.code());
        assert_eq!(resp.resp_len, 5);
        assert_eq!(bus.read_bytes(0x410100, 5), b"hello");
    }

    #[test]
    fn sum32_adds_little_endian_words() {
        let bus = Arc::new(PhysicalBus::new(DEFAULT_BUS_SIZE));
        bus.write32(0x410000, 2);
        bus.write32(0x410004, 40);
        push(&bus, CpuKind::Ie32, 2, op::SUM32, 0x410000, 8, 0x410100);

        let cpu = LoopCpu::new(CpuKind::Ie32, bus.clone(), CpuKind::Ie32.region());
        cpu.step();
        assert_eq!(bus.read32(0x410100), 42);
    }

    #[test]
    fn reverse_flips_the_payload() {
        let bus = Arc::new(PhysicalBus::new(DEFAULT_BUS_SIZE));
        bus.write_bytes(0x410000, b"abcd");
        push(&bus, CpuKind::Z80, 3, op::REVERSE, 0x410000, 4, 0x410100);

        let cpu = LoopCpu::new(CpuKind::Z80, bus.clone(), CpuKind::Z80.region());
        cpu.step();
        assert_eq!(bus.read_bytes(0x410100, 4), b"dcba");
    }

    #[test]
    fn unknown_op_reports_error_status() {
        let bus = Arc::new(PhysicalBus::new(DEFAULT_BUS_SIZE));
        push(&bus, CpuKind::X86, 4, 99, 0x410000, 0, 0x410100);

        let cpu = LoopCpu::new(CpuKind::X86, bus.clone(), CpuKind::X86.region());
        cpu.step();

        let ring = RingMailbox::for_kind(CpuKind::X86);
        let resp = ring.find_response(&bus, 4).unwrap();
        assert_eq!(resp.status, TicketStatus::Error.code());
        assert_eq!(resp.result_code, 1);
        assert_eq!(resp.resp_len, 0);
    }

    #[test]
    fn step_on_empty_ring_is_a_no_op() {
        let bus = Arc::new(PhysicalBus::new(DEFAULT_BUS_SIZE));
        let cpu = LoopCpu::new(CpuKind::Mos6502, bus, CpuKind::Mos6502.region());
        assert_eq!(cpu.step(), 0);
        assert_eq!(cpu.get_register("processed_count"), Some(0));
    }

    #[test]
    fn breakpoint_fires_on_matching_processed_count() {
        let bus = Arc::new(PhysicalBus::new(DEFAULT_BUS_SIZE));
        let cpu = LoopCpu::new(CpuKind::M68k, bus.clone(), CpuKind::M68k.region());
        let target_pc = cpu.pc().wrapping_add(1);
        cpu.set_breakpoint(target_pc);

        let (tx, rx) = mpsc::channel();
        cpu.set_breakpoint_channel(tx, 7);

        push(&bus, CpuKind::M68k, 5, op::ECHO, 0x410000, 0, 0x410100);
        cpu.step();

        let hit = rx.try_recv().unwrap();
        assert_eq!(hit.cpu_id, 7);
        assert_eq!(hit.address, target_pc);
    }

    #[test]
    fn registers_report_pc_ticket_and_count() {
        let bus = Arc::new(PhysicalBus::new(DEFAULT_BUS_SIZE));
        push(&bus, CpuKind::Ie32, 9, op::ECHO, 0x410000, 0, 0x410100);
        let cpu = LoopCpu::new(CpuKind::Ie32, bus, CpuKind::Ie32.region());
        cpu.step();

        let regs = cpu.get_registers();
        assert!(regs.iter().any(|r| r.name == "last_ticket" && r.value == 9));
        assert!(regs.iter().any(|r| r.name == "processed_count" && r.value == 1));
    }
}
