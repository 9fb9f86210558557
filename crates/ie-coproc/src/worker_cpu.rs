//! [`WorkerCPU`]: the only surface the coprocessor core depends on from an
//! emulated CPU. Instruction-level semantics are out of scope — this trait
//! exists so the manager can start, pause, resume, stop, and single-step
//! *any* guest CPU without knowing which architecture it is.

/// One exported CPU register, as reported by `get_registers()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterValue {
    pub name: &'static str,
    pub group: &'static str,
    pub width: u8,
    pub value: u64,
}

/// One disassembled instruction, as reported by `disassemble()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassembledInstruction {
    pub address: u32,
    pub size: u8,
    pub mnemonic: String,
}

/// A one-shot notification sent when a running CPU hits a breakpoint in trap
/// mode (see [`crate::debugger`] in the `ie-debug` crate, which is the sole
/// consumer of this channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointHit {
    pub cpu_id: u32,
    pub address: u32,
}

/// Lifecycle interface exported by every emulated CPU, regardless of guest
/// architecture. `execute()` is the only method expected to block; every
/// other method is expected to return promptly (sub-millisecond) so it can
/// be called from the manager's locked region or the debugger.
pub trait WorkerCPU: Send + Sync {
    /// Resets architectural state (but not breakpoints) to power-on values.
    fn reset(&self);

    /// Sets the program counter / dispatch cursor.
    fn set_pc(&self, addr: u32);

    /// Starts or stops the run flag observed by `execute()`.
    fn set_running(&self, running: bool);

    fn is_running(&self) -> bool;

    /// True once the guest has halted itself (e.g. executed a HLT-like
    /// instruction), independent of `is_running`.
    fn is_halted(&self) -> bool;

    /// Runs until `set_running(false)` is observed or the guest halts.
    /// Intended to be called on a dedicated thread; must never be called
    /// from `step()`'s caller concurrently with `step()` itself.
    fn execute(&self);

    /// Executes exactly one unit of work synchronously and returns a cycle
    /// count. Used only by the debugger's trap loop, never from `execute()`.
    fn step(&self) -> u64;

    fn set_breakpoint(&self, addr: u32);
    fn clear_breakpoint(&self, addr: u32);
    fn clear_all_breakpoints(&self);
    fn has_breakpoint(&self, addr: u32) -> bool;
    fn list_breakpoints(&self) -> Vec<u32>;

    /// Installs a one-shot sink used by the debugger's breakpoint trap loop.
    /// `cpu_id` is echoed back in the [`BreakpointHit`] so a sink shared
    /// across CPUs can tell them apart.
    fn set_breakpoint_channel(&self, sink: std::sync::mpsc::Sender<BreakpointHit>, cpu_id: u32);

    fn get_registers(&self) -> Vec<RegisterValue>;
    fn get_register(&self, name: &str) -> Option<u64>;
    fn set_register(&self, name: &str, value: u64) -> bool;

    fn read_memory(&self, addr: u32, len: usize) -> Vec<u8>;
    fn write_memory(&self, addr: u32, bytes: &[u8]);

    fn disassemble(&self, addr: u32, count: usize) -> Vec<DisassembledInstruction>;
}
