//! The coprocessor control plane: shadow register file, ring mailbox,
//! completion tracker, path sanitization, and the manager that ties them
//! together and exposes them on the bus as one `IoHandler`.

pub mod completion;
pub mod manager;
pub mod regfile;
pub mod ring;
pub mod sanitize;
pub mod wire;
pub mod worker_cpu;

pub use completion::{CompletionTracker, PollError, PollResult};
pub use manager::{CoprocessorManager, DebuggerHandle, Pausable, WorkerFactory, WorkerSnapshot};
pub use regfile::MMIORegisterFile;
pub use ring::{RingError, RingMailbox};
pub use sanitize::PathError;
pub use worker_cpu::{BreakpointHit, DisassembledInstruction, RegisterValue, WorkerCPU};
