//! Flat shared physical memory, per-page I/O dispatch, and the per-
//! architecture bus adapters that translate each guest CPU's native address
//! space onto it.

pub mod adapters;
pub mod bus;
pub mod constants;
pub mod cpu_kind;

pub use adapters::{adapter_for, BusAdapter};
pub use bus::{IoHandler, MapIoError, PhysicalBus};
pub use cpu_kind::{CpuKind, CpuKindError, WordWidth, ALL_KINDS};
