//! `MMIORegisterFile`: the shadow storage behind the 14 coprocessor
//! registers, plus the byte-granular read/write contract every guest
//! (regardless of native word width) programs it through.
//!
//! This module is pure data and bookkeeping — it has no idea what a command
//! *means*; [`crate::manager`] is the only thing that acts on the dispatch
//! signal `write_byte` returns.

use crate::wire::reg;

const REGISTER_COUNT: usize = reg::ALL.len();

/// Registers the guest cannot write to directly; the manager updates them
/// through [`MMIORegisterFile::set`] instead. A guest byte-write that lands
/// on one of these is accepted (to keep the RMW contract uniform) but
/// discarded.
const READ_ONLY: [u32; 4] = [reg::CMD_STATUS, reg::CMD_ERROR, reg::TICKET_STATUS, reg::WORKER_STATE];

fn index_of(offset: u32) -> Option<usize> {
    let idx = (offset / 4) as usize;
    if idx < REGISTER_COUNT {
        Some(idx)
    } else {
        None
    }
}

fn is_read_only(offset: u32) -> bool {
    READ_ONLY.contains(&offset)
}

#[derive(Debug, Default)]
pub struct MMIORegisterFile {
    values: [u32; REGISTER_COUNT],
}

impl MMIORegisterFile {
    pub fn new() -> Self {
        MMIORegisterFile::default()
    }

    /// Full-width read, by register offset (e.g. `reg::TICKET`).
    pub fn get(&self, offset: u32) -> u32 {
        index_of(offset).map(|i| self.values[i]).unwrap_or(0)
    }

    /// Full-width write, by register offset. Used internally by the manager
    /// to update read-only registers (`CMD_STATUS`, `CMD_ERROR`,
    /// `TICKET_STATUS`, `WORKER_STATE`) and to write `TICKET` after
    /// `ENQUEUE`. Bypasses the guest read-only gate.
    pub fn set(&mut self, offset: u32, value: u32) {
        if let Some(i) = index_of(offset) {
            self.values[i] = value;
        }
    }

    /// Guest-facing byte read at `addr` (relative to `COPROC_BASE`).
    pub fn read_byte(&self, addr: u32) -> u8 {
        let reg_offset = addr & !0x3;
        let shift = (addr & 0x3) * 8;
        let word = index_of(reg_offset).map(|i| self.values[i]).unwrap_or(0);
        (word >> shift) as u8
    }

    /// Guest-facing byte write at `addr` (relative to `COPROC_BASE`).
    /// Returns `true` exactly when this write lands on byte 0 of `CMD` —
    /// the sole condition that dispatches a command (§4.5).
    pub fn write_byte(&mut self, addr: u32, val: u8) -> bool {
        let reg_offset = addr & !0x3;
        let byte = addr & 0x3;

        let Some(i) = index_of(reg_offset) else {
            return false;
        };
        if !is_read_only(reg_offset) {
            let shift = byte * 8;
            let mask = !(0xFFu32 << shift);
            self.values[i] = (self.values[i] & mask) | ((val as u32) << shift);
        }

        reg_offset == reg::CMD && byte == 0
    }
}
