//! The closed set of guest CPU families the machine can run, and the
//! wire-level/physical-layout facts that are fixed per family.

use crate::constants::regions;

/// A guest CPU family. The integer code (1..6) is the value masters and
/// workers exchange over MMIO (`CPU_TYPE`, `cpu_type` in descriptors). `0` is
/// reserved as "unset" and is not representable by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum CpuKind {
    Ie32 = 1,
    Ie64 = 2,
    M68k = 3,
    Z80 = 4,
    Mos6502 = 5,
    X86 = 6,
}

/// All six kinds, in wire-code order. Useful for `workers[cpu_type]`-style
/// tables and for `WORKER_STATE` bitmask iteration.
pub const ALL_KINDS: [CpuKind; 6] = [
    CpuKind::Ie32,
    CpuKind::Ie64,
    CpuKind::M68k,
    CpuKind::Z80,
    CpuKind::Mos6502,
    CpuKind::X86,
];

/// Word width, in bits, native to a guest's general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordWidth {
    W8,
    W16,
    W32,
    W64,
}

/// Error converting a raw wire value into a [`CpuKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CpuKindError {
    #[error("CPU_TYPE 0 is reserved (unset)")]
    Unset,
    #[error("unknown CPU_TYPE code {0}")]
    Unknown(u32),
}

impl TryFrom<u32> for CpuKind {
    type Error = CpuKindError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Err(CpuKindError::Unset),
            1 => Ok(CpuKind::Ie32),
            2 => Ok(CpuKind::Ie64),
            3 => Ok(CpuKind::M68k),
            4 => Ok(CpuKind::Z80),
            5 => Ok(CpuKind::Mos6502),
            6 => Ok(CpuKind::X86),
            other => Err(CpuKindError::Unknown(other)),
        }
    }
}

impl CpuKind {
    /// The wire code written to `CPU_TYPE` and `RequestDescriptor::cpu_type`.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Zero-indexed slot, for `workers[..]`-style tables and the
    /// `WORKER_STATE` bitmask (`bit i == code - 1`).
    pub const fn slot(self) -> usize {
        (self.code() - 1) as usize
    }

    /// Human-readable label, used in debugger registration (`"coproc:<KIND>"`)
    /// and log lines.
    pub const fn label(self) -> &'static str {
        match self {
            CpuKind::Ie32 => "IE32",
            CpuKind::Ie64 => "IE64",
            CpuKind::M68k => "M68K",
            CpuKind::Z80 => "Z80",
            CpuKind::Mos6502 => "6502",
            CpuKind::X86 => "X86",
        }
    }

    /// Reserved `(base, end)` worker memory region, inclusive.
    pub const fn region(self) -> (u32, u32) {
        match self {
            CpuKind::Ie32 => regions::IE32,
            CpuKind::Ie64 => regions::IE64,
            CpuKind::M68k => regions::M68K,
            CpuKind::Z80 => regions::Z80,
            CpuKind::Mos6502 => regions::MOS6502,
            CpuKind::X86 => regions::X86,
        }
    }

    /// Native word width of the guest's general-purpose registers.
    pub const fn word_width(self) -> WordWidth {
        match self {
            CpuKind::Ie32 => WordWidth::W32,
            CpuKind::Ie64 => WordWidth::W64,
            CpuKind::M68k => WordWidth::W32,
            CpuKind::Z80 => WordWidth::W8,
            CpuKind::Mos6502 => WordWidth::W8,
            CpuKind::X86 => WordWidth::W32,
        }
    }

    /// Whether this guest addresses memory through the 64-byte gateway
    /// window rather than directly reaching `COPROC_BASE`.
    pub const fn uses_gateway(self) -> bool {
        matches!(self, CpuKind::Z80 | CpuKind::Mos6502)
    }

    /// Whether 16-bit word fetches from this guest's bus are byte-swapped
    /// (big-endian instruction words over a little-endian backing store).
    pub const fn byte_swaps_fetch(self) -> bool {
        matches!(self, CpuKind::M68k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_code() {
        for kind in ALL_KINDS {
            assert_eq!(CpuKind::try_from(kind.code()).unwrap(), kind);
        }
    }

    #[test]
    fn zero_is_unset() {
        assert_eq!(CpuKind::try_from(0), Err(CpuKindError::Unset));
    }

    #[test]
    fn out_of_range_is_unknown() {
        assert_eq!(CpuKind::try_from(7), Err(CpuKindError::Unknown(7)));
    }

    #[test]
    fn regions_are_disjoint() {
        let mut regions: Vec<(u32, u32)> = ALL_KINDS.iter().map(|k| k.region()).collect();
        regions.sort();
        for pair in regions.windows(2) {
            assert!(pair[0].1 < pair[1].0, "regions overlap: {:?}", pair);
        }
    }

    #[test]
    fn slots_are_a_dense_permutation() {
        let mut slots: Vec<usize> = ALL_KINDS.iter().map(|k| k.slot()).collect();
        slots.sort();
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5]);
    }
}
