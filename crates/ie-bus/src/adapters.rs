//! Per-architecture translators from a guest's native address space onto the
//! shared [`PhysicalBus`]. Every guest CPU is handed one of these instead of
//! the bus directly, so each architecture's addressing/port/endianness
//! quirks live in exactly one place.

use crate::bus::PhysicalBus;
use crate::constants::{COPROC_BASE, GATEWAY_BASE, GATEWAY_SIZE};
use crate::cpu_kind::CpuKind;

/// The operations a guest CPU uses to touch the outside world. Not every
/// guest needs every method (8-bit guests use `in_port`/`out_port` for
/// register access; 32/64-bit guests address registers directly), so the
/// trait provides all of them with sensible default wiring through `read8`/
/// `write8`, and adapters override only what their architecture does
/// differently.
pub trait BusAdapter: Send + Sync {
    fn read8(&self, addr: u32) -> u8;
    fn write8(&self, addr: u32, val: u8);

    fn read16(&self, addr: u32) -> u16 {
        let lo = self.read8(addr) as u16;
        let hi = self.read8(addr.wrapping_add(1)) as u16;
        lo | (hi << 8)
    }

    fn write16(&self, addr: u32, val: u16) {
        self.write8(addr, (val & 0xFF) as u8);
        self.write8(addr.wrapping_add(1), (val >> 8) as u8);
    }

    fn read32(&self, addr: u32) -> u32 {
        let lo = self.read16(addr) as u32;
        let hi = self.read16(addr.wrapping_add(2)) as u32;
        lo | (hi << 16)
    }

    fn write32(&self, addr: u32, val: u32) {
        self.write16(addr, (val & 0xFFFF) as u16);
        self.write16(addr.wrapping_add(2), (val >> 16) as u16);
    }

    /// 16-bit instruction fetch. Defaults to `read16`; M68K overrides this
    /// to byte-swap (big-endian guest over a little-endian backing store).
    /// MMIO register accesses never go through this path.
    fn fetch16(&self, addr: u32) -> u16 {
        self.read16(addr)
    }

    /// Port-mapped I/O, for guests that have one (Z80, 80386). Guests
    /// without port I/O never call this; the default panics so a missing
    /// override is caught immediately rather than silently reading RAM.
    fn in_port(&self, port: u16) -> u8 {
        panic!("bus adapter for this guest has no port I/O (port {port:#x})");
    }

    fn out_port(&self, _port: u16, _val: u8) {
        panic!("bus adapter for this guest has no port I/O");
    }
}

/// Direct 32-bit addressing with no translation: IE32, IE64, M68K all share
/// this shape (M68K additionally byte-swaps instruction fetch, below).
pub struct LinearAdapter<'a> {
    bus: &'a PhysicalBus,
    kind: CpuKind,
}

impl<'a> LinearAdapter<'a> {
    pub fn new(bus: &'a PhysicalBus, kind: CpuKind) -> Self {
        LinearAdapter { bus, kind }
    }
}

impl<'a> BusAdapter for LinearAdapter<'a> {
    fn read8(&self, addr: u32) -> u8 {
        self.bus.read8(addr)
    }
    fn write8(&self, addr: u32, val: u8) {
        self.bus.write8(addr, val)
    }
    fn read16(&self, addr: u32) -> u16 {
        self.bus.read16(addr)
    }
    fn write16(&self, addr: u32, val: u16) {
        self.bus.write16(addr, val)
    }
    fn read32(&self, addr: u32) -> u32 {
        self.bus.read32(addr)
    }
    fn write32(&self, addr: u32, val: u32) {
        self.bus.write32(addr, val)
    }

    fn fetch16(&self, addr: u32) -> u16 {
        if self.kind.byte_swaps_fetch() {
            self.bus.read16(addr).swap_bytes()
        } else {
            self.bus.read16(addr)
        }
    }
}

/// 16-bit guest address space mapped onto a per-CPU bank inside
/// `PhysicalBus`, plus the fixed gateway window that mirrors the coprocessor
/// register file for guests that cannot otherwise reach it.
///
/// Shared by the two 8-bit guests (Z80, 6502); they differ only in whether
/// register access goes through memory-mapped addresses (6502) or through
/// port I/O translated to the same gateway addresses (Z80).
pub struct EightBitAdapter<'a> {
    bus: &'a PhysicalBus,
    bank_base: u32,
}

impl<'a> EightBitAdapter<'a> {
    pub fn new(bus: &'a PhysicalBus, kind: CpuKind) -> Self {
        let (base, _end) = kind.region();
        EightBitAdapter {
            bus,
            bank_base: base,
        }
    }

    /// Maps a 16-bit guest address onto the physical bus: addresses inside
    /// the gateway window translate to the coprocessor register range,
    /// everything else is offset into this CPU's reserved bank.
    fn translate(&self, addr: u16) -> u32 {
        let addr = addr as u32;
        if (GATEWAY_BASE..GATEWAY_BASE + GATEWAY_SIZE).contains(&addr) {
            COPROC_BASE + (addr - GATEWAY_BASE)
        } else {
            self.bank_base + addr
        }
    }
}

impl<'a> BusAdapter for EightBitAdapter<'a> {
    fn read8(&self, addr: u32) -> u8 {
        self.bus.read8(self.translate(addr as u16))
    }
    fn write8(&self, addr: u32, val: u8) {
        self.bus.write8(self.translate(addr as u16), val);
    }
    fn read16(&self, addr: u32) -> u16 {
        self.bus.read16(self.translate(addr as u16))
    }
    fn write16(&self, addr: u32, val: u16) {
        self.bus.write16(self.translate(addr as u16), val);
    }
    fn read32(&self, addr: u32) -> u32 {
        self.bus.read32(self.translate(addr as u16))
    }
    fn write32(&self, addr: u32, val: u32) {
        self.bus.write32(self.translate(addr as u16), val);
    }

    /// Z80 port I/O translates the same way memory-mapped gateway accesses
    /// do: the port number is interpreted as a gateway-relative offset, so it
    /// is first shifted into the gateway window before going through
    /// `translate`.
    fn in_port(&self, port: u16) -> u8 {
        self.read8(GATEWAY_BASE + port as u32)
    }
    fn out_port(&self, port: u16, val: u8) {
        self.write8(GATEWAY_BASE + port as u32, val);
    }
}

/// 32-bit linear addressing plus 16-bit port I/O (80386). Ports translate
/// onto the gateway/MMIO range the same way Z80 ports do, scoped at the
/// 16-bit port horizon rather than the CPU's own (32-bit) memory space.
pub struct X86Adapter<'a> {
    bus: &'a PhysicalBus,
}

impl<'a> X86Adapter<'a> {
    pub fn new(bus: &'a PhysicalBus) -> Self {
        X86Adapter { bus }
    }

    fn translate_port(&self, port: u16) -> u32 {
        let port = port as u32;
        if (GATEWAY_BASE..GATEWAY_BASE + GATEWAY_SIZE).contains(&port) {
            COPROC_BASE + (port - GATEWAY_BASE)
        } else {
            port
        }
    }
}

impl<'a> BusAdapter for X86Adapter<'a> {
    fn read8(&self, addr: u32) -> u8 {
        self.bus.read8(addr)
    }
    fn write8(&self, addr: u32, val: u8) {
        self.bus.write8(addr, val)
    }
    fn read16(&self, addr: u32) -> u16 {
        self.bus.read16(addr)
    }
    fn write16(&self, addr: u32, val: u16) {
        self.bus.write16(addr, val)
    }
    fn read32(&self, addr: u32) -> u32 {
        self.bus.read32(addr)
    }
    fn write32(&self, addr: u32, val: u32) {
        self.bus.write32(addr, val)
    }

    fn in_port(&self, port: u16) -> u8 {
        self.bus.read8(self.translate_port(port))
    }
    fn out_port(&self, port: u16, val: u8) {
        self.bus.write8(self.translate_port(port), val)
    }
}

/// Builds the appropriate adapter for `kind` over `bus`.
pub fn adapter_for<'a>(bus: &'a PhysicalBus, kind: CpuKind) -> Box<dyn BusAdapter + 'a> {
    match kind {
        CpuKind::Ie32 | CpuKind::Ie64 | CpuKind::M68k => {
            Box::new(LinearAdapter::new(bus, kind))
        }
        CpuKind::Z80 | CpuKind::Mos6502 => Box::new(EightBitAdapter::new(bus, kind)),
        CpuKind::X86 => Box::new(X86Adapter::new(bus)),
    }
}
