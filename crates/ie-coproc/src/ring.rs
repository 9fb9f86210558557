//! `RingMailbox`: the single-producer/single-consumer ring each worker
//! shares with the manager. One ring per [`CpuKind`], fixed at
//! `MAILBOX_BASE + slot * RING_SIZE`.
//!
//! A ring has exactly one head/tail pair, not one per array: slot `i` of the
//! requests array and slot `i` of the responses array are two halves of the
//! same logical entry. The manager (producer) writes `entries[head]` plus a
//! `PENDING` placeholder at `responses[head]`, then advances `head`. The
//! worker (consumer) reads `entries[tail]`, processes it, overwrites
//! `responses[tail]` with the terminal outcome, then advances `tail`.
//! Response slots are read by scanning, not by a second dequeue — a
//! completed response sits in its slot until a later request cycles back
//! around and overwrites it.
//!
//! All memory ordering comes for free from [`ie_bus::PhysicalBus`]: every
//! byte load is `Acquire` and every byte store is `Release`, so a reader that
//! observes an updated `head`/`tail` byte also observes every descriptor byte
//! written before it.

use ie_bus::constants::{
    MAILBOX_BASE, REQUEST_DESCRIPTOR_SIZE, RESPONSE_DESCRIPTOR_SIZE, RING_CAPACITY,
    RING_REQUESTS_OFFSET, RING_RESPONSES_OFFSET, RING_SIZE,
};
use ie_bus::{CpuKind, PhysicalBus};

use crate::wire::{RequestDescriptor, ResponseDescriptor, Ticket, TicketStatus};

const HEAD_OFFSET: u32 = 0x00;
const TAIL_OFFSET: u32 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("ring is full")]
    Full,
}

/// A stateless view onto one `CpuKind`'s ring, backed by the shared physical
/// bus. Cheap to construct on demand; holds no state of its own.
pub struct RingMailbox {
    base: u32,
}

impl RingMailbox {
    pub fn for_kind(kind: CpuKind) -> Self {
        RingMailbox {
            base: MAILBOX_BASE + kind.slot() as u32 * RING_SIZE,
        }
    }

    fn cap() -> u8 {
        RING_CAPACITY
    }

    fn head(&self, bus: &PhysicalBus) -> u8 {
        bus.read8(self.base + HEAD_OFFSET)
    }

    fn tail(&self, bus: &PhysicalBus) -> u8 {
        bus.read8(self.base + TAIL_OFFSET)
    }

    fn set_head(&self, bus: &PhysicalBus, val: u8) {
        bus.write8(self.base + HEAD_OFFSET, val);
    }

    fn set_tail(&self, bus: &PhysicalBus, val: u8) {
        bus.write8(self.base + TAIL_OFFSET, val);
    }

    fn request_slot_addr(&self, slot: u8) -> u32 {
        self.base + RING_REQUESTS_OFFSET + slot as u32 * REQUEST_DESCRIPTOR_SIZE
    }

    fn response_slot_addr(&self, slot: u8) -> u32 {
        self.base + RING_RESPONSES_OFFSET + slot as u32 * RESPONSE_DESCRIPTOR_SIZE
    }

    pub fn is_empty(&self, bus: &PhysicalBus) -> bool {
        self.head(bus) == self.tail(bus)
    }

    pub fn is_full(&self, bus: &PhysicalBus) -> bool {
        (self.head(bus) + 1) % Self::cap() == self.tail(bus)
    }

    /// The manager's producer side: writes the request descriptor and a
    /// `PENDING` response placeholder into slot `head`, then publishes by
    /// advancing `head`.
    pub fn push_request(&self, bus: &PhysicalBus, req: RequestDescriptor) -> Result<u8, RingError> {
        let head = self.head(bus);
        let tail = self.tail(bus);
        let cap = Self::cap();
        if (head + 1) % cap == tail {
            return Err(RingError::Full);
        }
        let slot = head;
        bus.write_bytes(self.request_slot_addr(slot), &req.to_bytes());
        let placeholder = ResponseDescriptor {
            ticket: req.ticket,
            status: TicketStatus::Pending.code(),
            result_code: 0,
            resp_len: 0,
        };
        bus.write_bytes(self.response_slot_addr(slot), &placeholder.to_bytes());
        self.set_head(bus, (head + 1) % cap);
        Ok(slot)
    }

    /// The worker's consumer side: reads the oldest pending request without
    /// advancing `tail` yet — `tail` only advances once the worker publishes
    /// its response via [`Self::complete_request`].
    pub fn pop_request(&self, bus: &PhysicalBus) -> Option<(u8, RequestDescriptor)> {
        let head = self.head(bus);
        let tail = self.tail(bus);
        if head == tail {
            return None;
        }
        let bytes = bus.read_bytes(self.request_slot_addr(tail), REQUEST_DESCRIPTOR_SIZE as usize);
        Some((tail, RequestDescriptor::from_bytes(&bytes)))
    }

    /// The worker's producer side: writes the terminal response into `slot`
    /// (the same slot the request was read from) and advances `tail`.
    pub fn complete_request(&self, bus: &PhysicalBus, slot: u8, resp: ResponseDescriptor) {
        bus.write_bytes(self.response_slot_addr(slot), &resp.to_bytes());
        self.set_tail(bus, (slot + 1) % Self::cap());
    }

    /// Scans every response slot for `ticket`, returning the most recently
    /// written descriptor that names it, if any slot still does. A slot's
    /// ticket field is whatever was most recently written there — once the
    /// ring wraps and a later request reuses the slot, an older ticket's
    /// response is no longer found this way (the completion tracker's cache
    /// is what survives that).
    pub fn find_response(&self, bus: &PhysicalBus, ticket: Ticket) -> Option<ResponseDescriptor> {
        for slot in 0..Self::cap() {
            let bytes = bus.read_bytes(self.response_slot_addr(slot), RESPONSE_DESCRIPTOR_SIZE as usize);
            let resp = ResponseDescriptor::from_bytes(&bytes);
            if resp.ticket == ticket {
                return Some(resp);
            }
        }
        None
    }
}
