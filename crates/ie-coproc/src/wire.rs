//! Wire-level types: register offsets, descriptor layouts, and the status/
//! error enumerations exchanged over MMIO. Everything here is a plain value
//! type with no behavior beyond encode/decode — the behavior lives in
//! [`crate::regfile`], [`crate::ring`], and [`crate::manager`].

/// Byte offsets of each register within the coprocessor register file,
/// relative to `ie_bus::constants::COPROC_BASE`.
pub mod reg {
    pub const CMD: u32 = 0x00;
    pub const CPU_TYPE: u32 = 0x04;
    pub const CMD_STATUS: u32 = 0x08;
    pub const CMD_ERROR: u32 = 0x0C;
    pub const TICKET: u32 = 0x10;
    pub const TICKET_STATUS: u32 = 0x14;
    pub const OP: u32 = 0x18;
    pub const REQ_PTR: u32 = 0x1C;
    pub const REQ_LEN: u32 = 0x20;
    pub const RESP_PTR: u32 = 0x24;
    pub const RESP_CAP: u32 = 0x28;
    pub const TIMEOUT: u32 = 0x2C;
    pub const NAME_PTR: u32 = 0x30;
    pub const WORKER_STATE: u32 = 0x34;

    /// Every defined register offset, for shadow-table sizing and tests.
    pub const ALL: [u32; 14] = [
        CMD,
        CPU_TYPE,
        CMD_STATUS,
        CMD_ERROR,
        TICKET,
        TICKET_STATUS,
        OP,
        REQ_PTR,
        REQ_LEN,
        RESP_PTR,
        RESP_CAP,
        TIMEOUT,
        NAME_PTR,
        WORKER_STATE,
    ];
}

/// A command written to `CMD` byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start = 1,
    Stop = 2,
    Enqueue = 3,
    Poll = 4,
    Wait = 5,
}

impl TryFrom<u8> for Command {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Command::Start),
            2 => Ok(Command::Stop),
            3 => Ok(Command::Enqueue),
            4 => Ok(Command::Poll),
            5 => Ok(Command::Wait),
            _ => Err(()),
        }
    }
}

/// `CMD_STATUS` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CmdStatus {
    Ok = 0,
    Error = 1,
}

/// `CMD_ERROR` values. Only meaningful when `CMD_STATUS == Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u32)]
pub enum CmdError {
    #[error("no error")]
    None = 0,
    #[error("unknown or out-of-range CPU_TYPE")]
    InvalidCpu = 1,
    #[error("service binary file could not be found")]
    NotFound = 2,
    #[error("NAME_PTR does not name a valid relative path")]
    PathInvalid = 3,
    #[error("service binary could not be loaded")]
    LoadFailed = 4,
    #[error("worker's ring is full")]
    QueueFull = 5,
    #[error("no worker of the requested CPU_TYPE is running")]
    NoWorker = 6,
    #[error("TICKET does not name a live completion")]
    StaleTicket = 7,
}

impl CmdError {
    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// `TICKET_STATUS` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TicketStatus {
    Pending = 0,
    Running = 1,
    Ok = 2,
    Error = 3,
    Timeout = 4,
    WorkerDown = 5,
}

impl TicketStatus {
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Any status other than `Pending`/`Running` is terminal: once reached,
    /// it is cached and does not change again for that ticket.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, TicketStatus::Pending | TicketStatus::Running)
    }
}

impl TryFrom<u32> for TicketStatus {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TicketStatus::Pending),
            1 => Ok(TicketStatus::Running),
            2 => Ok(TicketStatus::Ok),
            3 => Ok(TicketStatus::Error),
            4 => Ok(TicketStatus::Timeout),
            5 => Ok(TicketStatus::WorkerDown),
            _ => Err(()),
        }
    }
}

/// An opaque request handle. `0` means "no ticket" (used as the sentinel
/// written to `TICKET` after any failing `ENQUEUE`).
pub type Ticket = u32;

/// A request descriptor as laid out in ring memory (32 bytes, all fields
/// little-endian `u32`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestDescriptor {
    pub ticket: Ticket,
    pub cpu_type: u32,
    pub op: u32,
    pub flags: u32,
    pub req_ptr: u32,
    pub req_len: u32,
    pub resp_ptr: u32,
    pub resp_cap: u32,
}

impl RequestDescriptor {
    pub const SIZE: u32 = ie_bus::constants::REQUEST_DESCRIPTOR_SIZE;

    pub fn to_bytes(self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0..4].copy_from_slice(&self.ticket.to_le_bytes());
        buf[4..8].copy_from_slice(&self.cpu_type.to_le_bytes());
        buf[8..12].copy_from_slice(&self.op.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..20].copy_from_slice(&self.req_ptr.to_le_bytes());
        buf[20..24].copy_from_slice(&self.req_len.to_le_bytes());
        buf[24..28].copy_from_slice(&self.resp_ptr.to_le_bytes());
        buf[28..32].copy_from_slice(&self.resp_cap.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let word = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        RequestDescriptor {
            ticket: word(0),
            cpu_type: word(4),
            op: word(8),
            flags: word(12),
            req_ptr: word(16),
            req_len: word(20),
            resp_ptr: word(24),
            resp_cap: word(28),
        }
    }
}

/// A response descriptor as laid out in ring memory (16 bytes, all fields
/// little-endian `u32`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseDescriptor {
    pub ticket: Ticket,
    pub status: u32,
    pub result_code: u32,
    pub resp_len: u32,
}

impl ResponseDescriptor {
    pub const SIZE: u32 = ie_bus::constants::RESPONSE_DESCRIPTOR_SIZE;

    pub fn to_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&self.ticket.to_le_bytes());
        buf[4..8].copy_from_slice(&self.status.to_le_bytes());
        buf[8..12].copy_from_slice(&self.result_code.to_le_bytes());
        buf[12..16].copy_from_slice(&self.resp_len.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let word = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        ResponseDescriptor {
            ticket: word(0),
            status: word(4),
            result_code: word(8),
            resp_len: word(12),
        }
    }
}
