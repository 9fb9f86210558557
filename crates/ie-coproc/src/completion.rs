//! `CompletionTracker`: the ticket→outcome map backing `POLL`/`WAIT`.
//!
//! A ticket is allocated on a successful `ENQUEUE` and lives until it is
//! evicted — either by the two-read protocol below, by the TTL sweep, or by
//! the cap sweep if the map grows unbounded because nobody ever polls.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ie_bus::CpuKind;

use crate::wire::{Ticket, TicketStatus};

/// How long a completion is kept around after creation if nobody polls it.
pub const COMPLETION_TTL: Duration = Duration::from_secs(60);

/// Hard cap on live completions; once exceeded, the oldest entries are
/// evicted regardless of whether they have been observed.
pub const MAX_COMPLETIONS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("TICKET does not name a live completion")]
    StaleTicket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollResult {
    pub status: TicketStatus,
    pub result_code: u32,
    pub resp_len: u32,
}

#[derive(Debug, Clone)]
struct Completion {
    cpu_type: CpuKind,
    status: TicketStatus,
    result_code: u32,
    resp_len: u32,
    created_at: Instant,
    /// Set once a terminal status has been returned to exactly one `POLL`.
    /// The *next* `POLL` after that deletes the entry.
    observed: bool,
}

impl Completion {
    fn poll_result(&self) -> PollResult {
        PollResult {
            status: self.status,
            result_code: self.result_code,
            resp_len: self.resp_len,
        }
    }
}

/// Owns the ticket counter and the ticket→outcome map. Not internally
/// synchronized — callers (the manager) hold this behind their own mutex
/// alongside the register shadow and worker table.
#[derive(Default)]
pub struct CompletionTracker {
    next_ticket: Ticket,
    completions: HashMap<Ticket, Completion>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        CompletionTracker {
            next_ticket: 1,
            completions: HashMap::new(),
        }
    }

    /// Allocates a new ticket in `Pending` state for `cpu_type` and returns
    /// it. Never returns `0` (reserved as "no ticket").
    pub fn allocate(&mut self, cpu_type: CpuKind) -> Ticket {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1).max(1);
        self.completions.insert(
            ticket,
            Completion {
                cpu_type,
                status: TicketStatus::Pending,
                result_code: 0,
                resp_len: 0,
                created_at: Instant::now(),
                observed: false,
            },
        );
        ticket
    }

    /// The `cpu_type` stored at `ENQUEUE` time, used for the worker-down
    /// check — never the current `CPU_TYPE` register, which the master may
    /// have since changed.
    pub fn cpu_type_of(&self, ticket: Ticket) -> Option<CpuKind> {
        self.completions.get(&ticket).map(|c| c.cpu_type)
    }

    /// Whether `ticket` is cached with a terminal status already (regardless
    /// of the two-read eviction state). Lets a caller skip an expensive ring
    /// scan once a completion is already settled.
    pub fn is_cached_terminal(&self, ticket: Ticket) -> bool {
        self.completions
            .get(&ticket)
            .map(|c| c.status.is_terminal())
            .unwrap_or(false)
    }

    pub fn mark_running(&mut self, ticket: Ticket) {
        if let Some(c) = self.completions.get_mut(&ticket) {
            if c.status == TicketStatus::Pending {
                c.status = TicketStatus::Running;
            }
        }
    }

    /// Records a terminal outcome for `ticket` as observed off the response
    /// ring. No-op if the ticket is unknown (already evicted, or never
    /// issued by this tracker — e.g. a stale ring entry from a prior run).
    pub fn complete(&mut self, ticket: Ticket, status: TicketStatus, result_code: u32, resp_len: u32) {
        if let Some(c) = self.completions.get_mut(&ticket) {
            c.status = status;
            c.result_code = result_code;
            c.resp_len = resp_len;
            c.observed = false;
        }
    }

    /// `POLL`'s core: returns the current status, applying the worker-down
    /// check (using the *stored* `cpu_type`, not whatever the register
    /// currently holds) and the two-read eviction protocol.
    ///
    /// `worker_alive` reports whether a running worker of the ticket's
    /// stored `cpu_type` still exists.
    pub fn poll(
        &mut self,
        ticket: Ticket,
        worker_alive: impl FnOnce(CpuKind) -> bool,
    ) -> Result<PollResult, PollError> {
        let entry = self.completions.get(&ticket).ok_or(PollError::StaleTicket)?;

        if !entry.status.is_terminal() && !worker_alive(entry.cpu_type) {
            let c = self.completions.get_mut(&ticket).unwrap();
            c.status = TicketStatus::WorkerDown;
            c.result_code = 0;
            c.resp_len = 0;
        }

        let entry = self.completions.get(&ticket).unwrap();
        if !entry.status.is_terminal() {
            return Ok(entry.poll_result());
        }

        if !entry.observed {
            let result = entry.poll_result();
            self.completions.get_mut(&ticket).unwrap().observed = true;
            return Ok(result);
        }

        let result = entry.poll_result();
        self.completions.remove(&ticket);
        Ok(result)
    }

    /// Removes completions older than [`COMPLETION_TTL`], regardless of
    /// whether they have been observed. Intended to be called periodically
    /// by the manager (e.g. at the top of every command dispatch).
    pub fn sweep_ttl(&mut self) {
        let now = Instant::now();
        self.completions
            .retain(|_, c| now.duration_since(c.created_at) < COMPLETION_TTL);
    }

    /// Enforces [`MAX_COMPLETIONS`] by dropping the oldest entries first.
    pub fn sweep_cap(&mut self) {
        if self.completions.len() <= MAX_COMPLETIONS {
            return;
        }
        let mut by_age: Vec<(Ticket, Instant)> = self
            .completions
            .iter()
            .map(|(t, c)| (*t, c.created_at))
            .collect();
        by_age.sort_by_key(|(_, created_at)| *created_at);
        let excess = self.completions.len() - MAX_COMPLETIONS;
        for (ticket, _) in by_age.into_iter().take(excess) {
            self.completions.remove(&ticket);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.completions.len()
    }
}
