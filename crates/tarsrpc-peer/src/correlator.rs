use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tarsrpc_codec::ResponsePacket;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};
use crate::sync::lock_ignore_poison;

const SHARD_COUNT: usize = 16;

/// How a ticket was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum TicketOutcome {
    Completed(ResponsePacket),
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketStatus {
    Pending,
    Completed,
    Expired,
    Cancelled,
}

/// Invoked exactly once with the outcome, on the resolving thread.
pub type TicketCallback = Box<dyn FnOnce(TicketOutcome) + Send + 'static>;

struct TicketState {
    status: TicketStatus,
    outcome: Option<TicketOutcome>,
    callback: Option<TicketCallback>,
}

struct Ticket {
    request_id: i32,
    created: Instant,
    deadline: Instant,
    state: Mutex<TicketState>,
    resolved: Condvar,
}

/// Caller-side handle on a registered ticket.
#[derive(Clone)]
pub struct TicketHandle {
    ticket: Arc<Ticket>,
}

impl TicketHandle {
    pub fn request_id(&self) -> i32 {
        self.ticket.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.ticket.deadline
    }

    pub fn created(&self) -> Instant {
        self.ticket.created
    }

    pub fn status(&self) -> TicketStatus {
        lock_ignore_poison(&self.ticket.state).status
    }
}

impl fmt::Debug for TicketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketHandle")
            .field("request_id", &self.ticket.request_id)
            .field("status", &self.status())
            .finish()
    }
}

/// Table of in-flight calls keyed by request id.
///
/// Each ticket is resolved exactly once, by [`Correlator::complete`] or
/// [`Correlator::expire`], whichever removes it from the table first. The
/// loser sees no ticket and returns `false`. Removal happens before waiters
/// and callbacks are notified, so the id is free again by the time anyone
/// observes the outcome.
pub struct Correlator {
    shards: Vec<Mutex<HashMap<i32, Arc<Ticket>>>>,
    next_id: AtomicI32,
}

impl Correlator {
    pub fn new() -> Self {
        Self::with_initial_id(1)
    }

    /// Start request ids at `first` (clamped to at least 1).
    pub fn with_initial_id(first: i32) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            next_id: AtomicI32::new(first.max(1)),
        }
    }

    /// Next request id: positive, wrapping from `i32::MAX` back to 1.
    pub fn next_request_id(&self) -> i32 {
        let previous = self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id >= i32::MAX || id < 1 { 1 } else { id + 1 })
            })
            .unwrap_or_else(|id| id);
        previous.max(1)
    }

    fn shard(&self, request_id: i32) -> &Mutex<HashMap<i32, Arc<Ticket>>> {
        &self.shards[request_id.unsigned_abs() as usize % SHARD_COUNT]
    }

    /// Register a ticket that expires `timeout` from now.
    pub fn register(&self, request_id: i32, timeout: Duration) -> Result<TicketHandle> {
        self.insert(request_id, timeout, None)
    }

    /// Register a ticket whose outcome is delivered to `callback`.
    pub fn register_with_callback(
        &self,
        request_id: i32,
        timeout: Duration,
        callback: TicketCallback,
    ) -> Result<TicketHandle> {
        self.insert(request_id, timeout, Some(callback))
    }

    fn insert(
        &self,
        request_id: i32,
        timeout: Duration,
        callback: Option<TicketCallback>,
    ) -> Result<TicketHandle> {
        let created = Instant::now();
        let ticket = Arc::new(Ticket {
            request_id,
            created,
            deadline: created + timeout,
            state: Mutex::new(TicketState {
                status: TicketStatus::Pending,
                outcome: None,
                callback,
            }),
            resolved: Condvar::new(),
        });

        match lock_ignore_poison(self.shard(request_id)).entry(request_id) {
            Entry::Occupied(_) => return Err(RpcError::DuplicateTicket(request_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&ticket));
            }
        }
        debug!(request_id, ?timeout, "registered ticket");
        Ok(TicketHandle { ticket })
    }

    /// Attach a callback to a registered ticket.
    ///
    /// If the ticket is already resolved the callback runs immediately on
    /// this thread. Returns `false` if a callback is already attached or
    /// the ticket was cancelled.
    pub fn register_callback(&self, handle: &TicketHandle, callback: TicketCallback) -> bool {
        let mut state = lock_ignore_poison(&handle.ticket.state);
        match state.status {
            TicketStatus::Cancelled => false,
            TicketStatus::Pending if state.callback.is_some() => false,
            TicketStatus::Pending => {
                state.callback = Some(callback);
                true
            }
            TicketStatus::Completed | TicketStatus::Expired => {
                let outcome = state.outcome.clone().unwrap_or(TicketOutcome::Expired);
                drop(state);
                callback(outcome);
                true
            }
        }
    }

    /// Resolve the ticket for `request_id` with a response.
    ///
    /// Returns `false` for late, duplicate or unknown responses.
    pub fn complete(&self, request_id: i32, response: ResponsePacket) -> bool {
        self.resolve(request_id, TicketStatus::Completed, TicketOutcome::Completed(response))
    }

    /// Resolve the ticket for `request_id` as timed out.
    pub fn expire(&self, request_id: i32) -> bool {
        self.resolve(request_id, TicketStatus::Expired, TicketOutcome::Expired)
    }

    /// Drop a ticket without notifying anyone (the call failed before it
    /// was sent).
    pub fn cancel(&self, request_id: i32) -> bool {
        let Some(ticket) = lock_ignore_poison(self.shard(request_id)).remove(&request_id) else {
            return false;
        };
        let mut state = lock_ignore_poison(&ticket.state);
        state.status = TicketStatus::Cancelled;
        state.callback = None;
        drop(state);
        ticket.resolved.notify_all();
        true
    }

    fn resolve(&self, request_id: i32, status: TicketStatus, outcome: TicketOutcome) -> bool {
        let Some(ticket) = lock_ignore_poison(self.shard(request_id)).remove(&request_id) else {
            return false;
        };

        let (callback, for_callback) = {
            let mut state = lock_ignore_poison(&ticket.state);
            state.status = status;
            let callback = state.callback.take();
            let for_callback = callback.as_ref().map(|_| outcome.clone());
            state.outcome = Some(outcome);
            (callback, for_callback)
        };
        ticket.resolved.notify_all();

        if let (Some(callback), Some(outcome)) = (callback, for_callback) {
            callback(outcome);
        }
        debug!(request_id, ?status, "resolved ticket");
        true
    }

    /// Block until the ticket resolves or `timeout` elapses.
    ///
    /// On timeout the ticket is expired and removed; a response racing the
    /// timeout may still win, in which case it is returned.
    pub fn wait(&self, handle: &TicketHandle, timeout: Duration) -> Result<ResponsePacket> {
        let ticket = &handle.ticket;
        let state = lock_ignore_poison(&ticket.state);
        let (state, _) = ticket
            .resolved
            .wait_timeout_while(state, timeout, |s| s.status == TicketStatus::Pending)
            .unwrap_or_else(PoisonError::into_inner);

        let state = if state.status == TicketStatus::Pending {
            drop(state);
            self.expire(ticket.request_id);
            lock_ignore_poison(&ticket.state)
        } else {
            state
        };

        match (&state.status, &state.outcome) {
            (TicketStatus::Completed, Some(TicketOutcome::Completed(response))) => {
                Ok(response.clone())
            }
            (TicketStatus::Cancelled, _) => Err(RpcError::Disconnected(format!(
                "request {} was cancelled",
                ticket.request_id
            ))),
            _ => Err(RpcError::Timeout(timeout)),
        }
    }

    /// Expire every ticket whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let overdue: Vec<i32> = self
            .shards
            .iter()
            .flat_map(|shard| {
                lock_ignore_poison(shard)
                    .values()
                    .filter(|ticket| ticket.deadline <= now)
                    .map(|ticket| ticket.request_id)
                    .collect::<Vec<_>>()
            })
            .collect();

        let expired = overdue.into_iter().filter(|id| self.expire(*id)).count();
        if expired > 0 {
            warn!(expired, "expired overdue tickets");
        }
        expired
    }

    /// Number of live tickets.
    pub fn pending(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| lock_ignore_poison(shard).len())
            .sum()
    }

    pub fn contains(&self, request_id: i32) -> bool {
        lock_ignore_poison(self.shard(request_id)).contains_key(&request_id)
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending())
            .finish()
    }
}
