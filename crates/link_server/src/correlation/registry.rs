//! Pending-call table.
//!
//! The registry maps a [`CallId`] to the callback waiting for its reply and
//! arms a deadline timer for every entry. An entry leaves the table exactly
//! once: either [`CorrelationRegistry::resolve`] or the timer removes it, and
//! whichever removal wins decides which outcome the callback sees. The loser
//! finds nothing and becomes a no-op.

use crate::error::{BridgeError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

/// Outcome handed to a pending call's callback.
pub type CallOutcome = std::result::Result<Value, BridgeError>;

type Callback = Box<dyn FnOnce(CallOutcome) + Send>;

/// Identifier of a correlated call: ten ASCII alphanumerics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(String);

impl CallId {
    pub const LEN: usize = 10;

    pub fn generate() -> Self {
        let id = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(Self::LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Deadline applied to correlated calls.
///
/// The server side measures wall-clock time; the in-engine script counts
/// game ticks, which run at [`CallTimeout::TICKS_PER_SECOND`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeout(Duration);

impl CallTimeout {
    pub const TICKS_PER_SECOND: u64 = 20;

    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub fn from_ticks(ticks: u64) -> Self {
        Self(Duration::from_millis(ticks * 1000 / Self::TICKS_PER_SECOND))
    }
}

impl From<CallTimeout> for Duration {
    fn from(timeout: CallTimeout) -> Self {
        timeout.0
    }
}

struct PendingCall {
    event: String,
    // Never locked, only unwrapped on settle. Lets `Send`-only callbacks
    // live in a shared table.
    callback: Mutex<Callback>,
    timer: Option<JoinHandle<()>>,
}

impl PendingCall {
    fn settle(self, outcome: CallOutcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        let callback = self.callback.into_inner().unwrap_or_else(PoisonError::into_inner);
        callback(outcome);
    }
}

/// Table of outstanding correlated calls.
#[derive(Clone)]
pub struct CorrelationRegistry {
    pending: Arc<DashMap<CallId, PendingCall>>,
    timeout: Duration,
}

impl CorrelationRegistry {
    pub fn new(timeout: impl Into<Duration>) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            timeout: timeout.into(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a pending call and arms its deadline.
    ///
    /// Must be called from within a tokio runtime. A freshly generated id
    /// that is already pending is discarded and regenerated.
    pub fn register<F>(&self, event: &str, callback: F) -> CallId
    where
        F: FnOnce(CallOutcome) + Send + 'static,
    {
        let callback: Callback = Box::new(callback);
        let id = loop {
            let id = CallId::generate();
            match self.pending.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(PendingCall {
                        event: event.to_string(),
                        callback: Mutex::new(callback),
                        timer: None,
                    });
                    break id;
                }
                Entry::Occupied(_) => debug!("Call id {} already pending, regenerating", id),
            }
        };

        let deadline = Instant::now() + self.timeout;
        let timer = tokio::spawn(expire_at(Arc::downgrade(&self.pending), id.clone(), deadline));
        match self.pending.get_mut(&id) {
            Some(mut call) => call.timer = Some(timer),
            // Already settled; nothing left to cancel.
            None => timer.abort(),
        }

        debug!("Registered call {} for '{}'", id, event);
        id
    }

    /// Settles a call with a reply. Fails with [`BridgeError::UnknownCall`]
    /// when the id is not pending, which covers late replies after expiry.
    pub fn resolve(&self, id: &CallId, message: Value) -> Result<()> {
        match self.pending.remove(id) {
            Some((_, call)) => {
                debug!("Call {} for '{}' resolved", id, call.event);
                call.settle(Ok(message));
                Ok(())
            }
            None => {
                error!("Event callback {} does not exist", id);
                Err(BridgeError::UnknownCall { id: id.to_string() })
            }
        }
    }

    /// Settles a call with an error before its deadline. Returns whether the
    /// call was still pending.
    pub fn fail(&self, id: &CallId, err: BridgeError) -> bool {
        match self.pending.remove(id) {
            Some((_, call)) => {
                call.settle(Err(err));
                true
            }
            None => false,
        }
    }

    /// Expires a call as if its deadline had passed.
    pub fn expire(&self, id: &CallId) -> bool {
        self.fail(id, BridgeError::NoResponse { id: id.to_string() })
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

async fn expire_at(pending: Weak<DashMap<CallId, PendingCall>>, id: CallId, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;

    let Some(pending) = pending.upgrade() else {
        return;
    };
    if let Some((_, mut call)) = pending.remove(&id) {
        debug!("Call {} for '{}' timed out", id, call.event);
        // The timer is this task.
        call.timer = None;
        call.settle(Err(BridgeError::NoResponse { id: id.to_string() }));
    }
}
