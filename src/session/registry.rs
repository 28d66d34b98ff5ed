//! # Session Registry
//!
//! Process-wide map from session id to the provisioned session and, once a
//! client has connected, the connection pair relaying its audio.
//!
//! ## Invariants:
//! - A session id maps to at most one active connection pair.
//! - Releasing a pair removes the session mapping; a session is used by exactly
//!   one duplex connection and the client must start a new session to reconnect.
//! - Registered sessions plus slots reserved by in-flight starts never exceed
//!   `max_sessions`.
//! - Lock sections never span an `.await`; every method is synchronous.

use crate::error::{AppError, AppResult};
use crate::relay::messages::UpstreamFrame;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// A provisioned voice session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Identifier handed to the client (the upstream call id when it has one)
    pub id: String,
    /// Upstream WebSocket endpoint resolved at provisioning time
    pub upstream_endpoint: String,
    /// Assistant/profile the session was provisioned for
    pub assistant_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: String, upstream_endpoint: String, assistant_id: Option<String>) -> Self {
        Self {
            id,
            upstream_endpoint,
            assistant_id,
            created_at: Utc::now(),
        }
    }
}

/// Frames a pair may have queued for its upstream writer. A client that gets
/// further ahead than this is talking to a stalled upstream.
pub const UPSTREAM_QUEUE_CAPACITY: usize = 16;

/// Handle to a live connection pair, held by the registry.
///
/// The sender feeds the pair's upstream writer; anything sent here is written
/// to the upstream socket in send order.
#[derive(Debug, Clone)]
pub struct PairHandle {
    pub pair_id: Uuid,
    pub to_upstream: mpsc::Sender<UpstreamFrame>,
    pub attached_at: DateTime<Utc>,
}

impl PairHandle {
    pub fn new(to_upstream: mpsc::Sender<UpstreamFrame>) -> Self {
        Self {
            pair_id: Uuid::new_v4(),
            to_upstream,
            attached_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    session: Session,
    pair: Option<PairHandle>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Slots held by session starts whose provisioning call is in flight
    reserved: usize,
}

/// Thread-safe registry of sessions.
///
/// Cloning is cheap: all clones share the same map.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
    max_sessions: usize,
}

/// Capacity held for one session start.
///
/// Counts against `max_sessions` from `reserve` until it is registered or
/// dropped, so concurrent starts at the limit never provision an extra call.
#[derive(Debug)]
pub struct SessionSlot {
    registry: SessionRegistry,
    held: bool,
}

impl SessionSlot {
    /// Record the provisioned session in the slot.
    ///
    /// Fails only when the id is already known; the slot is freed either way.
    pub fn register(mut self, session: Session) -> AppResult<()> {
        let mut inner = self.registry.inner.write();
        inner.reserved -= 1;
        self.held = false;

        if inner.entries.contains_key(&session.id) {
            return Err(AppError::InvalidRequest(format!(
                "Session ID '{}' already exists",
                session.id
            )));
        }

        debug!(session_id = %session.id, "Session registered");
        inner.entries.insert(session.id.clone(), Entry { session, pair: None });
        Ok(())
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        if self.held {
            self.registry.inner.write().reserved -= 1;
        }
    }
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            max_sessions,
        }
    }

    /// Hold capacity for a session that is about to be provisioned.
    ///
    /// Registered sessions and outstanding slots both count toward the limit.
    pub fn reserve(&self) -> AppResult<SessionSlot> {
        let mut inner = self.inner.write();
        if inner.entries.len() + inner.reserved >= self.max_sessions {
            return Err(AppError::ServiceUnavailable(format!(
                "Maximum concurrent sessions ({}) reached",
                self.max_sessions
            )));
        }
        inner.reserved += 1;

        Ok(SessionSlot {
            registry: self.clone(),
            held: true,
        })
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.read().entries.get(session_id).map(|e| e.session.clone())
    }

    /// Bind a connection pair to a session.
    ///
    /// ## Returns:
    /// - **Ok(session)**: the pair is now the session's only active pair
    /// - **Err(NotFound)**: unknown (or already consumed) session id
    /// - **Err(InvalidRequest)**: another pair is still active for this id
    pub fn attach(&self, session_id: &str, handle: PairHandle) -> AppResult<Session> {
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))?;

        if entry.pair.is_some() {
            return Err(AppError::InvalidRequest(format!(
                "Session '{}' already has an active connection",
                session_id
            )));
        }

        info!(session_id = %session_id, pair_id = %handle.pair_id, "Connection pair attached");
        entry.pair = Some(handle);
        Ok(entry.session.clone())
    }

    /// Tear down a pair and drop the session mapping.
    ///
    /// Only the pair that is attached may release it, so a stale actor can never
    /// remove someone else's session. Returns whether anything was removed.
    pub fn release(&self, session_id: &str, pair_id: Uuid) -> bool {
        let mut inner = self.inner.write();
        let owned = inner
            .entries
            .get(session_id)
            .and_then(|e| e.pair.as_ref())
            .map(|p| p.pair_id == pair_id)
            .unwrap_or(false);

        if owned {
            inner.entries.remove(session_id);
            info!(session_id = %session_id, pair_id = %pair_id, "Connection pair released");
        }
        owned
    }

    /// Drop sessions that were provisioned but never attached within `max_age_seconds`.
    pub fn sweep_unattached(&self, max_age_seconds: u64) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let before = inner.entries.len();

        inner.entries.retain(|_, entry| {
            entry.pair.is_some()
                || now.signed_duration_since(entry.session.created_at).num_seconds() <= max_age_seconds as i64
        });

        before - inner.entries.len()
    }

    /// Sender of the longest-attached live pair, if any.
    ///
    /// Used to deliver out-of-band control messages (AR events) to whichever
    /// conversation is currently running.
    pub fn oldest_active_pair(&self) -> Option<(String, PairHandle)> {
        self.inner
            .read()
            .entries
            .iter()
            .filter_map(|(id, e)| e.pair.as_ref().map(|p| (id, p)))
            .filter(|(_, p)| !p.to_upstream.is_closed())
            .min_by_key(|(_, p)| p.attached_at)
            .map(|(id, p)| (id.clone(), p.clone()))
    }

    pub fn session_count(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn active_pair_count(&self) -> usize {
        self.inner.read().entries.values().filter(|e| e.pair.is_some()).count()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}
