//! # Call Session Management
//!
//! Bookkeeping for every media stream the bridge has accepted. A session is
//! created when the driver picks up a connection and lives on after the call
//! ends so the admin API can still report on it, until
//! [`SessionManager::cleanup_finished`] removes it.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: socket accepted, no stream metadata yet
//! 2. **Streaming**: `start` frame received, stream and call ids known
//! 3. **Stopped**: the stream ended cleanly
//! 4. **Failed**: the stream ended with an error
//!
//! ## Thread Safety:
//! The driver task updates a session while admin requests read it. Mutable
//! fields sit behind a `parking_lot::RwLock`; hot counters are atomics so
//! recording a chunk of audio never takes a lock.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "cause", rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Streaming,
    Stopped,
    Failed(String),
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Streaming => "streaming",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed(_) => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Failed(_))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("maximum concurrent streams ({0}) reached")]
    LimitReached(usize),
}

#[derive(Debug)]
struct SessionRecord {
    status: SessionStatus,
    stream_sid: Option<String>,
    call_sid: Option<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    digits: String,
}

/// One call leg as seen by the bridge.
#[derive(Debug)]
pub struct CallSession {
    pub local_id: Uuid,
    pub listener_path: String,
    pub remote_addr: Option<SocketAddr>,
    pub created_at: DateTime<Utc>,
    record: RwLock<SessionRecord>,
    inbound_chunks: AtomicU64,
    inbound_bytes: AtomicU64,
    outbound_chunks: AtomicU64,
}

/// Serializable view of a session for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct CallSessionSummary {
    pub local_id: Uuid,
    pub stream_sid: Option<String>,
    pub call_sid: Option<String>,
    #[serde(flatten)]
    pub status: SessionStatus,
    pub listener_path: String,
    pub remote_addr: Option<SocketAddr>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub inbound_chunks: u64,
    pub inbound_bytes: u64,
    pub outbound_chunks: u64,
    pub digits: String,
}

impl CallSession {
    pub fn new(local_id: Uuid, listener_path: &str, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            local_id,
            listener_path: listener_path.to_string(),
            remote_addr,
            created_at: Utc::now(),
            record: RwLock::new(SessionRecord {
                status: SessionStatus::Connecting,
                stream_sid: None,
                call_sid: None,
                started_at: None,
                ended_at: None,
                digits: String::new(),
            }),
            inbound_chunks: AtomicU64::new(0),
            inbound_bytes: AtomicU64::new(0),
            outbound_chunks: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.record.read().status.clone()
    }

    pub fn stream_sid(&self) -> Option<String> {
        self.record.read().stream_sid.clone()
    }

    pub fn call_sid(&self) -> Option<String> {
        self.record.read().call_sid.clone()
    }

    pub fn digits(&self) -> String {
        self.record.read().digits.clone()
    }

    /// Connecting → Streaming. Ignored in any other status.
    pub fn mark_streaming(&self, stream_sid: Option<String>, call_sid: Option<String>) -> bool {
        let mut record = self.record.write();
        if record.status != SessionStatus::Connecting {
            return false;
        }
        record.status = SessionStatus::Streaming;
        record.stream_sid = stream_sid;
        record.call_sid = call_sid;
        record.started_at = Some(Utc::now());
        true
    }

    /// End the session cleanly. A session that already ended keeps its
    /// first outcome.
    pub fn finish(&self) {
        self.end(SessionStatus::Stopped);
    }

    pub fn fail(&self, cause: impl Into<String>) {
        self.end(SessionStatus::Failed(cause.into()));
    }

    fn end(&self, status: SessionStatus) {
        let mut record = self.record.write();
        if record.status.is_finished() {
            return;
        }
        record.status = status;
        record.ended_at = Some(Utc::now());
    }

    pub fn record_dtmf(&self, digit: &str) {
        self.record.write().digits.push_str(digit);
    }

    pub fn record_inbound(&self, bytes: usize) {
        self.inbound_chunks.fetch_add(1, Ordering::Relaxed);
        self.inbound_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_outbound(&self) {
        self.outbound_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> CallSessionSummary {
        let record = self.record.read();
        let end = record.ended_at.unwrap_or_else(Utc::now);
        CallSessionSummary {
            local_id: self.local_id,
            stream_sid: record.stream_sid.clone(),
            call_sid: record.call_sid.clone(),
            status: record.status.clone(),
            listener_path: self.listener_path.clone(),
            remote_addr: self.remote_addr,
            created_at: self.created_at,
            started_at: record.started_at,
            ended_at: record.ended_at,
            duration_seconds: end.signed_duration_since(self.created_at).num_milliseconds() as f64 / 1000.0,
            inbound_chunks: self.inbound_chunks.load(Ordering::Relaxed),
            inbound_bytes: self.inbound_bytes.load(Ordering::Relaxed),
            outbound_chunks: self.outbound_chunks.load(Ordering::Relaxed),
            digits: record.digits.clone(),
        }
    }
}

/// Aggregate view over all sessions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionManagerSummary {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub status_counts: HashMap<String, usize>,
    pub total_created: u64,
    pub total_inbound_bytes: u64,
    pub total_outbound_chunks: u64,
}

/// Registry of call sessions keyed by the connection's local id.
///
/// Enforces the concurrent stream limit: finished sessions do not count
/// against it.
pub struct SessionManager {
    sessions: RwLock<HashMap<Uuid, Arc<CallSession>>>,
    max_concurrent_streams: usize,
    total_created: AtomicU64,
}

impl SessionManager {
    pub fn new(max_concurrent_streams: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_streams,
            total_created: AtomicU64::new(0),
        }
    }

    pub fn max_concurrent_streams(&self) -> usize {
        self.max_concurrent_streams
    }

    /// Session for `local_id`, created on first use.
    ///
    /// Creating a session fails once `max_concurrent_streams` unfinished
    /// sessions exist; an existing session is always returned.
    pub fn open_session(
        &self,
        local_id: Uuid,
        listener_path: &str,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Arc<CallSession>, SessionError> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&local_id) {
            return Ok(existing.clone());
        }

        let active = sessions.values().filter(|s| !s.status().is_finished()).count();
        if active >= self.max_concurrent_streams {
            return Err(SessionError::LimitReached(self.max_concurrent_streams));
        }

        let session = Arc::new(CallSession::new(local_id, listener_path, remote_addr));
        sessions.insert(local_id, session.clone());
        self.total_created.fetch_add(1, Ordering::Relaxed);
        Ok(session)
    }

    pub fn get_session(&self, local_id: &Uuid) -> Option<Arc<CallSession>> {
        self.sessions.read().get(local_id).cloned()
    }

    /// Most recent session bound to `stream_sid`.
    pub fn find_by_stream(&self, stream_sid: &str) -> Option<Arc<CallSession>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.stream_sid().as_deref() == Some(stream_sid))
            .max_by_key(|s| s.created_at)
            .cloned()
    }

    pub fn remove_session(&self, local_id: &Uuid) -> bool {
        self.sessions.write().remove(local_id).is_some()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| !s.status().is_finished())
            .count()
    }

    /// All sessions, newest first.
    pub fn list(&self) -> Vec<CallSessionSummary> {
        let mut summaries: Vec<_> = self.sessions.read().values().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Drop sessions that ended more than `max_age` ago.
    pub fn cleanup_finished(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| {
            let summary = session.summary();
            match summary.ended_at {
                Some(ended_at) => ended_at > cutoff,
                None => true,
            }
        });
        before - sessions.len()
    }

    pub fn get_sessions_summary(&self) -> SessionManagerSummary {
        let sessions = self.sessions.read();

        let mut status_counts = HashMap::new();
        let mut active_sessions = 0;
        let mut total_inbound_bytes = 0;
        let mut total_outbound_chunks = 0;

        for session in sessions.values() {
            let summary = session.summary();
            if !summary.status.is_finished() {
                active_sessions += 1;
            }
            *status_counts.entry(summary.status.as_str().to_string()).or_insert(0) += 1;
            total_inbound_bytes += summary.inbound_bytes;
            total_outbound_chunks += summary.outbound_chunks;
        }

        SessionManagerSummary {
            total_sessions: sessions.len(),
            active_sessions,
            max_sessions: self.max_concurrent_streams,
            status_counts,
            total_created: self.total_created.load(Ordering::Relaxed),
            total_inbound_bytes,
            total_outbound_chunks,
        }
    }
}
