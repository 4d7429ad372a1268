//! In-memory registry of upload sessions and per-upload reassembly gates.
//!
//! Staged part files stay the durable source of truth; sessions add the
//! declared chunk count, received indices, timestamps, and completed
//! outcomes that a directory scan cannot provide.

use crate::{
    models::{
        chunk::FinalizedArtifact,
        session::{SessionKey, SessionState, UploadSession},
    },
    services::error::{IngestError, IngestResult},
};
use chrono::{DateTime, TimeDelta, Utc};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::Mutex as AsyncMutex;

/// What `observe` found for an upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    Active,
    Completed(FinalizedArtifact),
}

pub struct UploadSessions {
    sessions: Mutex<HashMap<SessionKey, UploadSession>>,
    gates: Mutex<HashMap<SessionKey, Arc<AsyncMutex<()>>>>,
    /// How long a finished upload keeps replaying its outcome.
    completed_ttl: TimeDelta,
}

impl UploadSessions {
    pub fn new(completed_ttl: TimeDelta) -> Self {
        Self {
            sessions: Mutex::default(),
            gates: Mutex::default(),
            completed_ttl,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, UploadSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gates(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<AsyncMutex<()>>>> {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a chunk's view of the upload, opening the session on first use.
    ///
    /// Fails when `total_chunks` disagrees with the count the session was
    /// opened with.
    pub fn observe(
        &self,
        key: &SessionKey,
        total_chunks: u32,
        now: DateTime<Utc>,
    ) -> IngestResult<Observation> {
        let mut sessions = self.sessions();
        let session = sessions
            .entry(key.clone())
            .or_insert_with(|| UploadSession::new(key.clone(), total_chunks, now));

        if session.total_chunks != total_chunks {
            return Err(IngestError::TotalChunksMismatch {
                upload_id: key.upload_id.clone(),
                declared: session.total_chunks,
                received: total_chunks,
            });
        }

        session.last_activity = now;
        Ok(match &session.state {
            SessionState::Receiving => Observation::Active,
            SessionState::Completed(artifact) => Observation::Completed(artifact.clone()),
        })
    }

    pub fn mark_received(&self, key: &SessionKey, index: u32, now: DateTime<Utc>) {
        if let Some(session) = self.sessions().get_mut(key) {
            session.received.insert(index);
            session.last_activity = now;
        }
    }

    /// Outcome of a finished upload, if any.
    pub fn completed(&self, key: &SessionKey) -> Option<FinalizedArtifact> {
        match self.sessions().get(key).map(|s| &s.state) {
            Some(SessionState::Completed(artifact)) => Some(artifact.clone()),
            _ => None,
        }
    }

    /// Record a successful reassembly. The session lingers until it expires.
    ///
    /// Finished sessions that already expired are dropped here as well, so
    /// they stay bounded without a sweeper. Unfinished ones still own staged
    /// parts and are left to `take_expired`.
    pub fn complete(
        &self,
        key: &SessionKey,
        total_chunks: u32,
        artifact: FinalizedArtifact,
        now: DateTime<Utc>,
    ) {
        {
            let mut sessions = self.sessions();
            let session = sessions
                .entry(key.clone())
                .or_insert_with(|| UploadSession::new(key.clone(), total_chunks, now));
            session.last_activity = now;
            session.state = SessionState::Completed(artifact);

            let ttl = self.completed_ttl;
            sessions.retain(|_, s| !(s.is_completed() && now - s.last_activity > ttl));
        }
        self.prune_gates();
    }

    pub fn forget(&self, key: &SessionKey) -> Option<UploadSession> {
        self.sessions().remove(key)
    }

    pub fn snapshot(&self, key: &SessionKey) -> Option<UploadSession> {
        self.sessions().get(key).cloned()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock serializing reassembly of one upload.
    ///
    /// The same `Arc` is returned for a key for as long as anyone holds it.
    pub fn gate(&self, key: &SessionKey) -> Arc<AsyncMutex<()>> {
        self.gates()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Remove and return sessions idle for longer than `ttl`.
    ///
    /// Gates with no session and no outstanding holder are dropped too.
    pub fn take_expired(&self, now: DateTime<Utc>, ttl: TimeDelta) -> Vec<UploadSession> {
        let expired: Vec<UploadSession> = {
            let mut sessions = self.sessions();
            let keys: Vec<SessionKey> = sessions
                .iter()
                .filter(|(_, s)| now - s.last_activity > ttl)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };

        self.prune_gates();
        expired
    }

    /// Drop gates with no session and no outstanding holder.
    fn prune_gates(&self) {
        let live: HashSet<SessionKey> = self.sessions().keys().cloned().collect();
        self.gates()
            .retain(|key, gate| live.contains(key) || Arc::strong_count(gate) > 1);
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates().len()
    }
}
