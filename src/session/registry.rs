use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::session::clock::Clock;
use crate::session::types::Session;
use crate::store::ArtifactRef;
use crate::utils::{ConvertdError, Result};

/// In-memory sessions of one tool category
///
/// Every operation takes the lock briefly and clones out what it needs; the
/// lock is never held across artifact I/O.
pub struct SessionRegistry {
    category: String,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new(category: impl Into<String>, ttl: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        // Absurdly large TTLs are capped rather than overflowing timestamps
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100))
            .min(chrono::Duration::days(365 * 100));
        Self {
            category: category.into(),
            ttl,
            clock,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Records a new session and returns a copy of it.
    ///
    /// `expires_at` is fixed here as `created_at + ttl`.
    pub async fn create(
        &self,
        input: Option<ArtifactRef>,
        output: Option<ArtifactRef>,
        metadata: Map<String, Value>,
    ) -> Session {
        let created_at = self.clock.now();
        let mut guard = self.sessions.write().await;

        let mut id = Uuid::new_v4().to_string();
        while guard.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }

        let session = Session {
            id: id.clone(),
            category: self.category.clone(),
            input,
            output,
            failure: None,
            created_at,
            expires_at: created_at + self.ttl,
            metadata,
        };
        guard.insert(id, session.clone());
        drop(guard);

        debug!(
            session_id = %session.id,
            category = %self.category,
            expires_at = %session.expires_at,
            "Session created"
        );
        session
    }

    /// Pure lookup. Does not check expiry.
    pub async fn get(&self, id: &str) -> Option<Session> {
        let guard = self.sessions.read().await;
        guard.get(id).cloned()
    }

    /// Removes the session, returning it only to the first caller.
    ///
    /// Whoever gets `Some` owns the session's artifacts and must release them.
    pub async fn remove(&self, id: &str) -> Option<Session> {
        let mut guard = self.sessions.write().await;
        guard.remove(id)
    }

    /// Attaches the output of a deferred conversion.
    ///
    /// Fails with `SessionNotFound` if the session was reclaimed meanwhile, in
    /// which case the caller still owns `output`.
    pub async fn complete(
        &self,
        id: &str,
        output: ArtifactRef,
        metadata: Map<String, Value>,
    ) -> Result<Session> {
        let mut guard = self.sessions.write().await;
        let session = guard
            .get_mut(id)
            .ok_or_else(|| ConvertdError::not_found(id))?;

        if session.is_settled() {
            return Err(ConvertdError::invalid_input(format!(
                "session {} already settled",
                id
            )));
        }

        session.output = Some(output);
        session.metadata.extend(metadata);
        Ok(session.clone())
    }

    /// Marks a deferred conversion as failed
    pub async fn fail(&self, id: &str, message: impl Into<String>) -> Result<Session> {
        let mut guard = self.sessions.write().await;
        let session = guard
            .get_mut(id)
            .ok_or_else(|| ConvertdError::not_found(id))?;

        if session.is_settled() {
            return Err(ConvertdError::invalid_input(format!(
                "session {} already settled",
                id
            )));
        }

        session.failure = Some(message.into());
        Ok(session.clone())
    }

    /// Ids of sessions expired at `now`
    pub async fn expired_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        let guard = self.sessions.read().await;
        guard
            .values()
            .filter(|s| s.is_expired_at(now))
            .map(|s| s.id.clone())
            .collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        let guard = self.sessions.read().await;
        guard.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("category", &self.category)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
