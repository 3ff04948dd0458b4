use std::{fmt, sync::Arc};

use dashmap::DashMap;

use crate::auth::{AuthContext, TokenService};

/// Identifies one live client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The transport side of a session. Owned by the transport; the registry only
/// holds a handle to it.
pub trait SessionConnection: Send + Sync {
    fn is_open(&self) -> bool;
    fn close(&self) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct Session {
    pub id: SessionId,
    pub auth: AuthContext,
    pub connection: Arc<dyn SessionConnection>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("principal", &self.auth.principal())
            .field("open", &self.connection.is_open())
            .finish()
    }
}

/// Live sessions keyed by connection id.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Session>>,
    tokens: Arc<dyn TokenService>,
}

impl SessionRegistry {
    pub fn new(tokens: Arc<dyn TokenService>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            tokens,
        }
    }

    pub fn add_session(&self, id: SessionId, connection: Arc<dyn SessionConnection>, auth: AuthContext) {
        tracing::debug!(session_id = %id, principal = %auth.principal(), "session added");
        let replaced = self.sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                auth,
                connection,
            },
        );
        if let Some(old) = replaced {
            tracing::warn!(session_id = %id, "session id reused; closing previous connection");
            close_quietly(&old);
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes the session and closes its connection if still open. Removing
    /// an unknown id is a no-op.
    pub fn remove_session(&self, id: &SessionId) -> bool {
        self.close_and_remove(id).is_some()
    }

    /// Returns the removed session and whether its connection was still open.
    fn close_and_remove(&self, id: &SessionId) -> Option<(Session, bool)> {
        let (_, session) = self.sessions.remove(id)?;
        let was_open = session.connection.is_open();
        if was_open {
            close_quietly(&session);
        }
        tracing::debug!(session_id = %id, "session removed");
        Some((session, was_open))
    }

    /// Drops every session whose token has expired, closing live connections
    /// first. Returns how many were removed.
    pub fn evict_expired_sessions(&self) -> usize {
        // Work from a snapshot so shard locks are not held across close().
        let snapshot: Vec<(SessionId, String)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().auth.token().to_string()))
            .collect();

        let mut evicted = 0;
        for (id, token) in snapshot {
            if !self.tokens.is_expired(&token) {
                continue;
            }
            let Some((session, was_open)) = self.close_and_remove(&id) else {
                continue;
            };
            if !was_open {
                tracing::warn!(session_id = %id, principal = %session.auth.principal(), "dropped stale session left behind by a closed connection");
            }
            evicted += 1;
        }

        if evicted > 0 {
            tracing::info!(evicted, remaining = self.sessions.len(), "expired sessions evicted");
        }
        evicted
    }
}

fn close_quietly(session: &Session) {
    if let Err(e) = session.connection.close() {
        tracing::warn!(session_id = %session.id, error = %e, "failed to close session connection");
    }
}
