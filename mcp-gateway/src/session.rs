//! Conversation sessions and the session store
//!
//! Sessions are shared between the streaming transports and the
//! orchestrator through the `SessionStore` interface. Writes are
//! compare-and-swap on a version counter: concurrent writers to the same
//! session lose with `Conflict`, which enforces the single-writer rule.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use deadpool_redis::Pool as RedisPool;
use serde::{Deserialize, Serialize};
use std::ops::DerefMut;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Transport a session is currently bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Unary,
    Sse,
    Websocket,
}

/// A conversation context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub pending_request_count: u32,
    pub transport: Transport,
    /// CAS version; bumped by the store on every successful save
    #[serde(default)]
    pub version: u64,
}

impl Session {
    /// Create a fresh session for a tenant
    pub fn new(tenant_id: impl Into<String>, transport: Transport) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            created_at: now,
            last_activity_at: now,
            pending_request_count: 0,
            transport,
            version: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// Session persistence interface
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: Uuid) -> Result<Option<Session>>;

    /// Persist the session. Fails with `Conflict` when the stored version
    /// differs from `session.version`; on success the version is bumped
    /// both in the store and on the passed session.
    async fn save(&self, session: &mut Session) -> Result<()>;

    async fn delete(&self, session_id: Uuid) -> Result<()>;

    /// Connectivity check used at startup and by the health surface
    async fn ping(&self) -> Result<()>;
}

/// In-memory session store for tests and store-less development
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<Uuid, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop sessions idle for longer than `idle`
    pub fn sweep_idle(&self, idle: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let stale: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_activity_at < cutoff)
            .map(|entry| entry.session_id)
            .collect();
        for id in &stale {
            self.sessions.remove(id);
        }
        stale.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: Uuid) -> Result<Option<Session>> {
        Ok(self.sessions.get(&session_id).map(|entry| entry.clone()))
    }

    async fn save(&self, session: &mut Session) -> Result<()> {
        match self.sessions.entry(session.session_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().version != session.version {
                    return Err(Error::Conflict(format!(
                        "session {} was modified concurrently",
                        session.session_id
                    )));
                }
                session.version += 1;
                entry.insert(session.clone());
            }
            Entry::Vacant(entry) => {
                if session.version != 0 {
                    return Err(Error::Conflict(format!(
                        "session {} no longer exists",
                        session.session_id
                    )));
                }
                session.version = 1;
                entry.insert(session.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, session_id: Uuid) -> Result<()> {
        self.sessions.remove(&session_id);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Compare-and-swap save: key holds JSON, version field inside the JSON
/// is the CAS token. Returns 1 on success, 0 on conflict.
const SAVE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
  local decoded = cjson.decode(current)
  if tostring(decoded.version) ~= ARGV[1] then
    return 0
  end
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
return 1
"#;

/// Redis-backed session store
pub struct RedisSessionStore {
    pool: RedisPool,
    idle_ttl: Duration,
}

impl RedisSessionStore {
    pub fn new(pool: RedisPool, idle_ttl: Duration) -> Self {
        Self { pool, idle_ttl }
    }

    pub fn connect(url: &str, idle_ttl: Duration) -> Result<Self> {
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| Error::Store(format!("Failed to create session store pool: {e}")))?;
        Ok(Self::new(pool, idle_ttl))
    }

    fn key(session_id: Uuid) -> String {
        format!("session:{session_id}")
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Store(format!("Failed to get session store connection: {e}")))
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn load(&self, session_id: Uuid) -> Result<Option<Session>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(session_id))
            .query_async(conn.deref_mut())
            .await?;
        match raw {
            Some(json) => {
                let session = serde_json::from_str(&json)
                    .map_err(|e| Error::Store(format!("Corrupt session record: {e}")))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, session: &mut Session) -> Result<()> {
        let mut conn = self.conn().await?;
        let expected = session.version;
        session.version += 1;
        let payload = serde_json::to_string(&session)
            .map_err(|e| Error::Store(format!("Session encoding failed: {e}")))?;

        let ok: i64 = redis::Script::new(SAVE_SCRIPT)
            .key(Self::key(session.session_id))
            .arg(expected.to_string())
            .arg(payload)
            .arg(self.idle_ttl.as_secs().max(1))
            .invoke_async(conn.deref_mut())
            .await?;

        if ok == 1 {
            Ok(())
        } else {
            session.version = expected;
            Err(Error::Conflict(format!(
                "session {} was modified concurrently",
                session.session_id
            )))
        }
    }

    async fn delete(&self, session_id: Uuid) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("DEL")
            .arg(Self::key(session_id))
            .query_async(conn.deref_mut())
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(conn.deref_mut()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_load() {
        let store = InMemorySessionStore::new();
        let mut session = Session::new("t1", Transport::Sse);
        store.save(&mut session).await.unwrap();
        assert_eq!(session.version, 1);

        let loaded = store.load(session.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.tenant_id, "t1");
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_concurrent_save_conflicts() {
        let store = InMemorySessionStore::new();
        let mut session = Session::new("t1", Transport::Unary);
        store.save(&mut session).await.unwrap();

        // Two writers load the same version
        let mut a = store.load(session.session_id).await.unwrap().unwrap();
        let mut b = store.load(session.session_id).await.unwrap().unwrap();

        a.pending_request_count = 1;
        store.save(&mut a).await.unwrap();

        b.pending_request_count = 2;
        let err = store.save(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn test_save_after_delete_conflicts() {
        let store = InMemorySessionStore::new();
        let mut session = Session::new("t1", Transport::Unary);
        store.save(&mut session).await.unwrap();
        store.delete(session.session_id).await.unwrap();

        let err = store.save(&mut session).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn test_sweep_idle() {
        let store = InMemorySessionStore::new();
        let mut fresh = Session::new("t1", Transport::Unary);
        store.save(&mut fresh).await.unwrap();

        let mut stale = Session::new("t2", Transport::Unary);
        stale.last_activity_at = Utc::now() - chrono::Duration::hours(2);
        store.save(&mut stale).await.unwrap();
        // Re-stamp after save so the record itself is stale
        if let Some(mut entry) = store.sessions.get_mut(&stale.session_id) {
            entry.last_activity_at = Utc::now() - chrono::Duration::hours(2);
        }

        let swept = store.sweep_idle(Duration::from_secs(3600));
        assert_eq!(swept, 1);
        assert!(store.load(stale.session_id).await.unwrap().is_none());
        assert!(store.load(fresh.session_id).await.unwrap().is_some());
    }
}
