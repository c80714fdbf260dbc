// ===============================
// src/lock.rs (symbol-side dedup lock)
// ===============================
//
// Lock tidak pernah di-release secara eksplisit: TTL yang membebaskannya.
// TTL harus lebih lama dari satu siklus reconcile, tapi cukup pendek agar
// sinyal sah berikutnya tidak terblokir.
// Key symbol-side diberi prefix environment: sandbox dan production adalah
// akun berbeda, jadi tidak boleh saling memblokir.
//
use std::sync::Mutex;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::domain::{Environment, Side};
use crate::error::ExecError;

/// Default lock period.
pub const LOCK_PERIOD: Duration = Duration::from_secs(10);

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically set `key` if absent, with expiry. `false` means already held.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, ExecError>;
}

/// `sandbox:solusdt-sell`
pub fn lock_key(env: Environment, symbol: &str, side: Side) -> String {
    format!("{}:{}-{}", env.as_str(), symbol, side.as_str()).to_ascii_lowercase()
}

/// `SET key locked NX EX ttl`
pub struct RedisLockStore {
    conn: ConnectionManager,
}

impl RedisLockStore {
    pub async fn connect(url: &str) -> Result<Self, ExecError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("redis lock store connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, ExecError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("locked")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        debug!(%key, acquired = reply.is_some(), "lock attempt");
        Ok(reply.is_some())
    }
}

/// In-process lock for single-instance runs without Redis.
#[derive(Default)]
pub struct MemoryLockStore {
    held: Mutex<HashMap<String, Instant>>,
}

impl MemoryLockStore {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, ExecError> {
        let now = Instant::now();
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.retain(|_, expires| *expires > now);
        if held.contains_key(key) {
            return Ok(false);
        }
        held.insert(key.to_string(), now + ttl);
        Ok(true)
    }
}
