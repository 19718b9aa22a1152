//! TTL-bounded mutual exclusion for administrative operations that must not
//! overlap across nodes, such as reconciliation. Ordinary stock mutations
//! never take these locks; they rely on the version check instead.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::ServiceError;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

pub fn reconcile_lock_key(variant_id: Uuid) -> String {
    format!("inventory:reconcile:{}", variant_id)
}

/// Proof of ownership; only the holder of the matching token can release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Single attempt; `None` when someone else holds the key.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, ServiceError>;

    /// Returns false when the lock had already expired or changed hands.
    async fn release(&self, guard: &LockGuard) -> Result<bool, ServiceError>;
}

/// Retries `try_acquire` up to `attempts` times, sleeping `delay` between tries.
pub async fn acquire_with_retry(
    lock: &dyn DistributedLock,
    key: &str,
    ttl: Duration,
    attempts: u32,
    delay: Duration,
) -> Result<LockGuard, ServiceError> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if let Some(guard) = lock.try_acquire(key, ttl).await? {
            debug!(key, attempt, "lock acquired");
            return Ok(guard);
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    warn!(key, attempts, "lock still held after retries");
    Err(ServiceError::LockUnavailable(key.to_string()))
}

/// `SET key token NX PX ttl`, released through a compare-and-delete script.
pub struct RedisLock {
    client: Arc<redis::Client>,
}

impl RedisLock {
    pub fn new(client: Arc<redis::Client>) -> Self {
        Self { client }
    }

    pub fn from_url(url: &str) -> Result<Self, ServiceError> {
        let client = redis::Client::open(url)
            .map_err(|e| ServiceError::ConfigError(format!("invalid redis url: {}", e)))?;
        Ok(Self::new(Arc::new(client)))
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, ServiceError> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| ServiceError::LockUnavailable(format!("redis connection failed: {}", e)))?;

        let token = Uuid::new_v4().to_string();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| ServiceError::LockUnavailable(format!("redis SET failed: {}", e)))?;

        Ok(reply.map(|_| LockGuard {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, guard: &LockGuard) -> Result<bool, ServiceError> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| ServiceError::LockUnavailable(format!("redis connection failed: {}", e)))?;

        let deleted: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(&guard.key)
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ServiceError::LockUnavailable(format!("redis release failed: {}", e)))?;
        Ok(deleted == 1)
    }
}

#[derive(Debug)]
struct Held {
    token: String,
    expires_at: Instant,
}

/// Single-process fallback used when no Redis URL is configured.
#[derive(Debug, Default, Clone)]
pub struct InProcessLock {
    locks: Arc<DashMap<String, Held>>,
}

impl InProcessLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InProcessLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, ServiceError> {
        let now = Instant::now();
        let token = Uuid::new_v4().to_string();
        let held = Held {
            token: token.clone(),
            expires_at: now + ttl,
        };

        let acquired = match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut slot) if slot.get().expires_at <= now => {
                slot.insert(held);
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(held);
                true
            }
        };

        Ok(acquired.then(|| LockGuard {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, guard: &LockGuard) -> Result<bool, ServiceError> {
        Ok(self
            .locks
            .remove_if(&guard.key, |_, held| held.token == guard.token)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn second_holder_is_refused_until_release() {
        let lock = InProcessLock::new();
        let ttl = Duration::from_secs(30);
        let guard = lock.try_acquire("k", ttl).await.unwrap().unwrap();
        assert!(lock.try_acquire("k", ttl).await.unwrap().is_none());

        assert!(lock.release(&guard).await.unwrap());
        assert!(lock.try_acquire("k", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over_and_old_guard_cannot_release_it() {
        let lock = InProcessLock::new();
        let stale = lock
            .try_acquire("k", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        let fresh = lock
            .try_acquire("k", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(!lock.release(&stale).await.unwrap());
        assert!(lock.release(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn retry_gives_up_with_lock_unavailable() {
        let lock = InProcessLock::new();
        let _held = lock
            .try_acquire("busy", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let result = acquire_with_retry(
            &lock,
            "busy",
            Duration::from_secs(30),
            3,
            Duration::from_millis(1),
        )
        .await;
        assert_matches!(result, Err(ServiceError::LockUnavailable(key)) if key == "busy");
    }

    #[test]
    fn reconcile_key_is_namespaced() {
        let id = Uuid::nil();
        assert_eq!(
            reconcile_lock_key(id),
            "inventory:reconcile:00000000-0000-0000-0000-000000000000"
        );
    }
}
