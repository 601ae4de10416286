//! Short-TTL advisory locking for progress updates.
//!
//! The lock is a named key holding a caller-opaque owner token, acquired
//! with an atomic set-if-absent and released with a compare-and-delete
//! script that only deletes the key while it still holds the caller's
//! token. An unconditional delete would race with TTL expiry: after the
//! TTL lapses another owner may hold the key, and deleting it would hand
//! the lock to a third caller mid-critical-section.
//!
//! Contention is not an error. `try_acquire` returns `TryLock::Busy` and
//! the caller skips its update; cooperating callers respect the lock but
//! the storage layer does not enforce it.

use std::time::Duration;

use redis::aio::ConnectionManager;
use uuid::Uuid;

use super::tracker::ProgressError;

/// Compare-and-delete: remove the lock key only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Outcome of a lock attempt.
///
/// `Busy` is a normal control-flow branch, never surfaced as an error.
#[derive(Debug)]
pub enum TryLock {
    /// The lock was acquired; the guard must be passed back to `release`.
    Acquired(LockGuard),
    /// Someone else holds the lock; skip this update.
    Busy,
}

/// Proof of lock ownership for one acquisition.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    token: String,
}

impl LockGuard {
    /// Returns the lock key this guard owns.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the opaque owner token.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Acquires and releases short-TTL advisory locks in the fast store.
#[derive(Clone)]
pub struct AdvisoryLock {
    redis: ConnectionManager,
    ttl: Duration,
}

impl AdvisoryLock {
    /// Creates a lock manager with the given TTL.
    ///
    /// The TTL bounds how long a crashed holder can block other writers;
    /// it should be at least the task time limit so a live holder is never
    /// expired mid-update.
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    /// Attempts to acquire the named lock without blocking.
    pub async fn try_acquire(&self, key: &str) -> Result<TryLock, ProgressError> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.redis.clone();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        match acquired {
            Some(_) => Ok(TryLock::Acquired(LockGuard {
                key: key.to_string(),
                token,
            })),
            None => Ok(TryLock::Busy),
        }
    }

    /// Releases a held lock.
    ///
    /// Returns `false` when the lock had already been reclaimed by another
    /// owner after TTL expiry; the caller's mutation still happened, so
    /// this is reported rather than raised.
    pub async fn release(&self, guard: LockGuard) -> Result<bool, ProgressError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&guard.key)
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_have_unique_tokens() {
        let a = LockGuard {
            key: "job:1:lock".to_string(),
            token: Uuid::new_v4().to_string(),
        };
        let b = LockGuard {
            key: "job:1:lock".to_string(),
            token: Uuid::new_v4().to_string(),
        };
        assert_ne!(a.token(), b.token());
        assert_eq!(a.key(), b.key());
    }
}
