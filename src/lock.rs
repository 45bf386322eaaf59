use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

/// TTL-bounded cross-process mutual exclusion. The settlement scheduler
/// claims its pass through this before touching anything; losing the claim
/// is a normal skip, never an error.
#[async_trait]
pub(crate) trait SchedulerLock: Send + Sync {
    /// Claim `name` until `now_ms + ttl_ms`. Returns false when another live
    /// owner holds it. Re-acquiring under the same owner refreshes the TTL.
    async fn try_acquire(&self, name: &str, owner: &str, ttl_ms: i64, now_ms: i64) -> Result<bool>;
    /// Drop the claim if this owner still holds it.
    async fn release(&self, name: &str, owner: &str) -> Result<()>;
}

pub(crate) fn lock_owner_id() -> String {
    format!("{}-{}", std::process::id(), Uuid::new_v4())
}

/// Postgres-backed claim: one row per lock name, taken over only once the
/// previous owner's expiry has lapsed.
pub(crate) struct PgSchedulerLock {
    db: Pool<Postgres>,
}

impl PgSchedulerLock {
    pub(crate) fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SchedulerLock for PgSchedulerLock {
    async fn try_acquire(&self, name: &str, owner: &str, ttl_ms: i64, now_ms: i64) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO scheduler_locks (name, owner, expires_ms) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE SET owner = EXCLUDED.owner, expires_ms = EXCLUDED.expires_ms \
             WHERE scheduler_locks.expires_ms <= $4 OR scheduler_locks.owner = EXCLUDED.owner",
        )
        .bind(name)
        .bind(owner)
        .bind(now_ms + ttl_ms.max(1))
        .bind(now_ms)
        .execute(&self.db)
        .await
        .context("scheduler lock claim")?;
        Ok(res.rows_affected() == 1)
    }

    async fn release(&self, name: &str, owner: &str) -> Result<()> {
        sqlx::query("UPDATE scheduler_locks SET expires_ms = 0 WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.db)
            .await
            .context("scheduler lock release")?;
        Ok(())
    }
}

/// Single-process claim table with the same takeover semantics. Used by
/// tests and by deployments that run exactly one worker.
#[derive(Debug, Default)]
pub(crate) struct LocalSchedulerLock {
    inner: Mutex<HashMap<String, (String, i64)>>,
}

impl LocalSchedulerLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchedulerLock for LocalSchedulerLock {
    async fn try_acquire(&self, name: &str, owner: &str, ttl_ms: i64, now_ms: i64) -> Result<bool> {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let expires = now_ms + ttl_ms.max(1);
        match g.get_mut(name) {
            None => {
                g.insert(name.to_string(), (owner.to_string(), expires));
                Ok(true)
            }
            Some((held_by, held_until)) => {
                if *held_by == owner || *held_until <= now_ms {
                    *held_by = owner.to_string();
                    *held_until = expires;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn release(&self, name: &str, owner: &str) -> Result<()> {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((held_by, held_until)) = g.get_mut(name) {
            if *held_by == owner {
                *held_until = 0;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str = "exchange.settlement";

    #[tokio::test]
    async fn second_owner_is_blocked_until_ttl_lapses() {
        let lock = LocalSchedulerLock::new();
        assert!(lock.try_acquire(NAME, "a", 1000, 0).await.unwrap());
        assert!(!lock.try_acquire(NAME, "b", 1000, 500).await.unwrap());
        // A crashed holder never releases; the TTL does it.
        assert!(lock.try_acquire(NAME, "b", 1000, 1000).await.unwrap());
    }

    #[tokio::test]
    async fn same_owner_refreshes_its_claim() {
        let lock = LocalSchedulerLock::new();
        assert!(lock.try_acquire(NAME, "a", 1000, 0).await.unwrap());
        assert!(lock.try_acquire(NAME, "a", 1000, 900).await.unwrap());
        // Refreshed to 1900; another instance at 1500 still loses.
        assert!(!lock.try_acquire(NAME, "b", 1000, 1500).await.unwrap());
    }

    #[tokio::test]
    async fn release_frees_the_claim_immediately() {
        let lock = LocalSchedulerLock::new();
        assert!(lock.try_acquire(NAME, "a", 10_000, 0).await.unwrap());
        lock.release(NAME, "a").await.unwrap();
        assert!(lock.try_acquire(NAME, "b", 1000, 1).await.unwrap());
    }

    #[tokio::test]
    async fn release_by_non_owner_changes_nothing() {
        let lock = LocalSchedulerLock::new();
        assert!(lock.try_acquire(NAME, "a", 10_000, 0).await.unwrap());
        lock.release(NAME, "b").await.unwrap();
        assert!(!lock.try_acquire(NAME, "b", 1000, 1).await.unwrap());
    }

    #[tokio::test]
    async fn fresh_owner_ids_contend_within_one_process() {
        // A manual trigger must claim under its own id; generated ids never
        // collide, so it cannot ride the scheduler's same-owner refresh.
        let lock = LocalSchedulerLock::new();
        let scheduler = lock_owner_id();
        let trigger = lock_owner_id();
        assert_ne!(scheduler, trigger);
        assert!(lock.try_acquire(NAME, &scheduler, 10_000, 0).await.unwrap());
        assert!(!lock.try_acquire(NAME, &trigger, 10_000, 1).await.unwrap());
        lock.release(NAME, &scheduler).await.unwrap();
        assert!(lock.try_acquire(NAME, &trigger, 10_000, 2).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_names_do_not_contend() {
        let lock = LocalSchedulerLock::new();
        assert!(lock.try_acquire("a.pass", "a", 1000, 0).await.unwrap());
        assert!(lock.try_acquire("b.pass", "b", 1000, 0).await.unwrap());
    }
}
