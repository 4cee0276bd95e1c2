//! Lease-based leader election.
//!
//! The distributed path is a plain SET NX PX lease with compare-and-extend /
//! compare-and-delete scripts. When the store is unreachable, acquisition
//! falls back to an in-process lease table so singleton jobs keep running in
//! degraded single-replica mode; a memory lease forfeits itself as soon as
//! the store answers again, forcing re-acquisition of a real lease.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::scripts;
use crate::store::CoordStore;
use crate::util::random_hex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseMode {
    Distributed,
    /// Held only inside this process. Not safe across replicas.
    Memory,
}

#[derive(Clone, Debug)]
pub struct Lease {
    pub job: String,
    pub token: String,
    pub ttl_ms: u64,
    pub mode: LeaseMode,
}

#[derive(Debug)]
struct MemoryLease {
    token: String,
    expires_at_ms: u64,
}

/// Process-scoped fallback lease table. Injected explicitly (not a global)
/// so tests and embedders construct isolated instances.
#[derive(Debug, Default)]
pub struct MemoryLocks {
    leases: Mutex<HashMap<String, MemoryLease>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn acquire(&self, job: &str, token: &str, ttl_ms: u64, now_ms: u64) -> bool {
        let mut leases = self.leases.lock().await;
        match leases.get(job) {
            Some(existing) if existing.expires_at_ms > now_ms && existing.token != token => false,
            _ => {
                leases.insert(
                    job.to_string(),
                    MemoryLease {
                        token: token.to_string(),
                        expires_at_ms: now_ms + ttl_ms,
                    },
                );
                true
            }
        }
    }

    async fn renew(&self, job: &str, token: &str, ttl_ms: u64, now_ms: u64) -> bool {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(job) {
            Some(existing) if existing.token == token && existing.expires_at_ms > now_ms => {
                existing.expires_at_ms = now_ms + ttl_ms;
                true
            }
            _ => false,
        }
    }

    async fn release(&self, job: &str, token: &str) {
        let mut leases = self.leases.lock().await;
        if leases.get(job).is_some_and(|lease| lease.token == token) {
            leases.remove(job);
        }
    }
}

#[derive(Clone)]
pub struct LeaderLock {
    store: CoordStore,
    fallback: Arc<MemoryLocks>,
    clock: Arc<dyn Clock>,
}

impl LeaderLock {
    pub fn new(store: CoordStore, fallback: Arc<MemoryLocks>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            fallback,
            clock,
        }
    }

    /// Try to take the lease. `None` means someone else holds it; that is
    /// contention, not an error.
    pub async fn acquire(&self, job: &str, ttl_ms: u64) -> Option<Lease> {
        let token = random_hex(16);
        match self.try_acquire_distributed(job, &token, ttl_ms).await {
            Ok(true) => Some(Lease {
                job: job.to_string(),
                token,
                ttl_ms,
                mode: LeaseMode::Distributed,
            }),
            Ok(false) => {
                debug!(job, "lease held elsewhere, not leader this cycle");
                None
            }
            Err(err) => {
                warn!(job, error = %err, "store unreachable, using in-process lease");
                let now_ms = self.clock.now_epoch_ms();
                if self.fallback.acquire(job, &token, ttl_ms, now_ms).await {
                    Some(Lease {
                        job: job.to_string(),
                        token,
                        ttl_ms,
                        mode: LeaseMode::Memory,
                    })
                } else {
                    None
                }
            }
        }
    }

    async fn try_acquire_distributed(&self, job: &str, token: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.store.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.store.key_lock(job))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// Extend the lease if this holder still owns it. A memory-mode lease
    /// forfeits the moment the store is reachable again, so the next cycle
    /// must win a real distributed lease.
    pub async fn renew(&self, lease: &Lease, ttl_ms: u64) -> bool {
        match lease.mode {
            LeaseMode::Memory => {
                if self.store.ping().await.is_ok() {
                    info!(job = %lease.job, "store is back, forfeiting in-process lease");
                    self.fallback.release(&lease.job, &lease.token).await;
                    return false;
                }
                let now_ms = self.clock.now_epoch_ms();
                self.fallback
                    .renew(&lease.job, &lease.token, ttl_ms, now_ms)
                    .await
            }
            LeaseMode::Distributed => match self.try_renew_distributed(lease, ttl_ms).await {
                Ok(renewed) => {
                    if !renewed {
                        debug!(job = %lease.job, "lease token no longer matches, renewal refused");
                    }
                    renewed
                }
                Err(err) => {
                    warn!(job = %lease.job, error = %err, "lease renewal failed");
                    false
                }
            },
        }
    }

    async fn try_renew_distributed(&self, lease: &Lease, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.store.connection().await?;
        let reply: i64 = scripts::renew_lock()
            .key(self.store.key_lock(&lease.job))
            .arg(&lease.token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(reply == 1)
    }

    /// Give the lease back. Idempotent; releasing an expired or stolen lease
    /// does nothing.
    pub async fn release(&self, lease: &Lease) {
        match lease.mode {
            LeaseMode::Memory => self.fallback.release(&lease.job, &lease.token).await,
            LeaseMode::Distributed => {
                if let Err(err) = self.try_release_distributed(lease).await {
                    debug!(job = %lease.job, error = %err, "lease release dropped");
                }
            }
        }
    }

    async fn try_release_distributed(&self, lease: &Lease) -> Result<()> {
        let mut conn = self.store.connection().await?;
        let _: i64 = scripts::release_lock()
            .key(self.store.key_lock(&lease.job))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_lease_is_mutually_exclusive_until_expiry() {
        let locks = MemoryLocks::new();
        assert!(locks.acquire("prober", "a", 1_000, 10_000).await);
        assert!(!locks.acquire("prober", "b", 1_000, 10_500).await);

        // Expired: a new holder may take it.
        assert!(locks.acquire("prober", "b", 1_000, 11_000).await);
    }

    #[tokio::test]
    async fn memory_renew_requires_matching_live_token() {
        let locks = MemoryLocks::new();
        assert!(locks.acquire("prober", "a", 1_000, 0).await);

        assert!(locks.renew("prober", "a", 1_000, 500).await);
        assert!(!locks.renew("prober", "b", 1_000, 500).await);
        assert!(!locks.renew("prober", "a", 1_000, 2_000).await);
    }

    #[tokio::test]
    async fn memory_release_then_acquire_succeeds() {
        let locks = MemoryLocks::new();
        assert!(locks.acquire("cleanup", "a", 1_000, 0).await);
        locks.release("cleanup", "a").await;
        assert!(locks.acquire("cleanup", "b", 1_000, 1).await);
    }

    #[tokio::test]
    async fn memory_release_ignores_foreign_token() {
        let locks = MemoryLocks::new();
        assert!(locks.acquire("cleanup", "a", 1_000, 0).await);
        locks.release("cleanup", "b").await;
        assert!(!locks.acquire("cleanup", "c", 1_000, 1).await);
    }
}
