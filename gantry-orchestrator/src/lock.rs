//! Lock Manager
//!
//! Advisory, lease-based mutual exclusion keyed by string. Acquisition never
//! queues: a held key fails immediately with [`LockError::Busy`] and the caller
//! decides whether to retry. Leases run out unless renewed, so a crashed
//! holder blocks a key for at most one lease.
//!
//! Keys are namespaced `component:entity` (see [`LockManager::key`]).
//! Every acquisition gets a fresh holder id, so two tasks of the same process
//! exclude each other just like two processes do.

use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::{SharedClock, to_chrono};
use crate::repository::{LeaseRepository, RepoError};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {0} is held by another owner")]
    Busy(String),

    #[error("lease on {0} was lost")]
    Lost(String),

    #[error(transparent)]
    Repository(#[from] RepoError),
}

/// Proof of holding a key until `expires_at`
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    holder: String,
    token: u64,
    expires_at: DateTime<Utc>,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Fencing token; strictly increases with every successful acquisition of the key
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[derive(Clone)]
pub struct LockManager {
    leases: Arc<dyn LeaseRepository>,
    clock: SharedClock,
    instance_id: Arc<str>,
}

impl LockManager {
    pub fn new(
        leases: Arc<dyn LeaseRepository>,
        clock: SharedClock,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            leases,
            clock,
            instance_id: Arc::from(instance_id.into()),
        }
    }

    /// Builds a namespaced key, e.g. `execution-manager:pipeline:<id>`
    pub fn key(component: &str, entity: impl Display) -> String {
        format!("{}:{}", component, entity)
    }

    pub async fn acquire(&self, key: &str, lease: Duration) -> Result<LockHandle, LockError> {
        let now = self.clock.now();
        let expires_at = now + to_chrono(lease);
        let holder = format!("{}:{}", self.instance_id, uuid::Uuid::new_v4().simple());

        match self.leases.try_acquire(key, &holder, expires_at, now).await? {
            Some(token) => {
                debug!(key, token, "Lock acquired");
                Ok(LockHandle {
                    key: key.to_string(),
                    holder,
                    token,
                    expires_at,
                })
            }
            None => Err(LockError::Busy(key.to_string())),
        }
    }

    /// Retries a busy key a bounded number of times
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        lease: Duration,
        attempts: u32,
        delay: Duration,
    ) -> Result<LockHandle, LockError> {
        let mut attempt = 0;
        loop {
            match self.acquire(key, lease).await {
                Err(LockError::Busy(_)) if attempt + 1 < attempts => {
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Extends the lease; fails with `Lost` if it already expired or moved on
    pub async fn renew(&self, handle: &mut LockHandle, lease: Duration) -> Result<(), LockError> {
        let now = self.clock.now();
        let expires_at = now + to_chrono(lease);
        if self
            .leases
            .renew(&handle.key, &handle.holder, expires_at, now)
            .await?
        {
            handle.expires_at = expires_at;
            Ok(())
        } else {
            Err(LockError::Lost(handle.key.clone()))
        }
    }

    pub async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        if !self.leases.release(&handle.key, &handle.holder).await? {
            debug!(key = %handle.key, "Released a lock that had already expired");
        }
        Ok(())
    }

    /// Whether the handle's lease is still within its expiry
    pub fn is_valid(&self, handle: &LockHandle) -> bool {
        self.clock.now() < handle.expires_at
    }

    /// Acquires `key` and keeps renewing it in the background until released.
    ///
    /// Long critical sections call [`HeldLock::ensure_held`] before each
    /// durable write and stop as soon as it fails.
    pub async fn hold(&self, key: &str, lease: Duration) -> Result<HeldLock, LockError> {
        let handle = self.acquire(key, lease).await?;
        let expires_at = Arc::new(Mutex::new(handle.expires_at));
        let lost = Arc::new(AtomicBool::new(false));

        let renewer = {
            let manager = self.clone();
            let key = handle.key.clone();
            let holder = handle.holder.clone();
            let expires_at = expires_at.clone();
            let lost = lost.clone();
            let period = (lease / 3).max(Duration::from_millis(10));

            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    let now = manager.clock.now();
                    let next = now + to_chrono(lease);
                    match manager.leases.renew(&key, &holder, next, now).await {
                        Ok(true) => *expires_at.lock().unwrap() = next,
                        Ok(false) => {
                            warn!(key = %key, "Lease lost while held");
                            lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => warn!(key = %key, error = %e, "Lease renewal failed, retrying"),
                    }
                }
            })
        };

        Ok(HeldLock {
            manager: self.clone(),
            handle: Some(handle),
            expires_at,
            lost,
            renewer,
        })
    }
}

/// A lock renewed in the background for as long as it is alive
pub struct HeldLock {
    manager: LockManager,
    handle: Option<LockHandle>,
    expires_at: Arc<Mutex<DateTime<Utc>>>,
    lost: Arc<AtomicBool>,
    renewer: JoinHandle<()>,
}

impl HeldLock {
    pub fn token(&self) -> u64 {
        self.handle.as_ref().map(|h| h.token).unwrap_or_default()
    }

    /// Fails with `Lost` once the lease expired or renewal was refused
    pub fn ensure_held(&self) -> Result<(), LockError> {
        let key = self
            .handle
            .as_ref()
            .map(|h| h.key.clone())
            .unwrap_or_default();
        if self.lost.load(Ordering::SeqCst) {
            return Err(LockError::Lost(key));
        }
        let expires_at = *self.expires_at.lock().unwrap();
        if self.manager.clock.now() >= expires_at {
            return Err(LockError::Lost(key));
        }
        Ok(())
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.renewer.abort();
        match self.handle.take() {
            Some(handle) => self.manager.release(handle).await,
            None => Ok(()),
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.renewer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::repository::memory::MemoryStore;

    fn manager(clock: Arc<ManualClock>, instance: &str, store: Arc<MemoryStore>) -> LockManager {
        LockManager::new(store, clock, instance)
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_and_fails_fast() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let a = manager(clock.clone(), "a", store.clone());
        let b = manager(clock.clone(), "b", store);

        let handle = a.acquire("jobs:cron", Duration::from_secs(30)).await.unwrap();
        let err = b.acquire("jobs:cron", Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, LockError::Busy(key) if key == "jobs:cron"));

        a.release(handle).await.unwrap();
        assert!(b.acquire("jobs:cron", Duration::from_secs(30)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unrenewed_lease_expires() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let a = manager(clock.clone(), "a", store.clone());
        let b = manager(clock.clone(), "b", store);

        let mut first = a.acquire("k", Duration::from_secs(30)).await.unwrap();
        clock.advance(Duration::from_secs(29));
        assert!(b.acquire("k", Duration::from_secs(30)).await.is_err());

        clock.advance(Duration::from_secs(6));
        let second = b.acquire("k", Duration::from_secs(30)).await.unwrap();
        assert!(second.token() > first.token());

        // The old holder may no longer extend or trust its lease
        assert!(!a.is_valid(&first));
        let err = a.renew(&mut first, Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, LockError::Lost(_)));
    }

    #[tokio::test]
    async fn test_renew_extends_lease() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let a = manager(clock.clone(), "a", store.clone());
        let b = manager(clock.clone(), "b", store);

        let mut handle = a.acquire("k", Duration::from_secs(30)).await.unwrap();
        clock.advance(Duration::from_secs(20));
        a.renew(&mut handle, Duration::from_secs(30)).await.unwrap();
        clock.advance(Duration::from_secs(20));

        assert!(b.acquire("k", Duration::from_secs(30)).await.is_err());
    }

    #[tokio::test]
    async fn test_held_lock_reports_expiry() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let a = manager(clock.clone(), "a", store);

        let held = a.hold("k", Duration::from_secs(30)).await.unwrap();
        assert!(held.ensure_held().is_ok());

        clock.advance(Duration::from_secs(31));
        assert!(matches!(held.ensure_held(), Err(LockError::Lost(_))));
        held.release().await.unwrap();
    }
}
