//! Distributed leased lock over the backing store.
//!
//! Every compound read-modify-write on a shared entity is bracketed by one
//! of these locks. The lock is a JSON record at a well-known key:
//!
//! 1. Acquisition writes the record with a `DoesNotExist` precondition, so
//!    only one writer can succeed.
//! 2. If the record exists, the holder may have crashed: an expired lease
//!    is taken over with a `MatchesVersion` CAS at the observed version.
//! 3. Release CAS-writes an expired record at the acquisition version, so
//!    a racing takeover is never clobbered.
//!
//! The lease is the crash-safety bound: a holder that never unlocks blocks
//! others for at most the lease duration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{KeyValueBackend, WritePrecondition, WriteResult};

/// Default lease duration (30 seconds).
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Base backoff between acquisition attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Maximum backoff between acquisition attempts.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Tuning knobs for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease applied when the caller doesn't pass one explicitly.
    pub lease: Duration,
    /// Base backoff between contended acquisition attempts.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LEASE,
            backoff_base: BACKOFF_BASE,
            backoff_max: BACKOFF_MAX,
        }
    }
}

/// Lock record contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Unique lock holder id.
    pub holder_id: String,

    /// When the lease expires.
    pub expires_at: DateTime<Utc>,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,

    /// Monotonically increasing acquisition sequence.
    ///
    /// Incremented on each acquisition (including takeover), so a holder
    /// can detect that it lost the lock to a newer holder.
    #[serde(default)]
    pub sequence: u64,
}

impl LockInfo {
    /// Creates a new lock record with the given holder, lease, and sequence.
    #[must_use]
    pub fn new(holder_id: impl Into<String>, lease: Duration, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.into(),
            expires_at: now
                + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(30)),
            acquired_at: now,
            sequence,
        }
    }

    /// Returns whether the lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// A named mutual-exclusion handle over a single entity key.
///
/// Not re-entrant: a second `lock()` from the same handle blocks like any
/// other contender.
pub struct DistributedLock<B: KeyValueBackend + ?Sized> {
    backend: Arc<B>,
    lock_path: String,
    holder_id: String,
    config: LockConfig,
}

// Manual Clone to avoid requiring B: Clone.
impl<B: KeyValueBackend + ?Sized> Clone for DistributedLock<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            lock_path: self.lock_path.clone(),
            holder_id: self.holder_id.clone(),
            config: self.config.clone(),
        }
    }
}

enum AcquireError {
    Held(String),
    Storage(Error),
}

impl<B: KeyValueBackend + ?Sized> DistributedLock<B> {
    /// Creates a new lock handle with a fresh holder id.
    #[must_use]
    pub fn new(backend: Arc<B>, lock_path: impl Into<String>) -> Self {
        Self::with_config(backend, lock_path, LockConfig::default())
    }

    /// Creates a new lock handle with explicit tuning.
    #[must_use]
    pub fn with_config(backend: Arc<B>, lock_path: impl Into<String>, config: LockConfig) -> Self {
        Self {
            backend,
            lock_path: lock_path.into(),
            holder_id: Ulid::new().to_string(),
            config,
        }
    }

    /// Returns the holder id for this handle.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns the storage key this lock guards.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.lock_path
    }

    /// Blocks until the lock is acquired, with the default lease.
    ///
    /// # Errors
    ///
    /// Returns an error only on backing-store failure; contention is
    /// retried indefinitely with backoff.
    pub async fn lock(&self) -> Result<LockGuard<B>> {
        self.lock_with_lease(self.config.lease).await
    }

    /// Blocks until the lock is acquired, with an explicit lease.
    ///
    /// The lease bounds the damage from a crashed holder: once it expires,
    /// other contenders take the lock over even though no unlock happened.
    ///
    /// # Errors
    ///
    /// Returns an error only on backing-store failure.
    pub async fn lock_with_lease(&self, lease: Duration) -> Result<LockGuard<B>> {
        let mut backoff = self.config.backoff_base;
        loop {
            match self.try_acquire(lease).await {
                Ok(guard) => return Ok(guard),
                Err(AcquireError::Held(holder)) => {
                    tracing::debug!(path = %self.lock_path, %holder, "lock contended, backing off");
                    let delay = backoff.min(self.config.backoff_max) + jitter();
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(AcquireError::Storage(e)) => return Err(e),
            }
        }
    }

    /// Attempts to acquire the lock once, without waiting.
    ///
    /// Returns `None` if the lock is held by someone with an unexpired
    /// lease.
    ///
    /// # Errors
    ///
    /// Returns an error on backing-store failure.
    pub async fn try_lock(&self) -> Result<Option<LockGuard<B>>> {
        match self.try_acquire(self.config.lease).await {
            Ok(guard) => Ok(Some(guard)),
            Err(AcquireError::Held(_)) => Ok(None),
            Err(AcquireError::Storage(e)) => Err(e),
        }
    }

    /// Attempts to acquire the lock, waiting at most `wait`.
    ///
    /// Returns `None` on timeout — callers treat that as a normal
    /// scheduling signal, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error on backing-store failure.
    pub async fn try_lock_for(&self, wait: Duration) -> Result<Option<LockGuard<B>>> {
        self.try_lock_for_with_lease(wait, self.config.lease).await
    }

    /// Bounded-wait acquisition with an explicit lease.
    ///
    /// # Errors
    ///
    /// Returns an error on backing-store failure.
    pub async fn try_lock_for_with_lease(
        &self,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockGuard<B>>> {
        let deadline = Instant::now() + wait;
        let mut backoff = self.config.backoff_base;
        loop {
            match self.try_acquire(lease).await {
                Ok(guard) => return Ok(Some(guard)),
                Err(AcquireError::Held(_)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let delay = (backoff.min(self.config.backoff_max) + jitter())
                        .min(deadline.saturating_duration_since(now));
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(AcquireError::Storage(e)) => return Err(e),
            }
        }
    }

    /// Attempts one CAS acquisition round.
    async fn try_acquire(&self, lease: Duration) -> std::result::Result<LockGuard<B>, AcquireError> {
        // Fresh locks start at sequence 1.
        let lock_info = LockInfo::new(&self.holder_id, lease, 1);
        let lock_bytes = encode(&lock_info).map_err(AcquireError::Storage)?;

        match self
            .backend
            .put(&self.lock_path, lock_bytes, WritePrecondition::DoesNotExist)
            .await
            .map_err(AcquireError::Storage)?
        {
            WriteResult::Success { version } => {
                return Ok(LockGuard {
                    backend: self.backend.clone(),
                    lock_path: self.lock_path.clone(),
                    holder_id: self.holder_id.clone(),
                    version,
                    sequence: 1,
                    released: false,
                });
            }
            WriteResult::PreconditionFailed { .. } => {
                // A record exists; it may be an expired lease.
            }
        }

        // Bind the expiry decision to a version: HEAD first, then read.
        // If another contender takes over in between, the CAS below fails
        // and we simply report the lock as held.
        let meta = self
            .backend
            .head(&self.lock_path)
            .await
            .map_err(AcquireError::Storage)?;

        let Some(meta) = meta else {
            // Record vanished between the insert attempt and now.
            return Err(AcquireError::Held("race".into()));
        };

        let existing = self.read_lock().await.map_err(AcquireError::Storage)?;

        match existing {
            Some(info) if info.is_expired() => {
                let sequence = info.sequence.saturating_add(1);
                let takeover = LockInfo::new(&self.holder_id, lease, sequence);
                let takeover_bytes = encode(&takeover).map_err(AcquireError::Storage)?;

                match self
                    .backend
                    .put(
                        &self.lock_path,
                        takeover_bytes,
                        WritePrecondition::MatchesVersion(meta.version),
                    )
                    .await
                    .map_err(AcquireError::Storage)?
                {
                    WriteResult::Success { version } => Ok(LockGuard {
                        backend: self.backend.clone(),
                        lock_path: self.lock_path.clone(),
                        holder_id: self.holder_id.clone(),
                        version,
                        sequence,
                        released: false,
                    }),
                    WriteResult::PreconditionFailed { .. } => {
                        Err(AcquireError::Held("unknown".into()))
                    }
                }
            }
            Some(info) => Err(AcquireError::Held(info.holder_id)),
            None => Err(AcquireError::Held("race".into())),
        }
    }

    /// Reads the current lock record, if any.
    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        read_lock_record(self.backend.as_ref(), &self.lock_path).await
    }

    /// Returns whether the lock is currently held with an unexpired lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record could not be read.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .read_lock()
            .await?
            .is_some_and(|info| !info.is_expired()))
    }

    /// Unconditionally releases the lock regardless of holder.
    ///
    /// Administrative recovery only: use when a lock is known stale but its
    /// lease hasn't expired (crashed holder with a long lease).
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be deleted.
    pub async fn force_unlock(&self) -> Result<()> {
        tracing::warn!(path = %self.lock_path, "force-unlocking");
        self.backend.delete(&self.lock_path).await
    }
}

/// RAII guard for a held lock.
///
/// Released automatically on drop (best effort); prefer calling
/// [`LockGuard::release`] so release errors are observable.
pub struct LockGuard<B: KeyValueBackend + ?Sized> {
    backend: Arc<B>,
    lock_path: String,
    holder_id: String,
    /// Version token from acquisition, used for CAS on release.
    version: String,
    sequence: u64,
    released: bool,
}

impl<B: KeyValueBackend + ?Sized> LockGuard<B> {
    /// Returns the holder id for this acquisition.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Returns the acquisition sequence number.
    ///
    /// A higher sequence always denotes a newer holder.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Explicitly releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the release write failed; the lease still
    /// bounds how long the record can linger.
    pub async fn release(mut self) -> Result<()> {
        self.do_release().await
    }

    /// Extends the lease of a held lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is no longer held by this guard.
    pub async fn extend(&mut self, lease: Duration) -> Result<()> {
        let current = read_lock_record(self.backend.as_ref(), &self.lock_path).await?;

        match current {
            Some(info) if info.holder_id == self.holder_id => {
                let mut renewed = info;
                renewed.expires_at = Utc::now()
                    + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(30));
                let renewed_bytes = encode(&renewed)?;

                let meta = self
                    .backend
                    .head(&self.lock_path)
                    .await?
                    .ok_or_else(|| Error::NotFound(self.lock_path.clone()))?;

                match self
                    .backend
                    .put(
                        &self.lock_path,
                        renewed_bytes,
                        WritePrecondition::MatchesVersion(meta.version),
                    )
                    .await?
                {
                    WriteResult::Success { version } => {
                        self.version = version;
                        Ok(())
                    }
                    WriteResult::PreconditionFailed { .. } => Err(Error::PreconditionFailed {
                        message: "lock modified by another holder".into(),
                    }),
                }
            }
            Some(_) => Err(Error::PreconditionFailed {
                message: "lock held by different holder".into(),
            }),
            None => Err(Error::NotFound(self.lock_path.clone())),
        }
    }

    /// CAS-writes an expired record at the acquisition version.
    ///
    /// On precondition failure another holder already took over; their
    /// record is left untouched. The expired record itself stays in place:
    /// the next acquisition overwrites it, and deleting here would race a
    /// concurrent takeover.
    async fn do_release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        if let Some(info) = read_lock_record(self.backend.as_ref(), &self.lock_path).await? {
            if info.holder_id == self.holder_id {
                let expired = LockInfo {
                    holder_id: self.holder_id.clone(),
                    expires_at: Utc::now() - chrono::Duration::seconds(1),
                    acquired_at: info.acquired_at,
                    sequence: info.sequence,
                };
                let expired_bytes = encode(&expired)?;

                let _ = self
                    .backend
                    .put(
                        &self.lock_path,
                        expired_bytes,
                        WritePrecondition::MatchesVersion(self.version.clone()),
                    )
                    .await?;
            }
        }

        self.released = true;
        Ok(())
    }
}

impl<B: KeyValueBackend + ?Sized> Drop for LockGuard<B> {
    fn drop(&mut self) {
        if !self.released {
            // Best-effort async release. Outside a runtime (shutdown,
            // sync contexts) the lease handles eventual cleanup.
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };

            let backend = self.backend.clone();
            let path = self.lock_path.clone();
            let holder = self.holder_id.clone();
            let version = self.version.clone();

            handle.spawn(async move {
                if let Ok(Some(meta)) = backend.head(&path).await {
                    if meta.version == version {
                        if let Ok(Some(info)) = read_lock_record(backend.as_ref(), &path).await {
                            if info.holder_id == holder {
                                let expired = LockInfo {
                                    holder_id: holder,
                                    expires_at: Utc::now() - chrono::Duration::seconds(1),
                                    acquired_at: info.acquired_at,
                                    sequence: info.sequence,
                                };
                                if let Ok(bytes) = encode(&expired) {
                                    let _ = backend
                                        .put(
                                            &path,
                                            bytes,
                                            WritePrecondition::MatchesVersion(version),
                                        )
                                        .await;
                                }
                            }
                        }
                    }
                }
            });
        }
    }
}

fn encode(info: &LockInfo) -> Result<Bytes> {
    serde_json::to_vec(info)
        .map(Bytes::from)
        .map_err(|e| Error::serialization("serialize lock", e))
}

async fn read_lock_record<B: KeyValueBackend + ?Sized>(
    backend: &B,
    path: &str,
) -> Result<Option<LockInfo>> {
    match backend.get(path).await {
        Ok(data) => {
            let info: LockInfo = serde_json::from_slice(&data)
                .map_err(|e| Error::serialization("parse lock", e))?;
            Ok(Some(info))
        }
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Time-seeded jitter for backoff (0-50ms); avoids a rand dependency.
fn jitter() -> Duration {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    Duration::from_millis(seed % 50)
}
