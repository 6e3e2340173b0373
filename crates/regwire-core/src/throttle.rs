//! Priority-aware concurrency limiting for registry hosts.
//!
//! The request engine acquires a [`ThrottleLease`] before every attempt and
//! guarantees it is released exactly once; release is idempotent and also
//! happens on drop, so an abandoned future cannot leak a slot.

use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Kind of registry request, used as a scheduling hint by throttles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReqKind {
    /// Unclassified request
    #[default]
    Unknown,
    /// Metadata probe (HEAD)
    Head,
    /// Manifest read or write
    Manifest,
    /// Blob transfer
    Blob,
}

/// Metadata describing a pending request for throttle scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReqMeta {
    /// Request kind hint
    pub kind: ReqKind,
    /// Estimated transfer size in bytes (body + expected response)
    pub size: u64,
}

impl ReqMeta {
    /// Create request metadata.
    #[must_use]
    pub const fn new(kind: ReqKind, size: u64) -> Self {
        Self { kind, size }
    }
}

/// A held throttle slot.
///
/// Dropping the lease releases the slot; [`ThrottleLease::release`] does the
/// same explicitly and is safe to call more than once.
#[derive(Default)]
pub struct ThrottleLease {
    slot: Option<Box<dyn std::any::Any + Send + Sync>>,
}

impl ThrottleLease {
    /// Create a lease owning the given slot guard.
    #[must_use]
    pub fn new(slot: Box<dyn std::any::Any + Send + Sync>) -> Self {
        Self { slot: Some(slot) }
    }

    /// Create an empty lease holding no slot.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Release the slot. Idempotent.
    pub fn release(&mut self) {
        self.slot.take();
    }

    /// Returns true while the slot is held.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.slot.is_some()
    }
}

impl std::fmt::Debug for ThrottleLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleLease")
            .field("held", &self.is_held())
            .finish()
    }
}

/// Concurrency limiter scoped to a registry host.
///
/// `acquire` may block indefinitely; callers cancel by dropping the future.
#[async_trait]
pub trait Throttle: Send + Sync {
    /// Acquire a slot for the described request.
    async fn acquire(&self, meta: ReqMeta) -> Result<ThrottleLease>;
}

/// Semaphore-based throttle granting a fixed number of concurrent slots.
///
/// The request metadata is accepted for contract compatibility; this
/// implementation schedules fairly in arrival order regardless of kind.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyLimit {
    /// Create a limiter allowing `slots` concurrent requests.
    #[must_use]
    pub fn new(slots: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(slots)),
        }
    }

    /// Number of currently available slots.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[async_trait]
impl Throttle for ConcurrencyLimit {
    async fn acquire(&self, _meta: ReqMeta) -> Result<ThrottleLease> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| Error::Canceled(format!("throttle closed: {err}")))?;
        Ok(ThrottleLease::new(Box::new(permit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release() {
        let limit = ConcurrencyLimit::new(2);
        let meta = ReqMeta::new(ReqKind::Manifest, 0);

        let mut first = limit.acquire(meta).await.unwrap();
        let second = limit.acquire(meta).await.unwrap();
        assert_eq!(limit.available(), 0);

        first.release();
        assert_eq!(limit.available(), 1);

        drop(second);
        assert_eq!(limit.available(), 2);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let limit = ConcurrencyLimit::new(1);
        let mut lease = limit.acquire(ReqMeta::default()).await.unwrap();
        assert!(lease.is_held());

        lease.release();
        lease.release();
        assert!(!lease.is_held());
        assert_eq!(limit.available(), 1);
    }

    #[tokio::test]
    async fn empty_lease_holds_nothing() {
        let mut lease = ThrottleLease::empty();
        assert!(!lease.is_held());
        lease.release();
        assert!(!lease.is_held());
    }

    #[tokio::test]
    async fn blocks_until_slot_free() {
        let limit = ConcurrencyLimit::new(1);
        let lease = limit.acquire(ReqMeta::default()).await.unwrap();

        let limit2 = limit.clone();
        let waiter = tokio::spawn(async move { limit2.acquire(ReqMeta::default()).await });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(lease);
        let lease2 = waiter.await.unwrap().unwrap();
        assert!(lease2.is_held());
    }
}
