//! Accelerator admission control
//!
//! [`AcceleratorGate`] is a counting semaphore with `N` slots placed in front
//! of the shared accelerator. Each inference holds one slot for its whole
//! execution. Memory-sensitive operations (model load, unload, cache clearing)
//! take all `N` slots at once through [`AcceleratorGate::exclusive`], which
//! waits for every in-flight inference to drain and keeps new ones out until
//! it is dropped.
//!
//! Slots are owned permits, so a slot is returned exactly once when its
//! guard is dropped, whichever exit path the holder takes.

use crate::error::{BgServeError, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

/// Bounded-concurrency gate in front of one accelerator
#[derive(Debug, Clone)]
pub struct AcceleratorGate {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

impl AcceleratorGate {
    /// Create a gate admitting at most `capacity` concurrent inferences
    ///
    /// # Errors
    /// - `capacity` is zero or does not fit in a `u32`
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = u32::try_from(capacity)
            .ok()
            .filter(|c| *c > 0)
            .ok_or_else(|| {
                BgServeError::config_value_error("gate_capacity", capacity, "1..=u32::MAX")
            })?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        })
    }

    /// Total number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Slots currently held by inference or exclusive operations
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.capacity().saturating_sub(self.semaphore.available_permits())
    }

    /// Wait for one free slot
    ///
    /// Cancel-safe: dropping the future before it resolves takes no slot.
    ///
    /// # Errors
    /// - The gate was closed
    pub async fn acquire(&self) -> Result<GatePermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| BgServeError::internal("accelerator gate closed"))?;
        trace!(in_flight = self.in_flight(), "gate slot acquired");
        Ok(GatePermit { _permit: permit })
    }

    /// Wait until no inference is in flight and hold every slot
    ///
    /// Tokio's semaphore is fair, so a pending exclusive request also holds
    /// back inference calls that arrive after it.
    ///
    /// # Errors
    /// - The gate was closed
    pub async fn exclusive(&self) -> Result<ExclusiveAccess> {
        debug!(
            in_flight = self.in_flight(),
            capacity = self.capacity,
            "waiting for exclusive accelerator access"
        );
        let permits = Arc::clone(&self.semaphore)
            .acquire_many_owned(self.capacity)
            .await
            .map_err(|_| BgServeError::internal("accelerator gate closed"))?;
        debug!("exclusive accelerator access granted");
        Ok(ExclusiveAccess { _permits: permits })
    }
}

/// One inference slot, returned to the gate on drop
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    /// Return the slot explicitly
    pub fn release(self) {}
}

/// All gate slots, returned together on drop
#[derive(Debug)]
#[must_use = "exclusive access ends as soon as the guard is dropped"]
pub struct ExclusiveAccess {
    _permits: OwnedSemaphorePermit,
}

impl ExclusiveAccess {
    /// Give every slot back
    pub fn release(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(AcceleratorGate::new(0).is_err());
        assert!(AcceleratorGate::new(1).is_ok());
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let gate = AcceleratorGate::new(2).unwrap();
        let first = gate.acquire().await.unwrap();
        let second = gate.acquire().await.unwrap();
        assert_eq!(gate.in_flight(), 2);

        first.release();
        assert_eq!(gate.in_flight(), 1);
        drop(second);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_acquire_blocks_when_full() {
        let gate = AcceleratorGate::new(1).unwrap();
        let held = gate.acquire().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(blocked.is_err(), "second acquire should wait for a free slot");
        assert_eq!(gate.in_flight(), 1, "cancelled acquire must not leak a slot");

        drop(held);
        let permit = tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_in_flight() {
        let gate = AcceleratorGate::new(3).unwrap();
        let inference = gate.acquire().await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), gate.exclusive()).await;
        assert!(pending.is_err(), "exclusive must wait for in-flight inference");

        drop(inference);
        let exclusive = gate.exclusive().await.unwrap();
        assert_eq!(gate.in_flight(), 3);

        let blocked = tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(blocked.is_err(), "inference must wait while exclusive is held");

        exclusive.release();
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_exceeds_capacity() {
        let gate = AcceleratorGate::new(2).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(gate.in_flight(), 0);
    }
}
