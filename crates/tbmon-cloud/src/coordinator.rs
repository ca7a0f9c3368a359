//! Delivery coordinator
//!
//! Decides, per device and per tick, whether a fresh reading is published now,
//! cached, or held back behind older cached entries. Cached entries always
//! leave the cache in creation order, and a reading is only removed from the
//! cache after the server accepted it.

use crate::cache::{CacheEntry, CacheStore};
use crate::client::{Payload, Publisher};
use crate::error::CloudError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tbmon_core::source::read_with_timeout;
use tbmon_core::{
    DeliveryOutcome, DeviceConfig, FailureReason, Reading, SensorReader, SkipReason, TickReport,
};
use tracing::{debug, error, info, warn};

/// Queue state of a device while its tick is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    /// Nothing pending ahead of a fresh reading
    Clear,

    /// Replay stopped at the per-tick bound with entries still pending
    BoundReached,

    /// Replay failed this tick; no further publishes until next tick
    ReplayBackoff,

    /// A fresh publish failed this tick; no further publishes until next tick
    FreshBackoff,
}

/// Result of replaying one cached entry
enum ReplayStep {
    Confirmed,
    Discarded,
    Halted,
}

/// Process-lifetime delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub cached: u64,
    pub replayed: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub failed: u64,
}

/// Publish-with-cache-fallback pipeline
pub struct DeliveryCoordinator {
    publisher: Arc<dyn Publisher>,
    cache: Arc<dyn CacheStore>,
    read_timeout: Duration,
    max_replay_per_tick: usize,

    // Stats
    delivered: AtomicU64,
    cached: AtomicU64,
    replayed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

impl DeliveryCoordinator {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        cache: Arc<dyn CacheStore>,
        read_timeout: Duration,
        max_replay_per_tick: usize,
    ) -> Self {
        Self {
            publisher,
            cache,
            read_timeout,
            max_replay_per_tick: max_replay_per_tick.max(1),
            delivered: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Get delivery statistics
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Run one tick for a device.
    ///
    /// `host` is the host metrics reader, consulted only when the device has
    /// `sys_info` set. Never fails: everything that happened is in the report.
    pub async fn tick(
        &self,
        device: &DeviceConfig,
        reader: &dyn SensorReader,
        host: Option<&dyn SensorReader>,
    ) -> TickReport {
        let identity = device.identity();
        let settings = &device.settings;

        if !settings.active {
            debug!("Device {} inactive, skipping", identity);
            return TickReport::new(identity, DeliveryOutcome::Skipped(SkipReason::Inactive));
        }

        let fresh = self.read(&identity, reader, device).await;

        let attributes = if !settings.local_only && !device.attributes.is_empty() {
            Some(self.sync_attributes(&identity, device).await)
        } else {
            None
        };

        let (mut state, mut replayed) = if settings.local_only {
            (QueueState::Clear, 0)
        } else {
            self.replay(&identity, &device.authkey).await
        };

        let mut telemetry = match fresh {
            Ok(reading) => self.dispatch(&identity, device, reading, &mut state).await,
            Err(detail) => DeliveryOutcome::Skipped(SkipReason::SourceUnavailable(detail)),
        };

        let host_outcome = if settings.sys_info {
            let outcome = match host {
                Some(host) => match self.read(&identity, host, device).await {
                    Ok(reading) => self.dispatch(&identity, device, reading, &mut state).await,
                    Err(detail) => DeliveryOutcome::Skipped(SkipReason::SourceUnavailable(detail)),
                },
                None => DeliveryOutcome::Skipped(SkipReason::SourceUnavailable(
                    "host metrics reader not registered".to_string(),
                )),
            };
            Some(outcome)
        } else {
            None
        };

        if settings.local_only && settings.clearcache {
            let flushed = self.flush(&identity, &device.authkey).await;
            if flushed > 0 {
                info!("Flushed {} cached readings for device {}", flushed, identity);
                if telemetry == DeliveryOutcome::Cached {
                    telemetry = DeliveryOutcome::CachedAndForwarded { flushed };
                }
            }
            replayed += flushed;
        }

        TickReport {
            device: identity,
            telemetry,
            host: host_outcome,
            attributes,
            replayed,
        }
    }

    async fn read(
        &self,
        identity: &str,
        reader: &dyn SensorReader,
        device: &DeviceConfig,
    ) -> Result<Reading, String> {
        read_with_timeout(reader, device, self.read_timeout)
            .await
            .map_err(|e| {
                debug!("{} read for device {} failed: {}", reader.kind(), identity, e);
                e.to_string()
            })
    }

    /// Publish the device attributes. Never cached; they are sent again next
    /// tick anyway.
    async fn sync_attributes(&self, identity: &str, device: &DeviceConfig) -> DeliveryOutcome {
        match self
            .publisher
            .send(&device.authkey, Payload::Attributes(&device.attributes))
            .await
        {
            Ok(()) => {
                debug!("Attributes synced for device {}", identity);
                DeliveryOutcome::Delivered
            }
            Err(CloudError::Rejected { status, message }) => {
                error!(
                    "Attributes for device {} rejected ({}): {}",
                    identity, status, message
                );
                DeliveryOutcome::Failed(FailureReason::Rejected { status, message })
            }
            Err(e) => {
                warn!("Attribute sync for device {} failed: {}", identity, e);
                DeliveryOutcome::Failed(FailureReason::Dropped(e.to_string()))
            }
        }
    }

    /// Replay pending entries oldest-first, up to the per-tick bound
    async fn replay(&self, identity: &str, key: &str) -> (QueueState, usize) {
        match self.cache.pending_count(identity) {
            Ok(0) => return (QueueState::Clear, 0),
            Ok(pending) => debug!("Replaying {} cached readings for device {}", pending, identity),
            Err(e) => {
                error!("Cache lookup for device {} failed: {}", identity, e);
                return (QueueState::Clear, 0);
            }
        }

        let mut attempts = 0;
        let mut replayed = 0;
        loop {
            if attempts >= self.max_replay_per_tick {
                return match self.cache.has_pending(identity) {
                    Ok(false) => (QueueState::Clear, replayed),
                    Ok(true) => {
                        info!(
                            "Replay bound reached for device {} ({} replayed), rest stays cached",
                            identity, replayed
                        );
                        (QueueState::BoundReached, replayed)
                    }
                    Err(e) => {
                        error!("Cache lookup for device {} failed: {}", identity, e);
                        (QueueState::ReplayBackoff, replayed)
                    }
                };
            }

            let entry = match self.cache.drain_oldest(identity) {
                Ok(Some(entry)) => entry,
                Ok(None) => return (QueueState::Clear, replayed),
                Err(e) => {
                    error!("Cache read for device {} failed: {}", identity, e);
                    return (QueueState::ReplayBackoff, replayed);
                }
            };

            attempts += 1;
            match self.replay_entry(identity, key, &entry).await {
                ReplayStep::Confirmed => replayed += 1,
                ReplayStep::Discarded => {}
                ReplayStep::Halted => return (QueueState::ReplayBackoff, replayed),
            }
        }
    }

    /// Flush every pending entry, stopping at the first failure that may
    /// succeed later
    async fn flush(&self, identity: &str, key: &str) -> usize {
        let mut flushed = 0;
        loop {
            let entry = match self.cache.drain_oldest(identity) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!("Cache read for device {} failed: {}", identity, e);
                    break;
                }
            };

            match self.replay_entry(identity, key, &entry).await {
                ReplayStep::Confirmed => flushed += 1,
                ReplayStep::Discarded => {}
                ReplayStep::Halted => break,
            }
        }
        flushed
    }

    async fn replay_entry(&self, identity: &str, key: &str, entry: &CacheEntry) -> ReplayStep {
        match self.publisher.send(key, Payload::Telemetry(&entry.reading)).await {
            Ok(()) => {
                if let Err(e) = self.cache.confirm(identity, entry.id) {
                    error!(
                        "Failed to confirm cache entry {} for device {}: {}",
                        entry.id, identity, e
                    );
                    return ReplayStep::Halted;
                }
                self.replayed.fetch_add(1, Ordering::Relaxed);
                ReplayStep::Confirmed
            }
            Err(CloudError::Rejected { status, message }) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Cached reading {} for device {} rejected ({}): {}, discarding",
                    entry.id, identity, status, message
                );
                match self.cache.confirm(identity, entry.id) {
                    Ok(()) => ReplayStep::Discarded,
                    Err(e) => {
                        error!(
                            "Failed to discard cache entry {} for device {}: {}",
                            entry.id, identity, e
                        );
                        ReplayStep::Halted
                    }
                }
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if e.is_retryable() {
                    warn!(
                        "Replay of cached reading {} for device {} failed (attempt {}): {}",
                        entry.id,
                        identity,
                        entry.retry_count + 1,
                        e
                    );
                } else {
                    error!(
                        "Replay of cached reading {} for device {} failed (attempt {}): {}",
                        entry.id,
                        identity,
                        entry.retry_count + 1,
                        e
                    );
                }
                if let Err(e) = self.cache.record_failure(identity, entry.id) {
                    error!(
                        "Failed to record retry for cache entry {} of device {}: {}",
                        entry.id, identity, e
                    );
                }
                ReplayStep::Halted
            }
        }
    }

    /// Send, cache, or drop a fresh reading according to the device policy
    /// and the queue state left by replay
    async fn dispatch(
        &self,
        identity: &str,
        device: &DeviceConfig,
        reading: Reading,
        state: &mut QueueState,
    ) -> DeliveryOutcome {
        let settings = &device.settings;

        if settings.local_only {
            return self.append(identity, &reading);
        }

        match *state {
            QueueState::BoundReached => self.append(identity, &reading),
            QueueState::FreshBackoff => {
                if settings.cache_on_error {
                    self.append(identity, &reading)
                } else {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    DeliveryOutcome::Failed(FailureReason::Dropped(
                        "server unavailable earlier this tick".to_string(),
                    ))
                }
            }
            QueueState::ReplayBackoff => {
                if settings.cache_on_error {
                    if let failed @ DeliveryOutcome::Failed(_) = self.append(identity, &reading) {
                        return failed;
                    }
                } else {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Dropping reading for device {}: server unavailable and caching disabled",
                        identity
                    );
                }
                DeliveryOutcome::Failed(FailureReason::ReplayRetryPending)
            }
            QueueState::Clear => {
                match self
                    .publisher
                    .send(&device.authkey, Payload::Telemetry(&reading))
                    .await
                {
                    Ok(()) => {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                        DeliveryOutcome::Delivered
                    }
                    Err(CloudError::Rejected { status, message }) => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        DeliveryOutcome::Failed(FailureReason::Rejected { status, message })
                    }
                    Err(e) => {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        *state = QueueState::FreshBackoff;
                        if e.is_retryable() {
                            warn!("Publish for device {} failed: {}", identity, e);
                        } else {
                            error!("Publish for device {} failed: {}", identity, e);
                        }
                        if settings.cache_on_error {
                            self.append(identity, &reading)
                        } else {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            DeliveryOutcome::Failed(FailureReason::Dropped(e.to_string()))
                        }
                    }
                }
            }
        }
    }

    fn append(&self, identity: &str, reading: &Reading) -> DeliveryOutcome {
        match self.cache.append(identity, reading) {
            Ok(_) => {
                self.cached.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::Cached
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::Failed(FailureReason::Cache(e.to_string()))
            }
        }
    }
}
