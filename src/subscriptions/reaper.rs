//! Background eviction of expired and unreachable subscriptions.
//!
//! Each sweep works on a snapshot of the registry, so slow probes never hold
//! the registry lock. Per subscription:
//! 1. `never_expires` entries are skipped entirely
//! 2. renewal-required entries older than the TTL are evicted as expired
//! 3. everything else is probed once its last successful probe is older
//!    than the liveness interval; failures (including probe errors and
//!    panics) bump the unavailable count, and exceeding the limit evicts it
//!
//! Eviction goes through [`SubscriptionRegistry::unsubscribe_if`], so store and
//! notifier side effects match an explicit unsubscribe. The eviction reason
//! is re-checked under the registry lock, so a renewal landing after the
//! snapshot keeps the subscription alive.

use crate::config::ReaperConfig;
use crate::error::{RegistryError, Result};
use crate::liveness::LivenessProber;
use crate::types::{SubscriptionId, Timestamp};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use super::registry::SubscriptionRegistry;
use super::types::Subscription;

/// Why a subscription was evicted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionReason {
    /// Renewal-required subscription outlived its TTL.
    Expired,
    /// Consumer failed too many consecutive liveness probes.
    Unreachable,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::Expired => f.write_str("expired"),
            EvictionReason::Unreachable => f.write_str("unreachable"),
        }
    }
}

/// What one sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Subscriptions in the snapshot.
    pub examined: usize,
    /// Probes issued.
    pub probed: usize,
    /// Probes that failed, errored or panicked.
    pub probe_failures: usize,
    pub expired: Vec<SubscriptionId>,
    pub unreachable: Vec<SubscriptionId>,
}

impl SweepReport {
    pub fn evicted(&self) -> usize {
        self.expired.len() + self.unreachable.len()
    }
}

/// Applies expiration and liveness policy to a registry.
pub struct Reaper {
    registry: Arc<SubscriptionRegistry>,
    prober: Arc<dyn LivenessProber>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        prober: Arc<dyn LivenessProber>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            registry,
            prober,
            config,
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Sweep at the registry clock's current time.
    pub fn sweep(&self) -> SweepReport {
        let now = self.registry.clock().now();
        self.sweep_at(now)
    }

    /// Sweep as if the current time were `now`.
    pub fn sweep_at(&self, now: Timestamp) -> SweepReport {
        let snapshot = self.registry.snapshot_all();
        let mut report = SweepReport {
            examined: snapshot.len(),
            ..Default::default()
        };

        for sub in snapshot.values() {
            if let Some(reason) = self.check(sub, now, &mut report) {
                self.evict(sub, reason, &mut report);
            }
        }

        if report.evicted() > 0 || report.probe_failures > 0 {
            info!(
                examined = report.examined,
                probed = report.probed,
                probe_failures = report.probe_failures,
                expired = report.expired.len(),
                unreachable = report.unreachable.len(),
                "subscription sweep finished"
            );
        } else {
            debug!(examined = report.examined, probed = report.probed, "subscription sweep finished");
        }
        report
    }

    fn check(&self, sub: &Subscription, now: Timestamp, report: &mut SweepReport) -> Option<EvictionReason> {
        if sub.never_expires {
            return None;
        }

        if sub.requires_renewal
            && now.saturating_since(sub.creation_time) > self.config.expiration_ttl
        {
            return Some(EvictionReason::Expired);
        }

        if now.saturating_since(sub.last_liveness_check) <= self.config.liveness_check_interval {
            return None;
        }

        report.probed += 1;
        let reachable = self.probe(sub);
        if !reachable {
            report.probe_failures += 1;
        }

        let failures = self.registry.record_probe(&sub.id, reachable, now)?;
        if reachable {
            debug!(subscription_id = %sub.id, "consumer reachable");
            return None;
        }

        debug!(
            subscription_id = %sub.id,
            consumer_address = %sub.consumer_address,
            unavailable_count = failures,
            "consumer unreachable"
        );
        (failures > self.config.max_unavailable_attempts).then_some(EvictionReason::Unreachable)
    }

    /// Probe one consumer. Errors and panics count as unreachable.
    fn probe(&self, sub: &Subscription) -> bool {
        let address = sub.consumer_address.as_str();
        match catch_unwind(AssertUnwindSafe(|| self.prober.is_reachable(address))) {
            Ok(Ok(reachable)) => reachable,
            Ok(Err(e)) => {
                warn!(
                    subscription_id = %sub.id,
                    consumer_address = address,
                    error = %e,
                    "liveness probe failed"
                );
                false
            }
            Err(panic) => {
                warn!(
                    subscription_id = %sub.id,
                    consumer_address = address,
                    panic = %panic_message(panic.as_ref()),
                    "liveness probe panicked"
                );
                false
            }
        }
    }

    /// Evict `seen` unless its state changed since the snapshot in a way
    /// that voids the reason: a renewal for expiry, a successful probe for
    /// unreachability.
    fn evict(&self, seen: &Subscription, reason: EvictionReason, report: &mut SweepReport) {
        let id = &seen.id;
        let max_failures = self.config.max_unavailable_attempts;
        let still_due = |current: &Subscription| match reason {
            EvictionReason::Expired => current.creation_time == seen.creation_time,
            EvictionReason::Unreachable => current.unavailable_count > max_failures,
        };

        match self.registry.unsubscribe_if(id, still_due) {
            Ok(Some(_)) => {
                info!(
                    subscription_id = %id,
                    consumer_address = %seen.consumer_address,
                    %reason,
                    "evicted subscription"
                );
                match reason {
                    EvictionReason::Expired => report.expired.push(id.clone()),
                    EvictionReason::Unreachable => report.unreachable.push(id.clone()),
                }
            }
            Ok(None) => {
                debug!(subscription_id = %id, %reason, "subscription changed before eviction; kept");
            }
            Err(RegistryError::NotFound(_)) => {
                debug!(subscription_id = %id, "subscription already removed before eviction");
            }
            Err(e) => {
                warn!(subscription_id = %id, error = %e, "failed to evict subscription");
            }
        }
    }

    /// Run sweeps on a background thread until the handle is shut down.
    pub fn spawn(self) -> Result<ReaperHandle> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let interval = self.config.sweep_interval;

        let join = thread::Builder::new()
            .name("subscription-reaper".into())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "subscription reaper started");
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.sweep())) {
                                error!(
                                    panic = %panic_message(panic.as_ref()),
                                    "subscription sweep panicked"
                                );
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("subscription reaper stopped");
            })?;

        Ok(ReaperHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Owns the reaper thread. Dropping it stops the thread.
pub struct ReaperHandle {
    shutdown: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Signal the reaper and wait for it to exit. Idempotent.
    ///
    /// A sweep in progress finishes first; the wait between sweeps is cut short.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.try_send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("subscription reaper thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::liveness::FnProber;
    use crate::notify::NotifierSet;
    use crate::storage::MemoryStore;
    use crate::subscriptions::SubscriptionDescriptor;
    use crate::types::{Clock, ManualClock};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const MINUTE: Duration = Duration::from_secs(60);

    fn registry(clock: Arc<ManualClock>, requires_renewal: bool) -> Arc<SubscriptionRegistry> {
        Arc::new(SubscriptionRegistry::with_clock(
            RegistryConfig {
                requires_renewal,
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
            NotifierSet::new(),
            clock,
        ))
    }

    #[test]
    fn test_fresh_subscription_not_probed() {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let registry = registry(clock.clone(), false);
        registry.subscribe(SubscriptionDescriptor::new("http://c/1")).unwrap();

        let probed = Arc::new(AtomicBool::new(false));
        let flag = probed.clone();
        let reaper = Reaper::new(
            registry,
            Arc::new(FnProber::new(move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(false)
            })),
            ReaperConfig::default(),
        );

        clock.advance(5 * MINUTE);
        let report = reaper.sweep();
        assert_eq!(report.examined, 1);
        assert_eq!(report.probed, 0);
        assert!(!probed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_probe_counts_as_failure() {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let registry = registry(clock.clone(), false);
        let id = registry.subscribe(SubscriptionDescriptor::new("http://c/1")).unwrap();

        let reaper = Reaper::new(
            registry.clone(),
            Arc::new(FnProber::new(|_| panic!("socket layer exploded"))),
            ReaperConfig::default(),
        );

        clock.advance(11 * MINUTE);
        let report = reaper.sweep();
        assert_eq!(report.probe_failures, 1);
        assert_eq!(registry.get(&id).unwrap().unavailable_count, 1);
    }

    #[test]
    fn test_never_expires_is_skipped() {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let registry = registry(clock.clone(), true);
        registry
            .subscribe(SubscriptionDescriptor::new("http://c/1").never_expiring())
            .unwrap();

        let reaper = Reaper::new(
            registry.clone(),
            Arc::new(FnProber::new(|_| Ok(false))),
            ReaperConfig::default(),
        );

        clock.advance(Duration::from_secs(24 * 60 * 60));
        for _ in 0..10 {
            let report = reaper.sweep();
            assert_eq!(report.probed, 0);
            assert_eq!(report.evicted(), 0);
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_spawned_reaper_shuts_down_promptly() {
        let registry = registry(Arc::new(ManualClock::default()), false);
        let reaper = Reaper::new(
            registry,
            Arc::new(FnProber::new(|_| Ok(true))),
            ReaperConfig {
                sweep_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );

        let mut handle = reaper.spawn().unwrap();
        assert!(handle.is_running());

        let started = std::time::Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!handle.is_running());

        // Second call is a no-op
        handle.shutdown();
    }

    #[test]
    fn test_renewal_after_snapshot_cancels_expiry() {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let registry = registry(clock.clone(), true);
        let descriptor = SubscriptionDescriptor::new("http://c/1").with_topic("t");
        let id = registry.subscribe(descriptor.clone()).unwrap();

        let reaper = Reaper::new(
            registry.clone(),
            Arc::new(FnProber::new(|_| Ok(true))),
            ReaperConfig {
                expiration_ttl: MINUTE,
                ..Default::default()
            },
        );

        clock.advance(2 * MINUTE);
        let stale = registry.get(&id).unwrap();
        registry.subscribe(descriptor).unwrap();

        let mut report = SweepReport::default();
        reaper.evict(&stale, EvictionReason::Expired, &mut report);
        assert_eq!(report.evicted(), 0);
        assert!(registry.get(&id).is_some());

        // The renewed entry expires on its own schedule
        clock.advance(2 * MINUTE);
        assert_eq!(reaper.sweep().expired, vec![id]);
    }

    #[test]
    fn test_recovered_probe_cancels_unreachable_eviction() {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let registry = registry(clock.clone(), false);
        let id = registry.subscribe(SubscriptionDescriptor::new("http://c/1")).unwrap();

        let reaper = Reaper::new(
            registry.clone(),
            Arc::new(FnProber::new(|_| Ok(true))),
            ReaperConfig {
                max_unavailable_attempts: 0,
                ..Default::default()
            },
        );

        registry.record_probe(&id, false, clock.now());
        let stale = registry.get(&id).unwrap();
        registry.record_probe(&id, true, clock.now());

        let mut report = SweepReport::default();
        reaper.evict(&stale, EvictionReason::Unreachable, &mut report);
        assert_eq!(report.evicted(), 0);
        assert!(registry.get(&id).is_some());
    }
}
