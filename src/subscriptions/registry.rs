//! The concurrent subscription registry.
//!
//! # Locking
//!
//! All state lives behind one `RwLock`:
//! - `subscribe`, `unsubscribe`, `pause`, `resume` and the reaper's probe
//!   bookkeeping take the write lock for their map mutation
//! - `snapshot_all`, `get` and `len` take the read lock just long enough to copy
//!
//! The create-or-renew scan and the store insert of a new subscription run
//! under the write lock, so two racing subscribes for the same logical
//! subscription produce one entry and one insert, and a subscription never
//! becomes visible before it is durable. Store deletes and notifier calls run
//! after the lock is released.

use crate::config::RegistryConfig;
use crate::descriptor::DescriptorBuilder;
use crate::error::{RegistryError, Result};
use crate::notify::NotifierSet;
use crate::storage::{StoredSubscription, SubscriptionStore};
use crate::types::{Clock, SubscriptionId, SystemClock, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::id::IdGenerator;
use super::types::{Subscription, SubscriptionDescriptor};

/// Where a subscribe request came from.
enum Origin {
    /// Live traffic: generate an id and persist the request.
    Live,
    /// Replayed from the durable log: reuse the id, already persisted.
    Recovered(SubscriptionId),
}

/// What a create-or-renew call did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Created,
    Renewed,
}

/// Result of replaying the durable log.
#[derive(Clone, Debug, Default)]
pub struct RecoveryReport {
    /// Entries that became live subscriptions.
    pub recovered: usize,
    /// Entries that matched an already-recovered subscription.
    pub renewed: Vec<SubscriptionId>,
    /// Entries that could not be rebuilt, with the reason.
    pub skipped: Vec<(SubscriptionId, String)>,
}

struct RegistryState {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    ids: IdGenerator,
}

impl RegistryState {
    fn find_matching_mut(&mut self, descriptor: &SubscriptionDescriptor) -> Option<&mut Subscription> {
        self.subscriptions
            .values_mut()
            .find(|sub| sub.matches(descriptor))
    }
}

/// Index of live subscriptions.
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
    store: Arc<dyn SubscriptionStore>,
    notifiers: NotifierSet,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

impl SubscriptionRegistry {
    /// Create an empty registry on the system clock.
    pub fn new(config: RegistryConfig, store: Arc<dyn SubscriptionStore>, notifiers: NotifierSet) -> Self {
        Self::with_clock(config, store, notifiers, Arc::new(SystemClock))
    }

    /// Create an empty registry with an explicit time source.
    pub fn with_clock(
        config: RegistryConfig,
        store: Arc<dyn SubscriptionStore>,
        notifiers: NotifierSet,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                subscriptions: HashMap::new(),
                ids: IdGenerator::new(config.broker_prefix.clone()),
            }),
            store,
            notifiers,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register a subscription, or renew the existing one with the same
    /// identity. Returns its id either way.
    pub fn subscribe(&self, descriptor: SubscriptionDescriptor) -> Result<SubscriptionId> {
        self.subscribe_with_outcome(descriptor).map(|(id, _)| id)
    }

    /// Like [`subscribe`](Self::subscribe), also reporting create vs. renew.
    pub fn subscribe_with_outcome(
        &self,
        descriptor: SubscriptionDescriptor,
    ) -> Result<(SubscriptionId, SubscribeOutcome)> {
        descriptor.validate()?;
        self.create_or_renew(descriptor, Origin::Live)
    }

    fn create_or_renew(
        &self,
        descriptor: SubscriptionDescriptor,
        origin: Origin,
    ) -> Result<(SubscriptionId, SubscribeOutcome)> {
        let now = self.clock.now();

        let id = {
            let mut state = self.state.write();

            if let Some(existing) = state.find_matching_mut(&descriptor) {
                existing.creation_time = now;
                debug!(
                    subscription_id = %existing.id,
                    consumer_address = %existing.consumer_address,
                    "renewed subscription"
                );
                return Ok((existing.id.clone(), SubscribeOutcome::Renewed));
            }

            let id = match origin {
                Origin::Live => {
                    let id = state.ids.next_id(descriptor.kind());
                    self.store
                        .insert(&id, &descriptor.raw_request)
                        .map_err(RegistryError::into_store)?;
                    id
                }
                Origin::Recovered(id) => {
                    if state.subscriptions.contains_key(&id) {
                        return Err(RegistryError::MalformedRecoveryEntry {
                            id,
                            reason: "id already in use by a different subscription".into(),
                        });
                    }
                    id
                }
            };

            let subscription =
                Subscription::create(id.clone(), &descriptor, now, self.config.requires_renewal);
            state.subscriptions.insert(id.clone(), subscription);
            id
        };

        info!(
            subscription_id = %id,
            consumer_address = %descriptor.consumer_address,
            "registered subscription"
        );
        self.notifiers.subscribed(&descriptor, &id);

        Ok((id, SubscribeOutcome::Created))
    }

    /// Remove a subscription, returning what was removed.
    ///
    /// A failing store delete is logged; the in-memory removal stands.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> Result<Subscription> {
        self.unsubscribe_if(id, |_| true)?
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    /// Remove a subscription only if `condition` holds for its current
    /// state, checked under the write lock.
    ///
    /// Returns `Ok(None)` when the subscription exists but the condition
    /// rejected it. Side effects match [`unsubscribe`](Self::unsubscribe).
    pub fn unsubscribe_if(
        &self,
        id: &SubscriptionId,
        condition: impl FnOnce(&Subscription) -> bool,
    ) -> Result<Option<Subscription>> {
        let removed = {
            let mut state = self.state.write();
            let current = state
                .subscriptions
                .get(id)
                .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
            if !condition(current) {
                return Ok(None);
            }
            state
                .subscriptions
                .remove(id)
                .ok_or_else(|| RegistryError::NotFound(id.clone()))?
        };

        if let Err(e) = self.store.delete(id) {
            warn!(
                subscription_id = %id,
                error = %e,
                "failed to delete subscription from store; entry may reappear on recovery"
            );
        }
        self.notifiers.unsubscribed(id);

        info!(
            subscription_id = %id,
            consumer_address = %removed.consumer_address,
            "removed subscription"
        );
        Ok(Some(removed))
    }

    /// Suspend delivery without removing the subscription.
    pub fn pause(&self, id: &SubscriptionId) -> Result<()> {
        self.set_paused(id, true)
    }

    /// Resume delivery.
    pub fn resume(&self, id: &SubscriptionId) -> Result<()> {
        self.set_paused(id, false)
    }

    fn set_paused(&self, id: &SubscriptionId, paused: bool) -> Result<()> {
        let mut state = self.state.write();
        let sub = state
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        sub.paused = paused;
        debug!(subscription_id = %id, paused, "updated pause state");
        Ok(())
    }

    /// Copy of every live subscription.
    pub fn snapshot_all(&self) -> HashMap<SubscriptionId, Subscription> {
        self.state.read().subscriptions.clone()
    }

    /// Copy of one subscription.
    pub fn get(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.state.read().subscriptions.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a liveness probe result.
    ///
    /// Success stamps `last_liveness_check` and clears the failure count;
    /// failure increments it. Returns the resulting count, or `None` if the
    /// subscription is gone.
    pub fn record_probe(&self, id: &SubscriptionId, reachable: bool, now: Timestamp) -> Option<u32> {
        let mut state = self.state.write();
        let sub = state.subscriptions.get_mut(id)?;
        if reachable {
            sub.last_liveness_check = now;
            sub.unavailable_count = 0;
        } else {
            sub.unavailable_count = sub.unavailable_count.saturating_add(1);
        }
        Some(sub.unavailable_count)
    }

    /// Rebuild the live set from the durable store.
    ///
    /// Call once at startup, before accepting traffic.
    pub fn recover_from_store(&self, builder: &dyn DescriptorBuilder) -> Result<RecoveryReport> {
        let entries = self.store.list_all().map_err(RegistryError::into_store)?;
        Ok(self.recover(entries, builder))
    }

    /// Replay persisted requests, keeping their ids.
    ///
    /// Entries that fail to rebuild are logged and skipped. Every persisted
    /// id, skipped or not, still counts toward seeding the id counter, since
    /// it stays in the store.
    pub fn recover(
        &self,
        entries: impl IntoIterator<Item = StoredSubscription>,
        builder: &dyn DescriptorBuilder,
    ) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        for entry in entries {
            self.state.write().ids.observe(&entry.id);

            let outcome = builder
                .build(&entry.raw_request)
                .map_err(|e| RegistryError::MalformedRecoveryEntry {
                    id: entry.id.clone(),
                    reason: e.to_string(),
                })
                .and_then(|descriptor| {
                    self.create_or_renew(descriptor, Origin::Recovered(entry.id.clone()))
                });

            match outcome {
                Ok((_, SubscribeOutcome::Created)) => report.recovered += 1,
                Ok((existing, SubscribeOutcome::Renewed)) => {
                    warn!(
                        subscription_id = %entry.id,
                        existing_id = %existing,
                        "persisted subscription duplicates a recovered one; treated as renewal"
                    );
                    report.renewed.push(entry.id);
                }
                Err(e) => {
                    warn!(subscription_id = %entry.id, error = %e, "skipping malformed recovery entry");
                    report.skipped.push((entry.id, e.to_string()));
                }
            }
        }

        info!(
            recovered = report.recovered,
            renewed = report.renewed.len(),
            skipped = report.skipped.len(),
            "recovered subscriptions from store"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::JsonDescriptorBuilder;
    use crate::storage::MemoryStore;
    use crate::types::ManualClock;
    use std::time::Duration;

    fn registry_with(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> SubscriptionRegistry {
        SubscriptionRegistry::with_clock(RegistryConfig::default(), store, NotifierSet::new(), clock)
    }

    fn orders() -> SubscriptionDescriptor {
        SubscriptionDescriptor::new("http://consumer.example/hook")
            .with_topic("orders.created")
            .with_raw_request(b"<subscribe/>".to_vec())
    }

    #[test]
    fn test_subscribe_renew_unsubscribe() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Timestamp(1_000)));
        let registry = registry_with(store.clone(), clock.clone());

        let (first, outcome) = registry.subscribe_with_outcome(orders()).unwrap();
        assert_eq!(first.as_str(), "Tsub1@broker");
        assert_eq!(outcome, SubscribeOutcome::Created);

        clock.advance(Duration::from_secs(30));
        let (second, outcome) = registry.subscribe_with_outcome(orders()).unwrap();
        assert_eq!(second, first);
        assert_eq!(outcome, SubscribeOutcome::Renewed);
        assert_eq!(store.len(), 1);
        assert_eq!(
            registry.get(&first).unwrap().creation_time,
            Timestamp(1_000).plus(Duration::from_secs(30))
        );

        registry.unsubscribe(&first).unwrap();
        assert!(store.is_empty());

        let third = registry.subscribe(orders()).unwrap();
        assert_eq!(third.as_str(), "Tsub2@broker");
    }

    #[test]
    fn test_content_filter_prefix() {
        let registry = registry_with(Arc::new(MemoryStore::new()), Arc::new(ManualClock::default()));
        let id = registry
            .subscribe(orders().with_content_filter("/order[total > 5]"))
            .unwrap();
        assert!(id.as_str().starts_with('C'));
    }

    #[test]
    fn test_pause_resume() {
        let registry = registry_with(Arc::new(MemoryStore::new()), Arc::new(ManualClock::default()));
        let id = registry.subscribe(orders()).unwrap();

        registry.pause(&id).unwrap();
        assert!(registry.get(&id).unwrap().paused);
        registry.resume(&id).unwrap();
        assert!(!registry.get(&id).unwrap().paused);

        let missing = SubscriptionId::from("Tsub99@broker");
        assert!(registry.pause(&missing).unwrap_err().is_not_found());
        assert!(registry.resume(&missing).unwrap_err().is_not_found());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = registry_with(Arc::new(MemoryStore::new()), Arc::new(ManualClock::default()));
        let id = registry.subscribe(orders()).unwrap();

        let mut snapshot = registry.snapshot_all();
        snapshot.get_mut(&id).unwrap().paused = true;
        snapshot.clear();

        assert_eq!(registry.len(), 1);
        assert!(!registry.get(&id).unwrap().paused);
    }

    #[test]
    fn test_record_probe() {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let registry = registry_with(Arc::new(MemoryStore::new()), clock);
        let id = registry.subscribe(orders()).unwrap();

        assert_eq!(registry.record_probe(&id, false, Timestamp(10)), Some(1));
        assert_eq!(registry.record_probe(&id, false, Timestamp(20)), Some(2));
        assert_eq!(registry.get(&id).unwrap().last_liveness_check, Timestamp(0));

        assert_eq!(registry.record_probe(&id, true, Timestamp(30)), Some(0));
        assert_eq!(registry.get(&id).unwrap().last_liveness_check, Timestamp(30));

        registry.unsubscribe(&id).unwrap();
        assert_eq!(registry.record_probe(&id, true, Timestamp(40)), None);
    }

    #[test]
    fn test_recovery_seeds_counter() {
        let store = Arc::new(MemoryStore::new());
        let request = JsonDescriptorBuilder::encode(SubscriptionDescriptor::new("http://c/1")).unwrap();
        store
            .insert(&SubscriptionId::from("Tsub17@broker"), &request.raw_request)
            .unwrap();

        let registry = registry_with(store.clone(), Arc::new(ManualClock::default()));
        let report = registry.recover_from_store(&JsonDescriptorBuilder).unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(store.len(), 1);

        let fresh = registry.subscribe(orders()).unwrap();
        assert_eq!(fresh.as_str(), "Tsub18@broker");
    }
}
