//! Service facade tying the registry, recovery and the reaper together.

use crate::config::BrokerConfig;
use crate::descriptor::DescriptorBuilder;
use crate::error::Result;
use crate::liveness::LivenessProber;
use crate::notify::NotifierSet;
use crate::storage::SubscriptionStore;
use crate::subscriptions::{
    Reaper, ReaperHandle, RecoveryReport, Subscription, SubscriptionDescriptor,
    SubscriptionRegistry, SweepReport,
};
use crate::types::{Clock, SubscriptionId, SystemClock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// The subscription side of a broker.
///
/// `start` replays the durable store before returning, so the service never
/// sees live traffic ahead of recovery.
pub struct SubscriptionService {
    config: BrokerConfig,
    registry: Arc<SubscriptionRegistry>,
    reaper: Reaper,
    reaper_handle: Mutex<Option<ReaperHandle>>,
    recovery: RecoveryReport,
}

impl SubscriptionService {
    /// Build, recover and (if configured) start auto-cleaning.
    pub fn start(
        config: BrokerConfig,
        store: Arc<dyn SubscriptionStore>,
        prober: Arc<dyn LivenessProber>,
        notifiers: NotifierSet,
        builder: &dyn DescriptorBuilder,
    ) -> Result<Self> {
        Self::start_with_clock(config, store, prober, notifiers, builder, Arc::new(SystemClock))
    }

    /// As [`start`](Self::start), with an explicit time source.
    pub fn start_with_clock(
        config: BrokerConfig,
        store: Arc<dyn SubscriptionStore>,
        prober: Arc<dyn LivenessProber>,
        notifiers: NotifierSet,
        builder: &dyn DescriptorBuilder,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(SubscriptionRegistry::with_clock(
            config.registry(),
            store,
            notifiers,
            clock,
        ));
        let recovery = registry.recover_from_store(builder)?;

        let reaper = Reaper::new(Arc::clone(&registry), Arc::clone(&prober), config.reaper());
        let reaper_handle = if config.auto_clean_enabled {
            Some(Reaper::new(Arc::clone(&registry), prober, config.reaper()).spawn()?)
        } else {
            None
        };

        info!(
            broker_prefix = %config.broker_prefix,
            subscriptions = registry.len(),
            auto_clean = config.auto_clean_enabled,
            "subscription service started"
        );

        Ok(Self {
            config,
            registry,
            reaper,
            reaper_handle: Mutex::new(reaper_handle),
            recovery,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// What startup recovery did.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn subscribe(&self, descriptor: SubscriptionDescriptor) -> Result<SubscriptionId> {
        self.registry.subscribe(descriptor)
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        self.registry.unsubscribe(id).map(|_| ())
    }

    pub fn pause(&self, id: &SubscriptionId) -> Result<()> {
        self.registry.pause(id)
    }

    pub fn resume(&self, id: &SubscriptionId) -> Result<()> {
        self.registry.resume(id)
    }

    pub fn snapshot_all(&self) -> HashMap<SubscriptionId, Subscription> {
        self.registry.snapshot_all()
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.registry.get(id)
    }

    /// Run one sweep on the calling thread, independent of the background reaper.
    pub fn sweep_now(&self) -> SweepReport {
        self.reaper.sweep()
    }

    /// Whether the background reaper is running.
    pub fn is_auto_cleaning(&self) -> bool {
        self.reaper_handle
            .lock()
            .as_ref()
            .is_some_and(ReaperHandle::is_running)
    }

    /// Stop the background reaper. Idempotent.
    pub fn shutdown(&self) {
        if let Some(mut handle) = self.reaper_handle.lock().take() {
            handle.shutdown();
            info!("subscription service stopped");
        }
    }
}

impl Drop for SubscriptionService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
