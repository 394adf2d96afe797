//! Hooks that keep external routing tables in step with the registry.

use crate::error::Result;
use crate::subscriptions::SubscriptionDescriptor;
use crate::types::SubscriptionId;
use std::sync::Arc;
use tracing::warn;

/// Told about every subscription that is created or removed.
///
/// Renewals are not reported.
pub trait MatchNotifier: Send + Sync {
    fn on_subscribe(&self, descriptor: &SubscriptionDescriptor, id: &SubscriptionId) -> Result<()>;

    fn on_unsubscribe(&self, id: &SubscriptionId) -> Result<()>;
}

/// Ordered set of notifiers, invoked best-effort.
///
/// A failing notifier is logged and skipped; the rest still run.
#[derive(Clone, Default)]
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn MatchNotifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, notifier: Arc<dyn MatchNotifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    pub(crate) fn subscribed(&self, descriptor: &SubscriptionDescriptor, id: &SubscriptionId) {
        for (index, notifier) in self.notifiers.iter().enumerate() {
            if let Err(e) = notifier.on_subscribe(descriptor, id) {
                warn!(
                    subscription_id = %id,
                    notifier = index,
                    error = %e,
                    "match notifier rejected subscribe"
                );
            }
        }
    }

    pub(crate) fn unsubscribed(&self, id: &SubscriptionId) {
        for (index, notifier) in self.notifiers.iter().enumerate() {
            if let Err(e) = notifier.on_unsubscribe(id) {
                warn!(
                    subscription_id = %id,
                    notifier = index,
                    error = %e,
                    "match notifier rejected unsubscribe"
                );
            }
        }
    }
}

impl FromIterator<Arc<dyn MatchNotifier>> for NotifierSet {
    fn from_iter<I: IntoIterator<Item = Arc<dyn MatchNotifier>>>(iter: I) -> Self {
        Self {
            notifiers: iter.into_iter().collect(),
        }
    }
}
