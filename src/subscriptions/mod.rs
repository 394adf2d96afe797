//! Subscription registry and lifecycle management.
//!
//! This module holds the core bookkeeping of the broker:
//! - Which subscriptions exist, keyed by broker-assigned id
//! - Create-or-renew matching on subscription identity
//! - Replay of persisted requests at startup
//! - Background eviction of expired or unreachable consumers
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(SubscriptionRegistry::new(
//!     BrokerConfig::default().registry(),
//!     Arc::new(MemoryStore::new()),
//!     NotifierSet::new(),
//! ));
//!
//! let id = registry.subscribe(
//!     SubscriptionDescriptor::new("http://consumer.example/hook").with_topic("orders.created"),
//! )?;
//!
//! // Same identity renews rather than duplicates
//! assert_eq!(id, registry.subscribe(
//!     SubscriptionDescriptor::new("http://consumer.example/hook").with_topic("orders.created"),
//! )?);
//!
//! let handle = Reaper::new(registry.clone(), prober, BrokerConfig::default().reaper()).spawn()?;
//! ```

mod id;
mod reaper;
mod registry;
mod types;

pub use reaper::{EvictionReason, Reaper, ReaperHandle, SweepReport};
pub use registry::{RecoveryReport, SubscribeOutcome, SubscriptionRegistry};
pub use types::{ReferenceParameters, Subscription, SubscriptionDescriptor, SubscriptionIdentity};
