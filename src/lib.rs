//! # Subscription Registry
//!
//! Subscription bookkeeping for a publish/subscribe notification broker:
//! which subscriptions exist, for how long, and when they must go.
//!
//! ## Core Concepts
//!
//! - **Registry**: Concurrent index of live subscriptions with create-or-renew matching
//! - **Store**: Durable log of subscribe requests, replayed at startup
//! - **Reaper**: Background sweep evicting expired and unreachable consumers
//! - **Notifiers**: Hooks keeping external routing tables in sync
//!
//! ## Example
//!
//! ```ignore
//! use subscription_registry::*;
//!
//! let service = SubscriptionService::start(
//!     BrokerConfig::default(),
//!     Arc::new(SubscriptionLog::open("./subscriptions.log")?),
//!     Arc::new(FnProber::new(|address| Ok(ping(address)))),
//!     NotifierSet::new(),
//!     &JsonDescriptorBuilder,
//! )?;
//!
//! let id = service.subscribe(
//!     SubscriptionDescriptor::new("http://consumer.example/hook").with_topic("orders.created"),
//! )?;
//! service.pause(&id)?;
//! service.unsubscribe(&id)?;
//! service.shutdown();
//! ```

pub mod config;
pub mod descriptor;
pub mod error;
pub mod liveness;
pub mod notify;
pub mod service;
pub mod storage;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use config::{BrokerConfig, ReaperConfig, RegistryConfig};
pub use descriptor::{DescriptorBuilder, JsonDescriptorBuilder, JsonSubscribeRequest};
pub use error::{RegistryError, Result};
pub use liveness::{FnProber, LivenessProber};
pub use notify::{MatchNotifier, NotifierSet};
pub use service::SubscriptionService;
pub use storage::{MemoryStore, StoredSubscription, SubscriptionLog, SubscriptionStore};
pub use subscriptions::{
    EvictionReason, Reaper, ReaperHandle, RecoveryReport, ReferenceParameters, SubscribeOutcome,
    Subscription, SubscriptionDescriptor, SubscriptionIdentity, SubscriptionRegistry, SweepReport,
};
pub use types::*;
