//! Subscription entity, normalized descriptor and identity predicate.

use crate::error::{RegistryError, Result};
use crate::types::{QualifiedName, SubscriptionId, SubscriptionKind, Timestamp};
use std::collections::BTreeMap;

/// Consumer reference parameters, keyed by qualified name.
pub type ReferenceParameters = BTreeMap<QualifiedName, String>;

/// A normalized subscribe request, as produced by a protocol layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionDescriptor {
    /// Where notifications are delivered; also what the reaper probes.
    pub consumer_address: String,

    /// Part of the subscription identity. `None` and `Some(empty)` differ.
    pub reference_parameters: Option<ReferenceParameters>,

    pub topic_filter: Option<String>,

    /// Query expression evaluated against payloads.
    pub content_filter: Option<String>,

    /// Skip all expiration and liveness checks.
    pub never_expires: bool,

    /// Original request payload, persisted verbatim.
    pub raw_request: Vec<u8>,
}

impl SubscriptionDescriptor {
    pub fn new(consumer_address: impl Into<String>) -> Self {
        Self {
            consumer_address: consumer_address.into(),
            reference_parameters: None,
            topic_filter: None,
            content_filter: None,
            never_expires: false,
            raw_request: Vec::new(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic_filter = Some(topic.into());
        self
    }

    pub fn with_content_filter(mut self, query: impl Into<String>) -> Self {
        self.content_filter = Some(query.into());
        self
    }

    /// Add one reference parameter, creating the map if needed.
    pub fn with_reference_parameter(mut self, name: QualifiedName, value: impl Into<String>) -> Self {
        self.reference_parameters
            .get_or_insert_with(BTreeMap::new)
            .insert(name, value.into());
        self
    }

    pub fn with_reference_parameters(mut self, params: ReferenceParameters) -> Self {
        self.reference_parameters = Some(params);
        self
    }

    pub fn never_expiring(mut self) -> Self {
        self.never_expires = true;
        self
    }

    pub fn with_raw_request(mut self, raw: impl Into<Vec<u8>>) -> Self {
        self.raw_request = raw.into();
        self
    }

    pub fn kind(&self) -> SubscriptionKind {
        kind_of(self.content_filter.as_deref())
    }

    pub fn identity(&self) -> SubscriptionIdentity<'_> {
        SubscriptionIdentity {
            topic_filter: self.topic_filter.as_deref(),
            content_filter: self.content_filter.as_deref(),
            consumer_address: &self.consumer_address,
            reference_parameters: self.reference_parameters.as_ref(),
        }
    }

    /// Reject descriptors no consumer could be reached through.
    pub fn validate(&self) -> Result<()> {
        if self.consumer_address.trim().is_empty() {
            return Err(RegistryError::InvalidDescriptor(
                "consumer address is empty".into(),
            ));
        }
        Ok(())
    }
}

/// One consumer registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub consumer_address: String,
    pub reference_parameters: Option<ReferenceParameters>,
    pub topic_filter: Option<String>,
    pub content_filter: Option<String>,
    /// Set at registration, refreshed on every renewal.
    pub creation_time: Timestamp,
    /// Last successful reachability probe (initially the creation time).
    pub last_liveness_check: Timestamp,
    /// Consecutive probe failures since the last success.
    pub unavailable_count: u32,
    pub never_expires: bool,
    pub paused: bool,
    /// Inherited from broker configuration at creation.
    pub requires_renewal: bool,
    pub raw_request: Vec<u8>,
}

impl Subscription {
    pub(crate) fn create(
        id: SubscriptionId,
        descriptor: &SubscriptionDescriptor,
        now: Timestamp,
        requires_renewal: bool,
    ) -> Self {
        Self {
            id,
            consumer_address: descriptor.consumer_address.clone(),
            reference_parameters: descriptor.reference_parameters.clone(),
            topic_filter: descriptor.topic_filter.clone(),
            content_filter: descriptor.content_filter.clone(),
            creation_time: now,
            last_liveness_check: now,
            unavailable_count: 0,
            never_expires: descriptor.never_expires,
            paused: false,
            requires_renewal,
            raw_request: descriptor.raw_request.clone(),
        }
    }

    pub fn kind(&self) -> SubscriptionKind {
        kind_of(self.content_filter.as_deref())
    }

    pub fn identity(&self) -> SubscriptionIdentity<'_> {
        SubscriptionIdentity {
            topic_filter: self.topic_filter.as_deref(),
            content_filter: self.content_filter.as_deref(),
            consumer_address: &self.consumer_address,
            reference_parameters: self.reference_parameters.as_ref(),
        }
    }

    /// Whether this entry and `descriptor` denote the same logical subscription.
    pub fn matches(&self, descriptor: &SubscriptionDescriptor) -> bool {
        self.identity() == descriptor.identity()
    }
}

fn kind_of(content_filter: Option<&str>) -> SubscriptionKind {
    match content_filter {
        Some(query) if !query.is_empty() => SubscriptionKind::Content,
        _ => SubscriptionKind::Topic,
    }
}

/// The identity-bearing fields of a subscription.
///
/// Two subscriptions are the same when topic, content filter and address
/// compare equal as strings (missing and empty being interchangeable) and
/// the reference-parameter maps hold the same keys with the same values.
/// A missing map only equals another missing map.
#[derive(Clone, Copy, Debug)]
pub struct SubscriptionIdentity<'a> {
    pub topic_filter: Option<&'a str>,
    pub content_filter: Option<&'a str>,
    pub consumer_address: &'a str,
    pub reference_parameters: Option<&'a ReferenceParameters>,
}

impl PartialEq for SubscriptionIdentity<'_> {
    fn eq(&self, other: &Self) -> bool {
        same_string(self.topic_filter, other.topic_filter)
            && same_string(self.content_filter, other.content_filter)
            && same_string(Some(self.consumer_address), Some(other.consumer_address))
            && equal_reference_parameters(self.reference_parameters, other.reference_parameters)
    }
}

impl Eq for SubscriptionIdentity<'_> {}

fn same_string(a: Option<&str>, b: Option<&str>) -> bool {
    a.unwrap_or("") == b.unwrap_or("")
}

fn equal_reference_parameters(
    a: Option<&ReferenceParameters>,
    b: Option<&ReferenceParameters>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a.len() == b.len() && a.iter().all(|(key, value)| b.get(key) == Some(value))
        }
        _ => false,
    }
}
