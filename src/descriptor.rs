//! Turning raw subscribe requests into normalized descriptors.
//!
//! Wire dialects live outside this crate; each supplies a
//! [`DescriptorBuilder`]. Recovery replays persisted requests through the
//! same builder the live path uses. [`JsonDescriptorBuilder`] handles a
//! plain JSON request format.

use crate::error::{RegistryError, Result};
use crate::subscriptions::{ReferenceParameters, SubscriptionDescriptor};
use serde::{Deserialize, Serialize};

/// Builds a descriptor from a raw request payload.
pub trait DescriptorBuilder: Send + Sync {
    fn build(&self, raw_request: &[u8]) -> Result<SubscriptionDescriptor>;
}

/// JSON form of a subscribe request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonSubscribeRequest {
    pub consumer_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_parameters: Option<ReferenceParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_filter: Option<String>,
    #[serde(default)]
    pub never_expires: bool,
}

/// Descriptor builder for [`JsonSubscribeRequest`] payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonDescriptorBuilder;

impl JsonDescriptorBuilder {
    /// Encode a descriptor as a JSON request and attach it as the raw request.
    pub fn encode(descriptor: SubscriptionDescriptor) -> Result<SubscriptionDescriptor> {
        let request = JsonSubscribeRequest {
            consumer_address: descriptor.consumer_address.clone(),
            reference_parameters: descriptor.reference_parameters.clone(),
            topic: descriptor.topic_filter.clone(),
            content_filter: descriptor.content_filter.clone(),
            never_expires: descriptor.never_expires,
        };
        let raw = serde_json::to_vec(&request)?;
        Ok(descriptor.with_raw_request(raw))
    }
}

impl DescriptorBuilder for JsonDescriptorBuilder {
    fn build(&self, raw_request: &[u8]) -> Result<SubscriptionDescriptor> {
        let request: JsonSubscribeRequest = serde_json::from_slice(raw_request)
            .map_err(|e| RegistryError::InvalidDescriptor(e.to_string()))?;

        let descriptor = SubscriptionDescriptor {
            consumer_address: request.consumer_address,
            reference_parameters: request.reference_parameters,
            topic_filter: request.topic,
            content_filter: request.content_filter,
            never_expires: request.never_expires,
            raw_request: raw_request.to_vec(),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QualifiedName;

    #[test]
    fn test_build_from_json() {
        let raw = br#"{
            "consumer_address": "http://consumer.example/hook",
            "reference_parameters": {"{urn:example}clientId": "42"},
            "content_filter": "/order[total > 100]",
            "never_expires": true
        }"#;

        let descriptor = JsonDescriptorBuilder.build(raw).unwrap();
        assert_eq!(descriptor.consumer_address, "http://consumer.example/hook");
        assert_eq!(descriptor.topic_filter, None);
        assert!(descriptor.never_expires);
        assert_eq!(
            descriptor
                .reference_parameters
                .as_ref()
                .unwrap()
                .get(&QualifiedName::new("urn:example", "clientId"))
                .map(String::as_str),
            Some("42")
        );
        assert_eq!(descriptor.raw_request, raw.to_vec());
    }

    #[test]
    fn test_encode_then_build_keeps_identity() {
        let original = SubscriptionDescriptor::new("http://c/1")
            .with_topic("orders.created")
            .with_reference_parameter(QualifiedName::local("token"), "abc");

        let encoded = JsonDescriptorBuilder::encode(original.clone()).unwrap();
        let rebuilt = JsonDescriptorBuilder.build(&encoded.raw_request).unwrap();
        assert_eq!(rebuilt.identity(), original.identity());
    }

    #[test]
    fn test_malformed_requests_rejected() {
        let cases: [&[u8]; 4] = [
            b"not json",
            br#"{"topic": "t"}"#,
            br#"{"consumer_address": ""}"#,
            br#"{"consumer_address": "http://c", "reference_parameters": {"{broken": "x"}}"#,
        ];
        for raw in cases {
            let result = JsonDescriptorBuilder.build(raw);
            assert!(
                matches!(result, Err(RegistryError::InvalidDescriptor(_))),
                "expected rejection of {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }
}
