//! Subscription id generation.
//!
//! Ids look like `Tsub12@broker`: a kind prefix, `sub`, a process-local
//! counter, then `@` and the broker prefix. The generator lives inside the
//! registry's write-locked state, so it needs no synchronisation of its own.

use crate::types::{SubscriptionId, SubscriptionKind};

const COUNTER_TAG: &str = "sub";

#[derive(Debug)]
pub(crate) struct IdGenerator {
    broker_prefix: String,
    next: u64,
}

impl IdGenerator {
    pub(crate) fn new(broker_prefix: impl Into<String>) -> Self {
        Self {
            broker_prefix: broker_prefix.into(),
            next: 1,
        }
    }

    /// Allocate the next id. Counters are never handed out twice.
    pub(crate) fn next_id(&mut self, kind: SubscriptionKind) -> SubscriptionId {
        let counter = self.next;
        self.next += 1;
        SubscriptionId(format!(
            "{}{}{}@{}",
            kind.prefix(),
            COUNTER_TAG,
            counter,
            self.broker_prefix
        ))
    }

    /// Account for an id recovered from the durable log so that freshly
    /// generated ids never collide with it.
    pub(crate) fn observe(&mut self, id: &SubscriptionId) {
        if let Some(counter) = self.parse_counter(id) {
            self.next = self.next.max(counter.saturating_add(1));
        }
    }

    /// Counter value of an id in this generator's own format, if it is one.
    fn parse_counter(&self, id: &SubscriptionId) -> Option<u64> {
        let (local, broker) = id.as_str().rsplit_once('@')?;
        if broker != self.broker_prefix {
            return None;
        }

        let mut chars = local.chars();
        SubscriptionKind::from_prefix(chars.next()?)?;
        let digits = chars.as_str().strip_prefix(COUNTER_TAG)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let mut ids = IdGenerator::new("broker");
        assert_eq!(ids.next_id(SubscriptionKind::Topic).as_str(), "Tsub1@broker");
        assert_eq!(ids.next_id(SubscriptionKind::Content).as_str(), "Csub2@broker");
        assert_eq!(ids.next_id(SubscriptionKind::Topic).as_str(), "Tsub3@broker");
    }

    #[test]
    fn test_observe_seeds_counter() {
        let mut ids = IdGenerator::new("broker");
        ids.observe(&SubscriptionId::from("Csub41@broker"));
        ids.observe(&SubscriptionId::from("Tsub7@broker"));
        assert_eq!(ids.next_id(SubscriptionKind::Topic).as_str(), "Tsub42@broker");
    }

    #[test]
    fn test_observe_ignores_foreign_ids() {
        let mut ids = IdGenerator::new("broker");
        ids.observe(&SubscriptionId::from("Tsub99@other"));
        ids.observe(&SubscriptionId::from("urn:uuid:1234"));
        ids.observe(&SubscriptionId::from("Tsub@broker"));
        ids.observe(&SubscriptionId::from("Zsub50@broker"));
        ids.observe(&SubscriptionId::from("Tsub+5@broker"));
        assert_eq!(ids.next_id(SubscriptionKind::Topic).as_str(), "Tsub1@broker");
    }
}
