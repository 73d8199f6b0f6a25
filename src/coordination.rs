//! Thin layer over `EventStore`'s LISTEN/NOTIFY emulation (spec §4.5).
//!
//! Carries no state of its own beyond the naming convention for
//! per-agent channels; actual subscription bookkeeping lives in the
//! `EventStore` handle passed in, one per caller (an `AgentDriver`, a
//! `WaitEngine` call), exactly as the spec requires ("the bus has no
//! state beyond the set of subscriptions").

use crate::db::EventStore;
use crate::error::IkigaiResult;

const CHANNEL_PREFIX: &str = "agent_event_";

pub struct CoordinationBus<'a> {
    store: &'a EventStore,
}

impl<'a> CoordinationBus<'a> {
    pub fn new(store: &'a EventStore) -> Self {
        CoordinationBus { store }
    }

    pub fn channel_for(uuid: &str) -> String {
        format!("{CHANNEL_PREFIX}{uuid}")
    }

    pub fn uuid_from_channel(channel: &str) -> Option<&str> {
        channel.strip_prefix(CHANNEL_PREFIX)
    }

    pub fn subscribe(&self, uuid: &str) -> IkigaiResult<()> {
        self.store.listen(&Self::channel_for(uuid))
    }

    pub fn unsubscribe(&self, uuid: &str) -> IkigaiResult<()> {
        self.store.unlisten(&Self::channel_for(uuid))
    }

    /// Payload is one of the short tags: `"mail"`, `"dead"`, `"fork"`,
    /// `"idle"`.
    pub fn notify(&self, uuid: &str, payload: &str) -> IkigaiResult<()> {
        self.store.notify(&Self::channel_for(uuid), payload)
    }

    /// Drains pending notifications, delivering `(uuid, payload)` pairs
    /// rather than raw channel names.
    pub fn drain<F: FnMut(&str, &str)>(&self, mut callback: F) -> usize {
        self.store.drain_notifications(|channel, payload| {
            if let Some(uuid) = Self::uuid_from_channel(channel) {
                callback(uuid, payload);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_naming_round_trips() {
        let channel = CoordinationBus::channel_for("abc123");
        assert_eq!(channel, "agent_event_abc123");
        assert_eq!(CoordinationBus::uuid_from_channel(&channel), Some("abc123"));
    }

    #[test]
    fn subscribe_then_notify_is_drained_by_uuid() {
        let store = EventStore::open_in_memory().unwrap();
        let bus = CoordinationBus::new(&store);
        bus.subscribe("a").unwrap();
        bus.notify("a", "mail").unwrap();
        let mut seen = Vec::new();
        bus.drain(|uuid, payload| seen.push((uuid.to_string(), payload.to_string())));
        assert_eq!(seen, vec![("a".to_string(), "mail".to_string())]);
    }

    #[test]
    fn unsubscribed_channel_is_not_delivered() {
        let store = EventStore::open_in_memory().unwrap();
        let bus = CoordinationBus::new(&store);
        bus.subscribe("a").unwrap();
        bus.notify("b", "mail").unwrap();
        let mut seen = 0;
        bus.drain(|_, _| seen += 1);
        assert_eq!(seen, 0);
    }
}
