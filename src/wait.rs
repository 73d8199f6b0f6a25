//! Blocking wait primitives: next-message and fan-in (spec §4.6).
//!
//! Both modes poll every 50 ms so interrupt and deadline are observed
//! even when the notify path is unavailable (spec §9, "blocking wait ↔
//! cooperative loop"). The only real blocking call is
//! `EventStore::block_until_notified`, which races a single notification
//! against a timeout — the async equivalent of the reference's `select`
//! on the store socket.

use crate::agent::AgentRegistry;
use crate::coordination::CoordinationBus;
use crate::db::EventStore;
use crate::mailbox::Mailbox;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const POLL_GRANULARITY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextMessageResult {
    Delivered { from: String, body: String },
    Timeout,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanInStatus {
    Running,
    Dead,
    Idle,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanInEntry {
    pub uuid: String,
    pub name: String,
    pub status: FanInStatus,
    pub message: Option<String>,
}

pub struct WaitEngine;

impl WaitEngine {
    pub async fn next_message(
        store: &EventStore,
        session_id: i64,
        my_uuid: &str,
        timeout_sec: f64,
        interrupted: &AtomicBool,
    ) -> NextMessageResult {
        let bus = CoordinationBus::new(store);
        let mailbox = Mailbox::new(store);
        let _ = bus.subscribe(my_uuid);

        let result = Self::run_next_message(
            store, &bus, &mailbox, session_id, my_uuid, timeout_sec, interrupted,
        )
        .await;

        let _ = bus.unsubscribe(my_uuid);
        result
    }

    async fn run_next_message(
        store: &EventStore,
        bus: &CoordinationBus<'_>,
        mailbox: &Mailbox<'_>,
        session_id: i64,
        my_uuid: &str,
        timeout_sec: f64,
        interrupted: &AtomicBool,
    ) -> NextMessageResult {
        if let Some(delivered) = pop_oldest_unread(mailbox, session_id, my_uuid, None) {
            return NextMessageResult::Delivered {
                from: delivered.0,
                body: delivered.1,
            };
        }

        let deadline = Instant::now() + Duration::from_secs_f64(timeout_sec.max(0.0));
        loop {
            if interrupted.load(Ordering::SeqCst) {
                return NextMessageResult::Interrupted;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return NextMessageResult::Timeout;
            }
            let chunk = remaining.min(POLL_GRANULARITY);
            store.block_until_notified(chunk).await;
            bus.drain(|_, _| {});
            if let Some(delivered) = pop_oldest_unread(mailbox, session_id, my_uuid, None) {
                return NextMessageResult::Delivered {
                    from: delivered.0,
                    body: delivered.1,
                };
            }
        }
    }

    pub async fn fan_in(
        store: &EventStore,
        registry: &AgentRegistry,
        session_id: i64,
        my_uuid: &str,
        timeout_sec: f64,
        targets: &[String],
        interrupted: &AtomicBool,
    ) -> Vec<FanInEntry> {
        let bus = CoordinationBus::new(store);
        let mailbox = Mailbox::new(store);
        let _ = bus.subscribe(my_uuid);
        for target in targets {
            let _ = bus.subscribe(target);
        }

        let mut entries: Vec<FanInEntry> = targets
            .iter()
            .map(|uuid| FanInEntry {
                uuid: uuid.clone(),
                name: registry
                    .get(uuid)
                    .and_then(|a| a.name.clone())
                    .unwrap_or_else(|| "undefined".to_string()),
                status: FanInStatus::Running,
                message: None,
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs_f64(timeout_sec.max(0.0));
        loop {
            update_fan_in_entries(&mailbox, registry, session_id, my_uuid, &mut entries);
            let all_resolved = entries.iter().all(|e| e.status != FanInStatus::Running);
            if all_resolved {
                break;
            }
            if interrupted.load(Ordering::SeqCst) {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let chunk = remaining.min(POLL_GRANULARITY);
            store.block_until_notified(chunk).await;
            bus.drain(|_, _| {});
        }

        let _ = bus.unsubscribe(my_uuid);
        for target in targets {
            let _ = bus.unsubscribe(target);
        }
        entries
    }
}

fn pop_oldest_unread(
    mailbox: &Mailbox<'_>,
    session_id: i64,
    recipient: &str,
    from_filter: Option<&str>,
) -> Option<(String, String)> {
    let inbox = match from_filter {
        Some(from) => mailbox.inbox_filtered(session_id, recipient, from),
        None => mailbox.inbox(session_id, recipient),
    }
    .ok()?;
    let mut unread: Vec<_> = inbox.into_iter().filter(|m| !m.read).collect();
    unread.sort_by_key(|m| m.timestamp);
    let oldest = unread.into_iter().next()?;
    let _ = mailbox.delete(oldest.id, recipient);
    Some((oldest.from_uuid, oldest.body))
}

fn update_fan_in_entries(
    mailbox: &Mailbox<'_>,
    registry: &AgentRegistry,
    session_id: i64,
    my_uuid: &str,
    entries: &mut [FanInEntry],
) {
    for entry in entries.iter_mut() {
        if entry.status != FanInStatus::Running {
            continue;
        }
        if let Some((_, body)) = pop_oldest_unread(mailbox, session_id, my_uuid, Some(&entry.uuid)) {
            entry.status = FanInStatus::Received;
            entry.message = Some(body);
            continue;
        }
        match registry.get(&entry.uuid) {
            None => {
                entry.status = FanInStatus::Dead;
            }
            Some(agent) => {
                if !agent.is_running() {
                    entry.status = FanInStatus::Dead;
                } else if agent.idle {
                    entry.status = FanInStatus::Idle;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use chrono::Utc;

    fn setup() -> (EventStore, AgentRegistry, i64) {
        let store = EventStore::open_in_memory().unwrap();
        let session_id = store.create_session().unwrap();
        let mut registry = AgentRegistry::new();
        let seq = registry.next_seq();
        registry.insert(Agent::new_root("a".to_string(), Utc::now(), seq));
        let seq = registry.next_seq();
        registry.insert(Agent::new_child("b".to_string(), "a".to_string(), 1, Utc::now(), seq));
        (store, registry, session_id)
    }

    #[tokio::test]
    async fn scenario_3_delivered_within_one_iteration() {
        let (store, registry, session_id) = setup();
        let interrupted = AtomicBool::new(false);
        let mailbox = Mailbox::new(&store);
        mailbox.send(&registry, session_id, "b", "a", "hello").unwrap();
        let result = WaitEngine::next_message(&store, session_id, "a", 2.0, &interrupted).await;
        assert_eq!(
            result,
            NextMessageResult::Delivered {
                from: "b".to_string(),
                body: "hello".to_string(),
            }
        );
        assert!(mailbox.inbox(session_id, "a").unwrap().is_empty());
    }

    #[tokio::test]
    async fn timeout_returns_within_budget_plus_poll_granularity() {
        let (store, _registry, session_id) = setup();
        let interrupted = AtomicBool::new(false);
        let start = Instant::now();
        let result = WaitEngine::next_message(&store, session_id, "a", 0.1, &interrupted).await;
        assert_eq!(result, NextMessageResult::Timeout);
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn interrupted_flag_short_circuits() {
        let (store, _registry, session_id) = setup();
        let interrupted = AtomicBool::new(true);
        let result = WaitEngine::next_message(&store, session_id, "a", 5.0, &interrupted).await;
        assert_eq!(result, NextMessageResult::Interrupted);
    }

    #[tokio::test]
    async fn scenario_4_fan_in_mixed_outcomes() {
        let (store, mut registry, session_id) = setup();
        registry.insert(Agent::new_child(
            "c".to_string(),
            "a".to_string(),
            1,
            Utc::now(),
            registry.next_seq(),
        ));
        registry.insert(Agent::new_child(
            "d".to_string(),
            "a".to_string(),
            1,
            Utc::now(),
            registry.next_seq(),
        ));
        let mailbox = Mailbox::new(&store);
        mailbox.send(&registry, session_id, "b", "a", "done").unwrap();
        registry.get_mut("c").unwrap().status = crate::agent::AgentStatus::Dead;

        let interrupted = AtomicBool::new(false);
        let targets = vec!["b".to_string(), "c".to_string(), "d".to_string()];
        let entries =
            WaitEngine::fan_in(&store, &registry, session_id, "a", 0.1, &targets, &interrupted)
                .await;

        assert_eq!(entries[0].status, FanInStatus::Received);
        assert_eq!(entries[0].message.as_deref(), Some("done"));
        assert_eq!(entries[1].status, FanInStatus::Dead);
        assert_eq!(entries[2].status, FanInStatus::Running);
    }
}
