//! Persistent per-recipient mail delivery (spec §4.4).

use crate::agent::AgentRegistry;
use crate::db::{EventStore, Mail};
use crate::error::{IkigaiError, IkigaiResult};

pub struct Mailbox<'a> {
    store: &'a EventStore,
}

impl<'a> Mailbox<'a> {
    pub fn new(store: &'a EventStore) -> Self {
        Mailbox { store }
    }

    /// Recipient must exist and be `running`; on success appends a mail
    /// row and notifies `agent_event_<to>` with payload `"mail"`
    /// (best-effort — skipped/deferred inside a transaction).
    pub fn send(
        &self,
        registry: &AgentRegistry,
        session_id: i64,
        from: &str,
        to: &str,
        body: &str,
    ) -> IkigaiResult<i64> {
        match registry.get(to) {
            None => {
                return Err(IkigaiError::invalid_arg(format!(
                    "Recipient agent {to} not found"
                )))
            }
            Some(agent) if !agent.is_running() => {
                return Err(IkigaiError::invalid_arg("Recipient agent is dead"))
            }
            Some(_) => {}
        }
        let id = self.store.insert_mail(session_id, from, to, body)?;
        self.store.notify(&format!("agent_event_{to}"), "mail")?;
        Ok(id)
    }

    pub fn inbox(&self, session_id: i64, recipient: &str) -> IkigaiResult<Vec<Mail>> {
        self.store.query_mail_inbox(session_id, recipient, None)
    }

    pub fn inbox_filtered(
        &self,
        session_id: i64,
        recipient: &str,
        sender: &str,
    ) -> IkigaiResult<Vec<Mail>> {
        self.store
            .query_mail_inbox(session_id, recipient, Some(sender))
    }

    pub fn mark_read(&self, id: i64) -> IkigaiResult<()> {
        self.store.mark_mail_read(id)
    }

    /// Succeeds only when the row exists and belongs to `recipient`.
    pub fn delete(&self, id: i64, recipient: &str) -> IkigaiResult<()> {
        if self.store.delete_mail(id, recipient)? {
            Ok(())
        } else {
            Err(IkigaiError::not_found(format!("mail {id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::db::EventStore;
    use chrono::Utc;

    fn setup() -> (EventStore, AgentRegistry, i64) {
        let store = EventStore::open_in_memory().unwrap();
        let session_id = store.create_session().unwrap();
        let mut registry = AgentRegistry::new();
        let seq = registry.next_seq();
        registry.insert(Agent::new_root("root".to_string(), Utc::now(), seq));
        let seq = registry.next_seq();
        registry.insert(Agent::new_child(
            "alice".to_string(),
            "root".to_string(),
            1,
            Utc::now(),
            seq,
        ));
        (store, registry, session_id)
    }

    #[test]
    fn send_then_inbox_round_trip() {
        let (store, registry, session_id) = setup();
        let mailbox = Mailbox::new(&store);
        mailbox
            .send(&registry, session_id, "root", "alice", "hello")
            .unwrap();
        let inbox = mailbox.inbox(session_id, "alice").unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].body, "hello");
        assert!(!inbox[0].read);
    }

    #[test]
    fn send_to_dead_recipient_fails_and_appends_nothing() {
        let (store, mut registry, session_id) = setup();
        registry.get_mut("alice").unwrap().status = crate::agent::AgentStatus::Dead;
        let mailbox = Mailbox::new(&store);
        let result = mailbox.send(&registry, session_id, "root", "alice", "x");
        assert!(result.is_err());
        assert_eq!(mailbox.inbox(session_id, "alice").unwrap().len(), 0);
    }

    #[test]
    fn inbox_orders_unread_before_read_then_newest_first() {
        let (store, registry, session_id) = setup();
        let mailbox = Mailbox::new(&store);
        let a = mailbox
            .send(&registry, session_id, "root", "alice", "first")
            .unwrap();
        mailbox
            .send(&registry, session_id, "root", "alice", "second")
            .unwrap();
        mailbox.mark_read(a).unwrap();
        let inbox = mailbox.inbox(session_id, "alice").unwrap();
        assert_eq!(inbox[0].body, "second");
        assert_eq!(inbox[1].body, "first");
    }

    #[test]
    fn delete_requires_matching_recipient() {
        let (store, registry, session_id) = setup();
        let mailbox = Mailbox::new(&store);
        let id = mailbox
            .send(&registry, session_id, "root", "alice", "x")
            .unwrap();
        assert!(mailbox.delete(id, "root").is_err());
        assert!(mailbox.delete(id, "alice").is_ok());
    }
}
