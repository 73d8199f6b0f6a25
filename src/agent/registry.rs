//! In-memory set of live agents keyed by UUID, plus the current-agent
//! pointer (spec §4.3).

use super::{Agent, AgentStatus};
use crate::error::{IkigaiError, IkigaiResult};
use std::collections::{BTreeMap, HashMap};

/// Owns every live `Agent`. Agents are indexed by UUID for lookup and by
/// a creation sequence number for deterministic ordering (insertion
/// order), mirroring the arena-by-UUID design SPEC_FULL.md §9 calls for
/// to break the reference's parent-pointer cycles.
pub struct AgentRegistry {
    agents: HashMap<String, Agent>,
    sequence: BTreeMap<u64, String>,
    next_seq: u64,
    current: Option<String>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        AgentRegistry {
            agents: HashMap::new(),
            sequence: BTreeMap::new(),
            next_seq: 0,
            current: None,
        }
    }

    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Inserts an agent that already carries its creation sequence
    /// (assigned via `next_seq` before construction).
    pub fn insert(&mut self, agent: Agent) {
        self.sequence.insert(agent.created_seq, agent.uuid.clone());
        self.agents.insert(agent.uuid.clone(), agent);
    }

    pub fn get(&self, uuid: &str) -> Option<&Agent> {
        self.agents.get(uuid)
    }

    pub fn get_mut(&mut self, uuid: &str) -> Option<&mut Agent> {
        self.agents.get_mut(uuid)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn current(&self) -> Option<&Agent> {
        self.current.as_deref().and_then(|u| self.agents.get(u))
    }

    pub fn current_uuid(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Exact match first; otherwise the unique prefix match, else none.
    pub fn find(&self, uuid_or_prefix: &str) -> Option<&Agent> {
        if let Some(agent) = self.agents.get(uuid_or_prefix) {
            return Some(agent);
        }
        let mut matches = self
            .agents
            .values()
            .filter(|a| a.uuid.starts_with(uuid_or_prefix));
        let first = matches.next()?;
        if matches.next().is_some() {
            None
        } else {
            Some(first)
        }
    }

    pub fn is_ambiguous(&self, prefix: &str) -> bool {
        self.agents
            .values()
            .filter(|a| a.uuid.starts_with(prefix))
            .count()
            >= 2
    }

    pub fn switch_current(&mut self, uuid: &str) -> IkigaiResult<()> {
        let agent = self
            .agents
            .get(uuid)
            .ok_or_else(|| IkigaiError::not_found(format!("agent {uuid}")))?;
        if !agent.is_running() {
            return Err(IkigaiError::invalid_arg(
                "cannot switch current to a non-running agent",
            ));
        }
        self.current = Some(uuid.to_string());
        Ok(())
    }

    /// Removes an agent from the in-memory set. The caller is responsible
    /// for having already transitioned it to a terminal status.
    pub fn remove(&mut self, uuid: &str) -> Option<Agent> {
        let agent = self.agents.remove(uuid)?;
        debug_assert!(
            agent.status != AgentStatus::Running,
            "removed agent {uuid} was still running"
        );
        self.sequence.remove(&agent.created_seq);
        if self.current.as_deref() == Some(uuid) {
            self.current = None;
        }
        Some(agent)
    }

    /// Direct children only, in creation order.
    pub fn children_of(&self, uuid: &str) -> Vec<&Agent> {
        let mut children: Vec<&Agent> = self
            .agents
            .values()
            .filter(|a| a.parent_uuid.as_deref() == Some(uuid))
            .collect();
        children.sort_by_key(|a| a.created_seq);
        children
    }

    /// Transitive descendants in depth-first post-order: every
    /// descendant of a child is enumerated before that child, and every
    /// child is enumerated before `uuid` itself (which is not included).
    pub fn descendants(&self, uuid: &str) -> Vec<&Agent> {
        let mut out = Vec::new();
        self.collect_descendants(uuid, &mut out);
        out
    }

    fn collect_descendants<'a>(&'a self, uuid: &str, out: &mut Vec<&'a Agent>) {
        for child in self.children_of(uuid) {
            self.collect_descendants(&child.uuid, out);
            out.push(child);
        }
    }

    /// The lowest-creation-sequence `running` agent, used by reap to pick
    /// a fallback current agent (SPEC_FULL.md §C, `commands_reap.c`).
    pub fn first_running(&self) -> Option<&str> {
        self.sequence
            .values()
            .filter_map(|uuid| self.agents.get(uuid))
            .find(|a| a.is_running())
            .map(|a| a.uuid.as_str())
    }

    pub fn root(&self) -> Option<&Agent> {
        self.agents.values().find(|a| a.parent_uuid.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn running_child(registry: &mut AgentRegistry, uuid: &str, parent: &str) {
        let seq = registry.next_seq();
        registry.insert(Agent::new_child(
            uuid.to_string(),
            parent.to_string(),
            0,
            Utc::now(),
            seq,
        ));
    }

    fn new_registry_with_root() -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        let seq = registry.next_seq();
        registry.insert(Agent::new_root("root".to_string(), Utc::now(), seq));
        registry.switch_current("root").unwrap();
        registry
    }

    #[test]
    fn find_exact_and_unique_prefix() {
        let mut registry = new_registry_with_root();
        running_child(&mut registry, "abcdef", "root");
        assert!(registry.find("root").is_some());
        assert!(registry.find("abc").is_some());
        assert!(registry.find("zzz").is_none());
    }

    #[test]
    fn ambiguous_prefix_returns_none_and_reports_ambiguous() {
        let mut registry = new_registry_with_root();
        running_child(&mut registry, "ab11", "root");
        running_child(&mut registry, "ab22", "root");
        assert!(registry.find("ab").is_none());
        assert!(registry.is_ambiguous("ab"));
    }

    #[test]
    fn switch_current_rejects_non_running() {
        let mut registry = new_registry_with_root();
        running_child(&mut registry, "child", "root");
        registry.get_mut("child").unwrap().status = AgentStatus::Dead;
        assert!(registry.switch_current("child").is_err());
    }

    #[test]
    fn descendants_are_depth_first_post_order() {
        let mut registry = new_registry_with_root();
        running_child(&mut registry, "a", "root");
        running_child(&mut registry, "b", "a");
        running_child(&mut registry, "c", "b");
        let names: Vec<&str> = registry
            .descendants("a")
            .into_iter()
            .map(|a| a.uuid.as_str())
            .collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn first_running_prefers_creation_order() {
        let mut registry = new_registry_with_root();
        running_child(&mut registry, "a", "root");
        running_child(&mut registry, "b", "root");
        registry.get_mut("root").unwrap().status = AgentStatus::Dead;
        assert_eq!(registry.first_running(), Some("a"));
    }
}
