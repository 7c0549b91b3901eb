//! Per-turn session state: two nested containers (work unit → shared
//! state + per-agent state) so agents of one work unit share the pack,
//! plan and progress without leaking token accounting between each other.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::context_pack::ContextPack;
use warden_protocol::EventKind;
use warden_protocol::EventRecord;
use warden_protocol::PlanDocument;
use warden_protocol::PlanNodeKind;
use warden_protocol::ProgressSummary;
use warden_protocol::SessionState;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkKey {
    pub run_session_id: String,
    pub work_id: String,
}

impl WorkKey {
    /// Key format shared with the collision guard table.
    pub fn guard_key(&self) -> String {
        format!("{}:{}", self.run_session_id, self.work_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Completed,
    Failed,
}

/// State shared by every agent of the work unit.
#[derive(Debug, Default)]
pub struct SharedState {
    pub state: Option<SessionState>,
    pub original_prompt: Option<String>,
    pub pack: Option<ContextPack>,
    pub plan: Option<PlanDocument>,
    pub node_status: BTreeMap<String, NodeStatus>,
    /// Commit gates approved by the accepted plan's side_effect nodes.
    pub approved_gates: HashSet<String>,
}

impl SharedState {
    pub fn state(&self) -> SessionState {
        self.state.unwrap_or(SessionState::Uninitialized)
    }

    /// Install an accepted plan: progress counters and approved gates are
    /// derived from it, never from later requests.
    pub fn accept_plan(&mut self, plan: PlanDocument) {
        self.node_status = plan
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::Pending))
            .collect();
        self.approved_gates = plan
            .nodes
            .iter()
            .filter(|n| n.kind == PlanNodeKind::SideEffect)
            .filter_map(|n| n.commit_gate_id.clone())
            .collect();
        self.plan = Some(plan);
    }

    pub fn progress(&self) -> ProgressSummary {
        let total = self.node_status.len();
        let completed = self
            .node_status
            .values()
            .filter(|s| **s == NodeStatus::Completed)
            .count();
        let pending_validations = match &self.plan {
            Some(plan) => plan
                .nodes
                .iter()
                .filter(|n| n.kind == PlanNodeKind::Validate)
                .filter(|n| self.node_status.get(&n.id) != Some(&NodeStatus::Completed))
                .map(|n| n.id.clone())
                .collect(),
            None => Vec::new(),
        };
        ProgressSummary {
            total,
            completed,
            remaining: total - completed,
            pending_validations,
        }
    }
}

/// Narrow per-agent record: token accounting and rejection counters only.
#[derive(Debug, Default)]
pub struct AgentState {
    pub used_tokens: u64,
    pub rejection_counts: BTreeMap<String, u32>,
    /// Codes for which a pending correction was already scaffolded, so one
    /// session emits at most one candidate per code.
    pub corrections_emitted: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct WorkUnit {
    pub shared: SharedState,
    pub agents: HashMap<String, AgentState>,
}

impl WorkUnit {
    pub fn agent_mut(&mut self, agent_id: &str) -> &mut AgentState {
        self.agents.entry(agent_id.to_string()).or_default()
    }
}

/// Outcome of resolving (or minting) the identity triple for a turn.
#[derive(Debug, Clone)]
pub struct ResolvedIds {
    pub run_session_id: String,
    pub work_id: String,
    pub agent_id: String,
    /// The work unit existed and the caller supplied no agent id, so a
    /// fresh sub-agent was minted and joined.
    pub sub_agent_joined: bool,
}

#[derive(Default)]
struct RegistryInner {
    units: HashMap<WorkKey, Arc<tokio::sync::Mutex<WorkUnit>>>,
    turn_locks: HashMap<(WorkKey, String), Arc<tokio::sync::Mutex<()>>>,
}

/// Process-wide session map. A rebuildable cache over the event log.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve or mint the identity triple. A missing agent id on an
    /// existing work unit auto-assigns a new sub-agent.
    pub fn resolve_ids(
        &self,
        run_session_id: Option<&str>,
        work_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> ResolvedIds {
        let run_session_id = match run_session_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let work_id = match work_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let key = WorkKey {
            run_session_id: run_session_id.clone(),
            work_id: work_id.clone(),
        };
        let work_exists = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.units.contains_key(&key)
        };
        let (agent_id, sub_agent_joined) = match agent_id {
            Some(id) if !id.is_empty() => (id.to_string(), false),
            _ => (Uuid::new_v4().to_string(), work_exists),
        };
        ResolvedIds {
            run_session_id,
            work_id,
            agent_id,
            sub_agent_joined,
        }
    }

    pub fn unit(&self, key: &WorkKey) -> Arc<tokio::sync::Mutex<WorkUnit>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(inner.units.entry(key.clone()).or_default())
    }

    /// The per-session turn lock; turns for the same
    /// `(runSessionId, workId, agentId)` are serialized behind it.
    pub fn turn_lock(&self, key: &WorkKey, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            inner
                .turn_locks
                .entry((key.clone(), agent_id.to_string()))
                .or_default(),
        )
    }

    /// Rebuild the cache from replayed event rows. Envelope events carry
    /// enough to restore lifecycle state, the stored prompt and per-agent
    /// token accounting.
    pub async fn rebuild_from_events(&self, records: &[EventRecord]) {
        for record in records {
            let key = WorkKey {
                run_session_id: record.run_session_id.clone(),
                work_id: record.work_id.clone(),
            };
            let unit = self.unit(&key);
            let mut unit = unit.lock().await;
            match record.kind {
                EventKind::InputEnvelope => {
                    if unit.shared.original_prompt.is_none()
                        && let Some(prompt) =
                            record.payload.get("originalPrompt").and_then(|v| v.as_str())
                        && !prompt.is_empty()
                    {
                        unit.shared.original_prompt = Some(prompt.to_string());
                    }
                }
                EventKind::OutputEnvelope => {
                    if let Some(state) = record
                        .payload
                        .get("state")
                        .and_then(|v| serde_json::from_value::<SessionState>(v.clone()).ok())
                    {
                        unit.shared.state = Some(state);
                    }
                    if let Some(used) = record.payload.get("usedTokens").and_then(|v| v.as_u64()) {
                        unit.agent_mut(&record.agent_id).used_tokens = used;
                    }
                }
                _ => {}
            }
        }
    }
}
