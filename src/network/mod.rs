//! Multi-agent resonance coupling.
//!
//! A [`MultiAgentNetwork`] holds shared engine handles and three derived
//! components that are rebuilt whenever membership changes:
//!
//! - [`tensor_body::TensorBody`]: shared primes, coupling matrix, phase alignment
//! - [`policy::CoupledPolicy`]: per-member action distributions
//! - [`belief::BeliefNetwork`]: belief aggregation and propagation
//!
//! A collective step runs every active member's engine once, in member order,
//! and lets each result ripple through the coupling before the next member
//! steps. Action costs are biased by the policy as it stood when the step
//! began. One member's failure never aborts the others.

pub mod belief;
pub mod policy;
pub mod tensor_body;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::CouplingConfig;
use crate::error::{RegistryError, SriaResult};
use crate::event::{NullSink, SharedSink, SriaEvent};
use crate::sria::engine::{self, EngineHandle, SriaEngine, SriaSnapshot};
use crate::sria::{Belief, CandidateAction, DismissReport, LifecycleState, StepReport, SummonReport};

pub use belief::{BeliefNetwork, BeliefPropagation};
pub use policy::{CoupledPolicy, PolicyUpdate};
pub use tensor_body::{PhaseUpdate, TensorBody};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What happened to one member during a network-wide operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Ok,
    Skipped,
    Failed,
}

/// Per-member result of `summon_all` / `dismiss_all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberOutcome<T> {
    pub index: usize,
    pub agent_id: String,
    pub status: MemberStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStepResult {
    pub index: usize,
    pub agent_id: String,
    pub status: MemberStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_energy: Option<f64>,
    /// Why the member was skipped or what error it hit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<StepReport>,
    #[serde(default)]
    pub phase_updates: Vec<PhaseUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub belief_propagation: Option<BeliefPropagation>,
}

impl AgentStepResult {
    fn skipped(index: usize, agent_id: String, reason: impl Into<String>) -> Self {
        Self {
            index,
            agent_id,
            status: MemberStatus::Skipped,
            action: None,
            free_energy: None,
            reason: Some(reason.into()),
            report: None,
            phase_updates: Vec::new(),
            belief_propagation: None,
        }
    }

    fn failed(index: usize, agent_id: String, error: String) -> Self {
        Self {
            status: MemberStatus::Failed,
            ..Self::skipped(index, agent_id, error)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedAction {
    pub index: usize,
    pub agent_id: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveStepReport {
    pub network_id: String,
    pub step_count: u64,
    pub agent_results: Vec<AgentStepResult>,
    /// Mean step free energy over members that stepped; 1.0 if none did.
    pub collective_free_energy: f64,
    pub selected_actions: Vec<SelectedAction>,
    pub shared_beliefs: Vec<Belief>,
    pub phase_alignment: BTreeMap<u64, f64>,
    pub active_agents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSummonReport {
    pub network_id: String,
    pub results: Vec<MemberOutcome<SummonReport>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDismissReport {
    pub network_id: String,
    pub results: Vec<MemberOutcome<DismissReport>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberState {
    pub index: usize,
    pub agent_id: String,
    pub name: String,
    pub body_primes: Vec<u64>,
    pub lifecycle_state: LifecycleState,
    pub current_epoch: u64,
}

/// Read-only view of a network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkState {
    pub id: String,
    pub members: Vec<MemberState>,
    pub shared_primes: Vec<u64>,
    pub coupling_matrix: Vec<Vec<f64>>,
    pub phase_alignment: BTreeMap<u64, f64>,
    pub policy: Vec<BTreeMap<String, f64>>,
    pub step_count: u64,
    pub policy_updates: usize,
    pub belief_propagations: usize,
}

/// Everything needed to rebuild a standalone network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub id: String,
    pub members: Vec<SriaSnapshot>,
    pub policy_weights: Vec<BTreeMap<String, f64>>,
    pub step_count: u64,
    #[serde(default)]
    pub config: CouplingConfig,
}

// ---------------------------------------------------------------------------
// MultiAgentNetwork
// ---------------------------------------------------------------------------

pub struct MultiAgentNetwork {
    id: String,
    members: Vec<EngineHandle>,
    body: TensorBody,
    policy: CoupledPolicy,
    beliefs: BeliefNetwork,
    config: CouplingConfig,
    step_count: u64,
    sink: SharedSink,
}

impl MultiAgentNetwork {
    /// An empty network.
    pub fn new(id: impl Into<String>, config: CouplingConfig) -> Self {
        Self {
            id: id.into(),
            members: Vec::new(),
            body: TensorBody::default(),
            policy: CoupledPolicy::default(),
            beliefs: BeliefNetwork::new(),
            config,
            step_count: 0,
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// A network over `members` built in one go, without per-member events.
    pub fn with_members(mut self, members: Vec<EngineHandle>) -> Self {
        self.members = members;
        self.rebuild();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[EngineHandle] {
        &self.members
    }

    pub fn body(&self) -> &TensorBody {
        &self.body
    }

    pub fn policy(&self) -> &CoupledPolicy {
        &self.policy
    }

    pub fn beliefs(&self) -> &BeliefNetwork {
        &self.beliefs
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    fn emit(&self, event: SriaEvent) {
        self.sink.emit(&event);
    }

    /// Scale each action's entropy cost by `1 / p` under member `i`'s policy.
    fn biased_actions(&self, i: usize, actions: &[CandidateAction]) -> Vec<CandidateAction> {
        actions
            .iter()
            .map(|a| {
                let p = self.policy.probability(i, &a.action_type);
                let p = if p == 0.0 { self.config.probability_floor } else { p };
                CandidateAction {
                    entropy_cost: a.entropy_cost / p,
                    ..a.clone()
                }
            })
            .collect()
    }

    /// Recompute the tensor body and reseed policy and beliefs.
    fn rebuild(&mut self) {
        let primes = self
            .members
            .iter()
            .map(|h| engine::lock(h).body_primes().to_vec())
            .collect();
        self.body = TensorBody::new(primes);
        self.policy = CoupledPolicy::new(self.members.len());
        self.policy.initialize_weights(&self.config.action_types);
        self.beliefs = BeliefNetwork::new();
        tracing::debug!(
            network = %self.id,
            members = self.members.len(),
            shared = ?self.body.shared_primes(),
            "network rebuilt"
        );
    }

    // ── Membership ──────────────────────────────────────────────────────

    /// Add a member. Returns its index.
    pub fn add_agent(&mut self, handle: EngineHandle) -> usize {
        let agent_id = engine::lock(&handle).id().to_string();
        self.members.push(handle);
        self.rebuild();
        let index = self.members.len() - 1;
        self.emit(SriaEvent::AgentAdded {
            network_id: self.id.clone(),
            agent_id,
            index,
        });
        index
    }

    /// Remove the member at `index`. Later members shift down by one.
    pub fn remove_agent(&mut self, index: usize) -> SriaResult<EngineHandle> {
        if index >= self.members.len() {
            return Err(RegistryError::MemberOutOfRange {
                index,
                len: self.members.len(),
            }
            .into());
        }
        let handle = self.members.remove(index);
        self.rebuild();
        let agent_id = engine::lock(&handle).id().to_string();
        self.emit(SriaEvent::AgentRemoved {
            network_id: self.id.clone(),
            agent_id,
            index,
        });
        Ok(handle)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Summon every member with context `"{context}:{index}"`. Members that
    /// are already active are reported as failed and left alone.
    pub fn summon_all(&mut self, context: Option<&str>) -> NetworkSummonReport {
        let context = context.unwrap_or(&self.id).to_string();
        let mut results = Vec::with_capacity(self.members.len());

        for (index, handle) in self.members.iter().enumerate() {
            let mut engine = engine::lock(handle);
            let agent_id = engine.id().to_string();
            results.push(match engine.summon_with_context(Some(format!("{context}:{index}"))) {
                Ok(report) => MemberOutcome {
                    index,
                    agent_id,
                    status: MemberStatus::Ok,
                    report: Some(report),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(network = %self.id, agent = %agent_id, error = %e, "member summon failed");
                    MemberOutcome {
                        index,
                        agent_id,
                        status: MemberStatus::Failed,
                        report: None,
                        error: Some(e.to_string()),
                    }
                }
            });
        }

        let summoned = results
            .iter()
            .filter(|r| r.status == MemberStatus::Ok)
            .count();
        tracing::info!(network = %self.id, summoned, members = results.len(), "network summoned");
        self.emit(SriaEvent::NetworkSummoned {
            network_id: self.id.clone(),
            summoned,
            members: results.len(),
        });
        NetworkSummonReport {
            network_id: self.id.clone(),
            results,
        }
    }

    /// Step every active member once on the same observation.
    pub fn collective_step(
        &mut self,
        observation: &str,
        actions: &[CandidateAction],
    ) -> CollectiveStepReport {
        let mut agent_results = Vec::with_capacity(self.members.len());
        let mut selected_actions = Vec::new();
        let mut total_free_energy = 0.0;
        let mut active_agents = 0usize;

        // Bias every member against the policy as it stood before this step,
        // so member order does not change what a later member sees.
        let biased_by_member: Vec<Vec<CandidateAction>> = (0..self.members.len())
            .map(|i| self.biased_actions(i, actions))
            .collect();

        for (i, biased) in biased_by_member.into_iter().enumerate() {
            // Hold the member's lock only for its own step; propagation below
            // locks the other members.
            let (agent_id, outcome, top_belief, latest_phases) = {
                let mut engine = engine::lock(&self.members[i]);
                let agent_id = engine.id().to_string();
                if !engine.is_active() {
                    agent_results.push(AgentStepResult::skipped(i, agent_id, "dormant"));
                    continue;
                }
                let outcome = engine.full_step(observation, &biased);
                let top = engine.session().and_then(|s| s.top_belief().cloned());
                let phases: Vec<(u64, f64)> = self
                    .body
                    .shared_primes()
                    .iter()
                    .filter_map(|p| engine.latest_phase(*p).map(|phase| (*p, phase)))
                    .collect();
                (agent_id, outcome, top, phases)
            };

            let report = match outcome {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!(network = %self.id, agent = %agent_id, error = %e, "member step failed");
                    agent_results.push(AgentStepResult::failed(i, agent_id, e.to_string()));
                    continue;
                }
            };

            active_agents += 1;
            let free_energy = report.decision.free_energy;
            let action = report.decision.action.action_type.clone();
            total_free_energy += free_energy;
            selected_actions.push(SelectedAction {
                index: i,
                agent_id: agent_id.clone(),
                action: action.clone(),
            });

            if let Err(e) = self
                .policy
                .update(i, &action, 1.0 - free_energy, &self.body, &self.config)
            {
                tracing::warn!(network = %self.id, agent = %agent_id, error = %e, "policy update failed");
            }

            let belief_propagation = top_belief.map(|belief| {
                self.beliefs
                    .propagate_belief(&self.members, &self.body, &belief, i, &self.config)
            });

            let mut phase_updates = Vec::new();
            for (prime, phase) in latest_phases {
                phase_updates.extend(self.body.propagate_phase(
                    &self.members,
                    i,
                    prime,
                    phase,
                    &self.config,
                ));
            }

            agent_results.push(AgentStepResult {
                index: i,
                agent_id,
                status: MemberStatus::Ok,
                action: Some(action),
                free_energy: Some(free_energy),
                reason: None,
                report: Some(report),
                phase_updates,
                belief_propagation,
            });
        }

        self.step_count += 1;
        let phase_alignment = self.body.compute_phase_alignment(&self.members).clone();
        let mut shared_beliefs = self.beliefs.aggregate_beliefs(&self.members);
        shared_beliefs.truncate(self.config.shared_belief_top_k);

        let collective_free_energy = if active_agents == 0 {
            1.0
        } else {
            total_free_energy / active_agents as f64
        };

        tracing::debug!(
            network = %self.id,
            step = self.step_count,
            active_agents,
            collective_free_energy,
            "collective step complete"
        );
        self.emit(SriaEvent::CollectiveStep {
            network_id: self.id.clone(),
            step_count: self.step_count,
            collective_free_energy,
            active_agents,
        });

        CollectiveStepReport {
            network_id: self.id.clone(),
            step_count: self.step_count,
            agent_results,
            collective_free_energy,
            selected_actions,
            shared_beliefs,
            phase_alignment,
            active_agents,
        }
    }

    /// Dismiss every active member. Dormant members are skipped.
    pub fn dismiss_all(&mut self) -> NetworkDismissReport {
        let mut results = Vec::with_capacity(self.members.len());
        for (index, handle) in self.members.iter().enumerate() {
            let mut engine = engine::lock(handle);
            let agent_id = engine.id().to_string();
            if !engine.is_active() {
                results.push(MemberOutcome {
                    index,
                    agent_id,
                    status: MemberStatus::Skipped,
                    report: None,
                    error: None,
                });
                continue;
            }
            results.push(match engine.dismiss() {
                Ok(report) => MemberOutcome {
                    index,
                    agent_id,
                    status: MemberStatus::Ok,
                    report: Some(report),
                    error: None,
                },
                Err(e) => MemberOutcome {
                    index,
                    agent_id,
                    status: MemberStatus::Failed,
                    report: None,
                    error: Some(e.to_string()),
                },
            });
        }

        let dismissed = results
            .iter()
            .filter(|r| r.status == MemberStatus::Ok)
            .count();
        tracing::info!(network = %self.id, dismissed, "network dismissed");
        self.emit(SriaEvent::NetworkDismissed {
            network_id: self.id.clone(),
            dismissed,
            members: results.len(),
        });
        NetworkDismissReport {
            network_id: self.id.clone(),
            results,
        }
    }

    // ── State & persistence ─────────────────────────────────────────────

    pub fn get_state(&self) -> NetworkState {
        let members = self
            .members
            .iter()
            .enumerate()
            .map(|(index, h)| {
                let e = engine::lock(h);
                MemberState {
                    index,
                    agent_id: e.id().to_string(),
                    name: e.name().to_string(),
                    body_primes: e.body_primes().to_vec(),
                    lifecycle_state: e.lifecycle_state(),
                    current_epoch: e.current_epoch(),
                }
            })
            .collect();
        NetworkState {
            id: self.id.clone(),
            members,
            shared_primes: self.body.shared_primes().to_vec(),
            coupling_matrix: self.body.coupling_matrix().to_vec(),
            phase_alignment: self.body.phase_alignment().clone(),
            policy: self.policy.weights().to_vec(),
            step_count: self.step_count,
            policy_updates: self.policy.updates().len(),
            belief_propagations: self.beliefs.log().len(),
        }
    }

    pub fn serialize(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            id: self.id.clone(),
            members: self
                .members
                .iter()
                .map(|h| engine::lock(h).serialize())
                .collect(),
            policy_weights: self.policy.weights().to_vec(),
            step_count: self.step_count,
            config: self.config.clone(),
        }
    }

    /// Rebuild a network with fresh engines restored from the snapshot.
    pub fn deserialize(snapshot: NetworkSnapshot) -> SriaResult<Self> {
        let members = snapshot
            .members
            .into_iter()
            .map(|s| SriaEngine::deserialize(s).map(engine::handle))
            .collect::<SriaResult<Vec<_>>>()?;
        let mut network = Self::new(snapshot.id, snapshot.config).with_members(members);
        if !network.policy.restore_weights(snapshot.policy_weights) {
            tracing::warn!(network = %network.id, "policy weights did not match membership, reseeded");
        }
        network.step_count = snapshot.step_count;
        network.body.compute_phase_alignment(&network.members);
        Ok(network)
    }
}

impl std::fmt::Debug for MultiAgentNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiAgentNetwork")
            .field("id", &self.id)
            .field("members", &self.members.len())
            .field("step_count", &self.step_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::AgentDefinition;
    use crate::event::VecSink;

    fn member(id: &str, primes: &[u64]) -> EngineHandle {
        engine::handle(SriaEngine::new(AgentDefinition::new(id, id, primes.to_vec())))
    }

    fn actions() -> Vec<CandidateAction> {
        vec![
            CandidateAction::new("query", 0.5, 0.6),
            CandidateAction::new("wait", 0.2, 0.3),
        ]
    }

    fn pair(sink: Arc<VecSink>) -> MultiAgentNetwork {
        let mut net = MultiAgentNetwork::new("net", CouplingConfig::default()).with_sink(sink);
        net.add_agent(member("a", &[2, 3, 5, 7, 11]));
        net.add_agent(member("b", &[2, 3, 13, 17, 19]));
        net
    }

    #[test]
    fn membership_rebuilds_components() {
        let sink = Arc::new(VecSink::new());
        let mut net = pair(sink.clone());
        assert_eq!(net.body().shared_primes(), &[2, 3]);
        assert_eq!(net.policy().len(), 2);
        assert_eq!(sink.names(), vec!["agent_added", "agent_added"]);

        let removed = net.remove_agent(0).unwrap();
        assert_eq!(engine::lock(&removed).id(), "a");
        assert_eq!(net.len(), 1);
        assert_eq!(net.body().shared_primes(), &[2, 3, 13, 17, 19]);
        assert!(net.remove_agent(5).is_err());
    }

    #[test]
    fn summon_all_tags_context() {
        let sink = Arc::new(VecSink::new());
        let mut net = pair(sink.clone());
        let report = net.summon_all(Some("mission"));
        assert!(report.results.iter().all(|r| r.status == MemberStatus::Ok));
        let ctx = engine::lock(&net.members()[1])
            .session()
            .unwrap()
            .context
            .clone();
        assert_eq!(ctx.as_deref(), Some("mission:1"));

        // A second summon fails per member without panicking.
        let again = net.summon_all(None);
        assert!(again.results.iter().all(|r| r.status == MemberStatus::Failed));
    }

    #[test]
    fn collective_step_end_to_end() {
        let sink = Arc::new(VecSink::new());
        let mut net = pair(sink.clone());
        net.summon_all(None);
        sink.clear();

        let report = net.collective_step("the signal rises", &actions());
        assert_eq!(report.active_agents, 2);
        assert_eq!(report.step_count, 1);
        assert_eq!(report.selected_actions.len(), 2);

        let fes: Vec<f64> = report
            .agent_results
            .iter()
            .filter_map(|r| r.free_energy)
            .collect();
        assert_eq!(fes.len(), 2);
        let mean = fes.iter().sum::<f64>() / 2.0;
        assert!((report.collective_free_energy - mean).abs() < 1e-12);

        for prime in report.phase_alignment.keys() {
            assert!(net.body().shared_primes().contains(prime));
        }
        assert!(!report.phase_alignment.is_empty());
        assert!(report.shared_beliefs.len() <= 5);
        assert_eq!(sink.names(), vec!["collective_step"]);

        for w in net.policy().weights() {
            assert!((w.values().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn dormant_members_are_skipped_and_empty_network_scores_one() {
        let mut net = pair(Arc::new(VecSink::new()));
        let report = net.collective_step("x", &actions());
        assert_eq!(report.active_agents, 0);
        assert_eq!(report.collective_free_energy, 1.0);
        assert!(report
            .agent_results
            .iter()
            .all(|r| r.status == MemberStatus::Skipped));
    }

    #[test]
    fn member_failure_does_not_abort_others() {
        let mut net = pair(Arc::new(VecSink::new()));
        net.summon_all(None);
        // Forbid everything for the first member only.
        {
            let mut a = engine::lock(&net.members()[0]);
            let mut def = a.definition().clone();
            def.safety_constraints.forbidden_actions = vec!["query".into(), "wait".into()];
            a.refresh_definition(def);
        }
        let report = net.collective_step("x", &actions());
        assert_eq!(report.agent_results[0].status, MemberStatus::Failed);
        assert_eq!(report.agent_results[1].status, MemberStatus::Ok);
        assert_eq!(report.active_agents, 1);
    }

    #[test]
    fn dismiss_all_and_snapshot() {
        let mut net = pair(Arc::new(VecSink::new()));
        net.summon_all(None);
        net.collective_step("one", &actions());
        net.collective_step("two", &actions());

        let snapshot = net.serialize();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored = MultiAgentNetwork::deserialize(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.step_count(), 2);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.policy().weights(), net.policy().weights());
        assert_eq!(
            engine::lock(&restored.members()[0]).current_epoch(),
            engine::lock(&net.members()[0]).current_epoch()
        );

        let report = net.dismiss_all();
        assert!(report.results.iter().all(|r| r.status == MemberStatus::Ok));
        let again = net.dismiss_all();
        assert!(again.results.iter().all(|r| r.status == MemberStatus::Skipped));
        assert_eq!(net.get_state().members[0].lifecycle_state, LifecycleState::Dormant);
    }

    #[test]
    fn member_outcomes_parse_without_report() {
        let json = r#"{"network_id":"n","results":[
            {"index":0,"agent_id":"a","status":"failed","error":"already active"}
        ]}"#;
        let parsed: NetworkSummonReport = serde_json::from_str(json).unwrap();
        assert!(parsed.results[0].report.is_none());
        assert_eq!(parsed.results[0].status, MemberStatus::Failed);

        let mut net = pair(Arc::new(VecSink::new()));
        let summoned = net.summon_all(None);
        let text = serde_json::to_string(&summoned).unwrap();
        let back: NetworkSummonReport = serde_json::from_str(&text).unwrap();
        assert!(back.results.iter().all(|r| r.report.is_some()));

        let dismissed = serde_json::to_string(&net.dismiss_all()).unwrap();
        let back: NetworkDismissReport = serde_json::from_str(&dismissed).unwrap();
        assert_eq!(back.results.len(), 2);
    }
}
