//! Teams: named, persisted groupings of agents.
//!
//! A team is pure data. Network operations project its `agent_ids` through
//! [`AgentManager::get_engine`] into a [`MultiAgentNetwork`] that is cached per
//! team and rebuilt whenever the resolved membership changes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::CouplingConfig;
use crate::error::{RegistryError, SriaResult};
use crate::event::{NullSink, SharedSink, SriaEvent};
use crate::manager::AgentManager;
use crate::network::{
    CollectiveStepReport, MultiAgentNetwork, NetworkDismissReport, NetworkState,
    NetworkSummonReport,
};
use crate::sria::CandidateAction;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Context tag members are summoned with. Defaults to the team name.
    #[serde(default)]
    pub context: Option<String>,
    /// Prepended to every observation a team step receives.
    #[serde(default)]
    pub observation_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub config: TeamConfig,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Team {
    fn touch(&mut self) {
        self.updated_at = crate::now_millis().max(self.updated_at + 1);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTeamOptions {
    pub name: String,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub config: TeamConfig,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Option<TeamConfig>,
    /// Merged key-by-key into the existing metadata.
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamState {
    pub team: Team,
    pub network: NetworkState,
}

pub struct TeamManager {
    teams: BTreeMap<String, Team>,
    networks: HashMap<String, MultiAgentNetwork>,
    coupling: CouplingConfig,
    sink: SharedSink,
}

impl TeamManager {
    pub fn new(coupling: CouplingConfig) -> Self {
        Self {
            teams: BTreeMap::new(),
            networks: HashMap::new(),
            coupling,
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    fn emit(&self, event: SriaEvent) {
        self.sink.emit(&event);
    }

    // ── CRUD ────────────────────────────────────────────────────────────

    pub fn create(&mut self, opts: CreateTeamOptions) -> Team {
        let now = crate::now_millis();
        let team = Team {
            id: crate::new_id("team"),
            name: opts.name,
            agent_ids: dedup(opts.agent_ids),
            config: opts.config,
            metadata: opts.metadata,
            created_at: now,
            updated_at: now,
        };
        tracing::info!(team = %team.id, name = %team.name, members = team.agent_ids.len(), "team created");
        self.teams.insert(team.id.clone(), team.clone());
        self.emit(SriaEvent::TeamCreated {
            team_id: team.id.clone(),
            name: team.name.clone(),
        });
        team
    }

    /// Register a team loaded from storage. Emits nothing.
    pub fn restore_team(&mut self, team: Team) {
        self.networks.remove(&team.id);
        self.teams.insert(team.id.clone(), team);
    }

    pub fn get(&self, id: &str) -> Option<&Team> {
        self.teams.get(id)
    }

    /// All teams, oldest first.
    pub fn list(&self) -> Vec<&Team> {
        let mut teams: Vec<&Team> = self.teams.values().collect();
        teams.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        teams
    }

    pub fn update(&mut self, id: &str, patch: TeamPatch) -> Option<Team> {
        let team = self.teams.get_mut(id)?;
        if let Some(name) = patch.name {
            team.name = name;
        }
        if let Some(config) = patch.config {
            team.config = config;
        }
        if let Some(metadata) = patch.metadata {
            team.metadata.extend(metadata);
        }
        team.touch();
        let team = team.clone();
        self.emit(SriaEvent::TeamUpdated {
            team_id: id.to_string(),
        });
        Some(team)
    }

    /// Remove a team. Its agents are left as they are.
    pub fn delete(&mut self, id: &str) -> bool {
        if self.teams.remove(id).is_none() {
            return false;
        }
        self.networks.remove(id);
        tracing::info!(team = %id, "team deleted");
        self.emit(SriaEvent::TeamDeleted {
            team_id: id.to_string(),
        });
        true
    }

    fn team_mut(&mut self, id: &str) -> SriaResult<&mut Team> {
        self.teams.get_mut(id).ok_or_else(|| {
            RegistryError::TeamNotFound {
                id: id.to_string(),
            }
            .into()
        })
    }

    /// Add an agent id to a team. Adding a present id changes nothing but
    /// still emits.
    pub fn add_agent(&mut self, team_id: &str, agent_id: &str) -> SriaResult<Team> {
        let team = self.team_mut(team_id)?;
        if !team.agent_ids.iter().any(|a| a == agent_id) {
            team.agent_ids.push(agent_id.to_string());
            team.touch();
        }
        let team = team.clone();
        self.networks.remove(team_id);
        self.emit(SriaEvent::TeamAgentAdded {
            team_id: team_id.to_string(),
            agent_id: agent_id.to_string(),
        });
        Ok(team)
    }

    pub fn remove_agent(&mut self, team_id: &str, agent_id: &str) -> SriaResult<Team> {
        let team = self.team_mut(team_id)?;
        let before = team.agent_ids.len();
        team.agent_ids.retain(|a| a != agent_id);
        if team.agent_ids.len() != before {
            team.touch();
        }
        let team = team.clone();
        self.networks.remove(team_id);
        self.emit(SriaEvent::TeamAgentRemoved {
            team_id: team_id.to_string(),
            agent_id: agent_id.to_string(),
        });
        Ok(team)
    }

    /// Drop `agent_id` from every team that lists it. Returns the ids of the
    /// teams that changed. Emits nothing; the caller's own event covers it.
    pub fn forget_agent(&mut self, agent_id: &str) -> Vec<String> {
        let mut changed = Vec::new();
        for team in self.teams.values_mut() {
            let before = team.agent_ids.len();
            team.agent_ids.retain(|a| a != agent_id);
            if team.agent_ids.len() != before {
                team.touch();
                changed.push(team.id.clone());
            }
        }
        for team_id in &changed {
            self.networks.remove(team_id);
            tracing::debug!(team = %team_id, agent = %agent_id, "agent dropped from team");
        }
        changed.sort();
        changed
    }

    // ── Network projection ──────────────────────────────────────────────

    /// The team's network, rebuilt if its resolved members changed.
    fn network(
        &mut self,
        team_id: &str,
        agents: &mut AgentManager,
    ) -> SriaResult<&mut MultiAgentNetwork> {
        let team = self.teams.get(team_id).ok_or_else(|| RegistryError::TeamNotFound {
            id: team_id.to_string(),
        })?;

        let mut handles = Vec::with_capacity(team.agent_ids.len());
        for agent_id in &team.agent_ids {
            let handle = agents
                .get_engine(agent_id)
                .ok_or_else(|| RegistryError::AgentNotFound {
                    id: agent_id.clone(),
                })?;
            handles.push(handle);
        }

        let stale = match self.networks.get(team_id) {
            Some(net) => {
                net.len() != handles.len()
                    || net
                        .members()
                        .iter()
                        .zip(&handles)
                        .any(|(a, b)| !Arc::ptr_eq(a, b))
            }
            None => true,
        };
        if stale {
            tracing::debug!(team = %team_id, members = handles.len(), "building team network");
            let network = MultiAgentNetwork::new(team_id, self.coupling.clone())
                .with_sink(Arc::clone(&self.sink))
                .with_members(handles);
            self.networks.insert(team_id.to_string(), network);
        }
        self.networks.get_mut(team_id).ok_or_else(|| {
            RegistryError::TeamNotFound {
                id: team_id.to_string(),
            }
            .into()
        })
    }

    fn team(&self, id: &str) -> SriaResult<&Team> {
        self.teams.get(id).ok_or_else(|| {
            RegistryError::TeamNotFound {
                id: id.to_string(),
            }
            .into()
        })
    }

    pub fn summon(
        &mut self,
        team_id: &str,
        agents: &mut AgentManager,
    ) -> SriaResult<NetworkSummonReport> {
        let team = self.team(team_id)?;
        let context = team.config.context.clone().unwrap_or_else(|| team.name.clone());
        Ok(self.network(team_id, agents)?.summon_all(Some(&context)))
    }

    pub fn step(
        &mut self,
        team_id: &str,
        agents: &mut AgentManager,
        observation: &str,
        actions: &[CandidateAction],
    ) -> SriaResult<CollectiveStepReport> {
        let observation = match self.team(team_id)?.config.observation_prefix {
            Some(ref prefix) => format!("{prefix}{observation}"),
            None => observation.to_string(),
        };
        Ok(self
            .network(team_id, agents)?
            .collective_step(&observation, actions))
    }

    pub fn dismiss(
        &mut self,
        team_id: &str,
        agents: &mut AgentManager,
    ) -> SriaResult<NetworkDismissReport> {
        Ok(self.network(team_id, agents)?.dismiss_all())
    }

    pub fn state(&mut self, team_id: &str, agents: &mut AgentManager) -> SriaResult<TeamState> {
        let network = self.network(team_id, agents)?.get_state();
        Ok(TeamState {
            team: self.team(team_id)?.clone(),
            network,
        })
    }
}

impl Default for TeamManager {
    fn default() -> Self {
        Self::new(CouplingConfig::default())
    }
}

fn dedup(ids: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::CreateAgentOptions;
    use crate::event::VecSink;
    use crate::network::MemberStatus;

    fn setup() -> (AgentManager, TeamManager, Arc<VecSink>, Vec<String>) {
        let mut agents = AgentManager::new();
        let ids = [vec![2, 3, 5, 7, 11], vec![2, 3, 13, 17, 19]]
            .into_iter()
            .map(|primes| {
                agents
                    .create(CreateAgentOptions {
                        body_primes: Some(primes),
                        ..Default::default()
                    })
                    .unwrap()
                    .id
            })
            .collect();
        let sink = Arc::new(VecSink::new());
        let teams = TeamManager::default().with_sink(sink.clone());
        (agents, teams, sink, ids)
    }

    #[test]
    fn crud_and_events() {
        let (_, mut teams, sink, ids) = setup();
        let team = teams.create(CreateTeamOptions {
            name: "Tide".into(),
            agent_ids: vec![ids[0].clone(), ids[0].clone()],
            ..Default::default()
        });
        assert_eq!(team.agent_ids.len(), 1);

        teams.add_agent(&team.id, &ids[1]).unwrap();
        let updated = teams
            .update(
                &team.id,
                TeamPatch {
                    name: Some("Ebb".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "Ebb");
        assert_eq!(updated.agent_ids, ids);

        let trimmed = teams.remove_agent(&team.id, &ids[0]).unwrap();
        assert_eq!(trimmed.agent_ids, vec![ids[1].clone()]);
        assert_eq!(teams.list().len(), 1);
        assert!(teams.delete(&team.id));
        assert!(!teams.delete(&team.id));
        assert!(teams.add_agent(&team.id, &ids[0]).unwrap_err().is_routine());

        assert_eq!(
            sink.names(),
            vec![
                "team_created",
                "team_agent_added",
                "team_updated",
                "team_agent_removed",
                "team_deleted"
            ]
        );
    }

    #[test]
    fn summon_step_dismiss_through_network() {
        let (mut agents, mut teams, sink, ids) = setup();
        let team = teams.create(CreateTeamOptions {
            name: "Pair".into(),
            agent_ids: ids.clone(),
            config: TeamConfig {
                context: Some("drill".into()),
                observation_prefix: Some("[pair] ".into()),
            },
            ..Default::default()
        });
        sink.clear();

        let summoned = teams.summon(&team.id, &mut agents).unwrap();
        assert!(summoned.results.iter().all(|r| r.status == MemberStatus::Ok));
        assert_eq!(agents.get_stats().summoned_agents, 2);

        let report = teams
            .step(
                &team.id,
                &mut agents,
                "storm",
                &[CandidateAction::new("query", 0.3, 0.5)],
            )
            .unwrap();
        assert_eq!(report.active_agents, 2);
        assert_eq!(report.network_id, team.id);
        let raw = &report.agent_results[0].report.as_ref().unwrap().perception.percept.raw;
        assert_eq!(raw, "[pair] storm");

        let state = teams.state(&team.id, &mut agents).unwrap();
        assert_eq!(state.network.step_count, 1);
        assert_eq!(state.network.shared_primes, vec![2, 3]);

        teams.dismiss(&team.id, &mut agents).unwrap();
        assert_eq!(agents.get_stats().summoned_agents, 0);
        assert_eq!(
            sink.names(),
            vec!["network_summoned", "collective_step", "network_dismissed"]
        );
    }

    #[test]
    fn network_is_cached_until_membership_changes() {
        let (mut agents, mut teams, _, ids) = setup();
        let team = teams.create(CreateTeamOptions {
            name: "Pair".into(),
            agent_ids: ids.clone(),
            ..Default::default()
        });
        teams.summon(&team.id, &mut agents).unwrap();
        let actions = [CandidateAction::new("wait", 0.1, 0.5)];
        teams.step(&team.id, &mut agents, "a", &actions).unwrap();
        let second = teams.step(&team.id, &mut agents, "b", &actions).unwrap();
        assert_eq!(second.step_count, 2);

        teams.remove_agent(&team.id, &ids[1]).unwrap();
        let rebuilt = teams.step(&team.id, &mut agents, "c", &actions).unwrap();
        assert_eq!(rebuilt.step_count, 1);
        assert_eq!(rebuilt.agent_results.len(), 1);
    }

    #[test]
    fn unknown_members_and_teams_are_errors() {
        let (mut agents, mut teams, _, _) = setup();
        let team = teams.create(CreateTeamOptions {
            name: "Ghosts".into(),
            agent_ids: vec!["agent_missing".into()],
            ..Default::default()
        });
        assert!(teams.summon(&team.id, &mut agents).is_err());
        assert!(teams.summon("team_missing", &mut agents).unwrap_err().is_routine());
    }

    #[test]
    fn forgotten_agents_leave_every_team() {
        let (mut agents, mut teams, sink, ids) = setup();
        let first = teams.create(CreateTeamOptions {
            name: "one".into(),
            agent_ids: ids.clone(),
            ..Default::default()
        });
        let second = teams.create(CreateTeamOptions {
            name: "two".into(),
            agent_ids: vec![ids[0].clone()],
            ..Default::default()
        });
        teams.summon(&first.id, &mut agents).unwrap();
        sink.clear();

        assert!(agents.delete(&ids[0]));
        let mut expected = vec![first.id.clone(), second.id.clone()];
        expected.sort();
        assert_eq!(teams.forget_agent(&ids[0]), expected);
        assert!(sink.names().is_empty());
        assert_eq!(teams.get(&first.id).unwrap().agent_ids, vec![ids[1].clone()]);
        assert!(teams.get(&second.id).unwrap().agent_ids.is_empty());

        // The survivor is still reachable through the team.
        let report = teams.dismiss(&first.id, &mut agents).unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].status, MemberStatus::Ok);
        assert!(teams.forget_agent(&ids[0]).is_empty());
    }
}
