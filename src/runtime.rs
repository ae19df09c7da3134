//! Runtime facade: owns the registries and executes action requests.
//!
//! The `Runtime` ties the agent registry, team registry and run loops to one
//! configuration and event sink. It is also where state crosses into and out
//! of a [`StorageAdapter`]: nothing below it touches storage.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::action::ActionRequest;
use crate::config::SriaConfig;
use crate::definition::AgentFilter;
use crate::error::{RegistryError, SriaError, SriaResult, StoreError};
use crate::event::{NullSink, SharedSink};
use crate::manager::AgentManager;
use crate::memory_field::MemoryField;
use crate::runner::{AgentRunner, RunOptions, StopCondition};
use crate::sria::engine;
use crate::sria::CandidateAction;
use crate::store::{EntityKind, StorageAdapter};
use crate::team::TeamManager;

/// Entropy cost given to configured default actions.
const DEFAULT_ACTION_COST: f64 = 1.0;
/// Confidence given to configured default actions.
const DEFAULT_ACTION_CONFIDENCE: f64 = 0.5;

/// What [`Runtime::restore`] brought back.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreSummary {
    pub agents: usize,
    pub engines: usize,
    pub teams: usize,
    /// Snapshots that failed validation and were skipped.
    pub skipped: usize,
}

pub struct Runtime {
    config: SriaConfig,
    agents: AgentManager,
    teams: TeamManager,
    runner: AgentRunner,
}

impl Runtime {
    /// A runtime that emits no events.
    pub fn new(config: SriaConfig) -> Self {
        Self::with_sink(config, Arc::new(NullSink))
    }

    pub fn with_sink(config: SriaConfig, sink: SharedSink) -> Self {
        let agents = AgentManager::new()
            .with_sink(Arc::clone(&sink))
            .with_settings(config.engine.clone());
        let teams = TeamManager::new(config.coupling.clone()).with_sink(sink);
        Self {
            config,
            agents,
            teams,
            runner: AgentRunner::new(),
        }
    }

    /// Attach a memory field to every engine.
    pub fn with_memory_field(mut self, field: Arc<dyn MemoryField>) -> Self {
        let agents = std::mem::replace(&mut self.agents, AgentManager::new());
        self.agents = agents.with_memory_field(field);
        self
    }

    pub fn config(&self) -> &SriaConfig {
        &self.config
    }

    pub fn agents(&self) -> &AgentManager {
        &self.agents
    }

    pub fn agents_mut(&mut self) -> &mut AgentManager {
        &mut self.agents
    }

    pub fn teams(&self) -> &TeamManager {
        &self.teams
    }

    pub fn runner(&self) -> &AgentRunner {
        &self.runner
    }

    /// One candidate per configured action type, all equally weighted.
    pub fn default_actions(&self) -> Vec<CandidateAction> {
        self.config
            .coupling
            .action_types
            .iter()
            .map(|t| CandidateAction::new(t.clone(), DEFAULT_ACTION_COST, DEFAULT_ACTION_CONFIDENCE))
            .collect()
    }

    fn actions_or_default(&self, actions: Vec<CandidateAction>) -> Vec<CandidateAction> {
        if actions.is_empty() {
            self.default_actions()
        } else {
            actions
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Parse and execute a JSON request.
    pub fn dispatch_json(&mut self, text: &str) -> SriaResult<Value> {
        let request = ActionRequest::from_json(text)?;
        self.dispatch(request)
    }

    /// Execute a request.
    ///
    /// Returns `{"success": true, ...}` on success and
    /// `{"success": false, "error": ...}` for routine failures (unknown ids,
    /// wrong lifecycle state). Any other failure is returned as `Err`.
    pub fn dispatch(&mut self, request: ActionRequest) -> SriaResult<Value> {
        let name = request.name();
        tracing::debug!(action = name, "dispatching");
        match self.execute(request) {
            Ok(fields) => {
                let mut body = Map::new();
                body.insert("success".into(), Value::Bool(true));
                body.extend(fields);
                Ok(Value::Object(body))
            }
            Err(e) if e.is_routine() => {
                tracing::debug!(action = name, error = %e, "action failed");
                let mut body = Map::new();
                body.insert("success".into(), Value::Bool(false));
                body.insert("error".into(), Value::String(e.to_string()));
                Ok(Value::Object(body))
            }
            Err(e) => Err(e),
        }
    }

    fn execute(&mut self, request: ActionRequest) -> SriaResult<Map<String, Value>> {
        match request {
            ActionRequest::AgentCreate { options } => field("agent", self.agents.create(options)?),
            ActionRequest::AgentGet { agent_id } => {
                let def = self.agents.get(&agent_id).ok_or_else(|| agent_not_found(&agent_id))?;
                field("agent", def)
            }
            ActionRequest::AgentList { filter } => field("agents", self.agents.list(&filter)),
            ActionRequest::AgentUpdate { agent_id, patch } => {
                let def = self
                    .agents
                    .update(&agent_id, patch)
                    .ok_or_else(|| agent_not_found(&agent_id))?;
                field("agent", def)
            }
            ActionRequest::AgentDelete { agent_id } => {
                if let Ok(handle) = self.runner.handle(&agent_id) {
                    handle.stop();
                }
                if !self.agents.delete(&agent_id) {
                    return Err(agent_not_found(&agent_id));
                }
                self.teams.forget_agent(&agent_id);
                field("deleted", agent_id)
            }
            ActionRequest::AgentSummon { agent_id, context } => {
                field("summon", self.agents.summon_with_context(&agent_id, context)?)
            }
            ActionRequest::AgentDismiss { agent_id } => {
                field("dismiss", self.agents.dismiss(&agent_id)?)
            }
            ActionRequest::AgentStep {
                agent_id,
                observation,
                actions,
            } => {
                let actions = self.actions_or_default(actions);
                field("step", self.agents.step(&agent_id, &observation, &actions)?)
            }
            ActionRequest::AgentStats => field("stats", self.agents.get_stats()),
            ActionRequest::AgentState { agent_id } => {
                let handle = self
                    .agents
                    .get_engine(&agent_id)
                    .ok_or_else(|| agent_not_found(&agent_id))?;
                let state = engine::lock(&handle).get_state();
                field("state", state)
            }
            ActionRequest::AgentRun {
                agent_id,
                observation,
                actions,
                stop_condition,
                interval_ms,
            } => {
                let options = RunOptions {
                    initial_observation: observation,
                    actions: self.actions_or_default(actions),
                    stop_condition: stop_condition.unwrap_or(StopCondition::MaxSteps {
                        steps: self.config.runner.max_steps,
                    }),
                    interval: Duration::from_millis(
                        interval_ms.unwrap_or(self.config.runner.interval_ms),
                    ),
                };
                field("run", self.runner.start(&mut self.agents, &agent_id, options)?)
            }
            ActionRequest::AgentRunStatus { agent_id } => {
                field("run", self.runner.status(&agent_id)?)
            }
            ActionRequest::AgentStop { agent_id } => field("run", self.runner.stop(&agent_id)?),

            ActionRequest::TemplateAdd { template } => {
                let template_id = template.id.clone();
                self.agents.add_template(template);
                field("template", template_id)
            }
            ActionRequest::TemplateList => field("templates", self.agents.templates()),

            ActionRequest::TeamCreate { options } => field("team", self.teams.create(options)),
            ActionRequest::TeamGet { team_id } => {
                let team = self.teams.get(&team_id).ok_or_else(|| team_not_found(&team_id))?;
                field("team", team)
            }
            ActionRequest::TeamList => field("teams", self.teams.list()),
            ActionRequest::TeamUpdate { team_id, patch } => {
                let team = self
                    .teams
                    .update(&team_id, patch)
                    .ok_or_else(|| team_not_found(&team_id))?;
                field("team", team)
            }
            ActionRequest::TeamDelete { team_id } => {
                if !self.teams.delete(&team_id) {
                    return Err(team_not_found(&team_id));
                }
                field("deleted", team_id)
            }
            ActionRequest::TeamAddAgent { team_id, agent_id } => {
                if self.agents.get(&agent_id).is_none() {
                    return Err(agent_not_found(&agent_id));
                }
                field("team", self.teams.add_agent(&team_id, &agent_id)?)
            }
            ActionRequest::TeamRemoveAgent { team_id, agent_id } => {
                field("team", self.teams.remove_agent(&team_id, &agent_id)?)
            }
            ActionRequest::TeamSummon { team_id } => {
                field("summon", self.teams.summon(&team_id, &mut self.agents)?)
            }
            ActionRequest::TeamStep {
                team_id,
                observation,
                actions,
            } => {
                let actions = self.actions_or_default(actions);
                field(
                    "step",
                    self.teams
                        .step(&team_id, &mut self.agents, &observation, &actions)?,
                )
            }
            ActionRequest::TeamDismiss { team_id } => {
                field("dismiss", self.teams.dismiss(&team_id, &mut self.agents)?)
            }
            ActionRequest::TeamState { team_id } => {
                field("state", self.teams.state(&team_id, &mut self.agents)?)
            }
        }
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Load definitions, engine snapshots and teams from `store`.
    ///
    /// Snapshots that fail validation are skipped with a warning; the agent's
    /// definition is still restored.
    pub fn restore(&mut self, store: &dyn StorageAdapter) -> SriaResult<RestoreSummary> {
        let mut summary = RestoreSummary::default();

        for def in store.load_agents()? {
            self.agents.restore_definition(def);
            summary.agents += 1;
        }
        for snapshot in store.load_snapshots()? {
            let agent_id = snapshot.definition.id.clone();
            if self.agents.get(&agent_id).is_none() {
                tracing::warn!(agent = %agent_id, "orphaned snapshot skipped");
                summary.skipped += 1;
                continue;
            }
            match self.agents.restore_engine(snapshot) {
                Ok(_) => summary.engines += 1,
                Err(e) => {
                    tracing::warn!(agent = %agent_id, error = %e, "snapshot restore failed");
                    summary.skipped += 1;
                }
            }
        }
        for mut team in store.load_teams()? {
            let before = team.agent_ids.len();
            team.agent_ids.retain(|id| self.agents.get(id).is_some());
            if team.agent_ids.len() != before {
                tracing::warn!(team = %team.id, dropped = before - team.agent_ids.len(), "team listed unknown agents");
            }
            self.teams.restore_team(team);
            summary.teams += 1;
        }

        tracing::info!(
            agents = summary.agents,
            engines = summary.engines,
            teams = summary.teams,
            "runtime restored"
        );
        Ok(summary)
    }

    /// Write the full registry state to `store`, removing entries for agents
    /// and teams that no longer exist.
    pub fn persist(&self, store: &dyn StorageAdapter) -> SriaResult<()> {
        let live_agents = self.agents.list(&AgentFilter::default());
        for stored in store.list_ids(EntityKind::Agent)? {
            if self.agents.get(&stored).is_none() {
                store.purge_agent(&stored)?;
            }
        }
        for def in &live_agents {
            store.save_agent(def)?;
        }
        for snapshot in self.agents.engine_snapshots() {
            store.save_engine(&snapshot)?;
        }

        for stored in store.list_ids(EntityKind::Team)? {
            if self.teams.get(&stored).is_none() {
                store.delete_team(&stored)?;
            }
        }
        for team in self.teams.list() {
            store.save_team(team)?;
        }

        tracing::debug!(agents = live_agents.len(), "runtime persisted");
        Ok(())
    }
}

fn field<T: Serialize>(key: &str, value: T) -> SriaResult<Map<String, Value>> {
    let value = serde_json::to_value(value).map_err(|e| StoreError::Serialization {
        message: format!("{key}: {e}"),
    })?;
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Ok(map)
}

fn agent_not_found(id: &str) -> SriaError {
    RegistryError::AgentNotFound { id: id.to_string() }.into()
}

fn team_not_found(id: &str) -> SriaError {
    RegistryError::TeamNotFound { id: id.to_string() }.into()
}
