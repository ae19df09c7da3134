//! JSON action requests.
//!
//! Every manager operation is reachable as a flat JSON object tagged by
//! `"action"`, e.g.
//!
//! ```json
//! {"action": "agent.step", "agent_id": "agent_x", "observation": "hello"}
//! ```
//!
//! [`Runtime::dispatch`](crate::runtime::Runtime::dispatch) executes them.

use serde::{Deserialize, Serialize};

use crate::definition::{AgentFilter, AgentPatch, AgentTemplate, CreateAgentOptions};
use crate::error::{EngineError, SriaResult};
use crate::runner::StopCondition;
use crate::sria::CandidateAction;
use crate::team::{CreateTeamOptions, TeamPatch};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ActionRequest {
    // ── Agents ──────────────────────────────────────────────────────────
    #[serde(rename = "agent.create")]
    AgentCreate {
        #[serde(flatten)]
        options: CreateAgentOptions,
    },
    #[serde(rename = "agent.get")]
    AgentGet { agent_id: String },
    #[serde(rename = "agent.list")]
    AgentList {
        #[serde(flatten)]
        filter: AgentFilter,
    },
    #[serde(rename = "agent.update")]
    AgentUpdate {
        agent_id: String,
        #[serde(flatten)]
        patch: AgentPatch,
    },
    #[serde(rename = "agent.delete")]
    AgentDelete { agent_id: String },
    #[serde(rename = "agent.summon")]
    AgentSummon {
        agent_id: String,
        #[serde(default)]
        context: Option<String>,
    },
    #[serde(rename = "agent.dismiss")]
    AgentDismiss { agent_id: String },
    /// Empty `actions` falls back to the configured action types.
    #[serde(rename = "agent.step")]
    AgentStep {
        agent_id: String,
        observation: String,
        #[serde(default)]
        actions: Vec<CandidateAction>,
    },
    #[serde(rename = "agent.stats")]
    AgentStats,
    #[serde(rename = "agent.state")]
    AgentState { agent_id: String },
    /// Start a background run. `stop_condition` defaults to the configured
    /// step limit, `interval_ms` to the configured interval.
    #[serde(rename = "agent.run")]
    AgentRun {
        agent_id: String,
        observation: String,
        #[serde(default)]
        actions: Vec<CandidateAction>,
        #[serde(default)]
        stop_condition: Option<StopCondition>,
        #[serde(default)]
        interval_ms: Option<u64>,
    },
    #[serde(rename = "agent.run_status")]
    AgentRunStatus { agent_id: String },
    #[serde(rename = "agent.stop")]
    AgentStop { agent_id: String },

    // ── Templates ───────────────────────────────────────────────────────
    #[serde(rename = "template.add")]
    TemplateAdd { template: AgentTemplate },
    #[serde(rename = "template.list")]
    TemplateList,

    // ── Teams ───────────────────────────────────────────────────────────
    #[serde(rename = "team.create")]
    TeamCreate {
        #[serde(flatten)]
        options: CreateTeamOptions,
    },
    #[serde(rename = "team.get")]
    TeamGet { team_id: String },
    #[serde(rename = "team.list")]
    TeamList,
    #[serde(rename = "team.update")]
    TeamUpdate {
        team_id: String,
        #[serde(flatten)]
        patch: TeamPatch,
    },
    #[serde(rename = "team.delete")]
    TeamDelete { team_id: String },
    #[serde(rename = "team.add_agent")]
    TeamAddAgent { team_id: String, agent_id: String },
    #[serde(rename = "team.remove_agent")]
    TeamRemoveAgent { team_id: String, agent_id: String },
    #[serde(rename = "team.summon")]
    TeamSummon { team_id: String },
    #[serde(rename = "team.step")]
    TeamStep {
        team_id: String,
        observation: String,
        #[serde(default)]
        actions: Vec<CandidateAction>,
    },
    #[serde(rename = "team.dismiss")]
    TeamDismiss { team_id: String },
    #[serde(rename = "team.state")]
    TeamState { team_id: String },
}

impl ActionRequest {
    /// Parse a request from JSON text.
    pub fn from_json(text: &str) -> SriaResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            EngineError::InvalidArgument {
                message: format!("malformed action request: {e}"),
            }
            .into()
        })
    }

    /// The wire name, e.g. `"agent.create"`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentCreate { .. } => "agent.create",
            Self::AgentGet { .. } => "agent.get",
            Self::AgentList { .. } => "agent.list",
            Self::AgentUpdate { .. } => "agent.update",
            Self::AgentDelete { .. } => "agent.delete",
            Self::AgentSummon { .. } => "agent.summon",
            Self::AgentDismiss { .. } => "agent.dismiss",
            Self::AgentStep { .. } => "agent.step",
            Self::AgentStats => "agent.stats",
            Self::AgentState { .. } => "agent.state",
            Self::AgentRun { .. } => "agent.run",
            Self::AgentRunStatus { .. } => "agent.run_status",
            Self::AgentStop { .. } => "agent.stop",
            Self::TemplateAdd { .. } => "template.add",
            Self::TemplateList => "template.list",
            Self::TeamCreate { .. } => "team.create",
            Self::TeamGet { .. } => "team.get",
            Self::TeamList => "team.list",
            Self::TeamUpdate { .. } => "team.update",
            Self::TeamDelete { .. } => "team.delete",
            Self::TeamAddAgent { .. } => "team.add_agent",
            Self::TeamRemoveAgent { .. } => "team.remove_agent",
            Self::TeamSummon { .. } => "team.summon",
            Self::TeamStep { .. } => "team.step",
            Self::TeamDismiss { .. } => "team.dismiss",
            Self::TeamState { .. } => "team.state",
        }
    }

    /// Whether executing this request can change persisted state.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Self::AgentGet { .. }
                | Self::AgentList { .. }
                | Self::AgentStats
                | Self::AgentRunStatus { .. }
                | Self::TemplateList
                | Self::TeamGet { .. }
                | Self::TeamList
        )
    }
}
