//! Structured notifications for state-changing calls.
//!
//! Every state-changing manager, network and team operation emits exactly one
//! [`SriaEvent`] to the configured [`EventSink`], synchronously, after the
//! change has been applied. Sinks render events for different consumers:
//! nothing, an in-memory log (testing), JSON lines, or `tracing`.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

// ── Event types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SriaEvent {
    AgentCreated {
        agent_id: String,
        name: String,
        body_primes: Vec<u64>,
    },
    AgentUpdated {
        agent_id: String,
    },
    AgentDeleted {
        agent_id: String,
    },
    TemplateAdded {
        template_id: String,
    },
    Summoned {
        agent_id: String,
        session_id: String,
    },
    Dismissed {
        agent_id: String,
        beacon: String,
        action_count: usize,
    },
    AgentStep {
        agent_id: String,
        epoch: u64,
        action: String,
        free_energy: f64,
    },
    /// A member joined a network.
    AgentAdded {
        network_id: String,
        agent_id: String,
        index: usize,
    },
    /// A member left a network.
    AgentRemoved {
        network_id: String,
        agent_id: String,
        index: usize,
    },
    NetworkSummoned {
        network_id: String,
        summoned: usize,
        members: usize,
    },
    CollectiveStep {
        network_id: String,
        step_count: u64,
        collective_free_energy: f64,
        active_agents: usize,
    },
    NetworkDismissed {
        network_id: String,
        dismissed: usize,
        members: usize,
    },
    TeamCreated {
        team_id: String,
        name: String,
    },
    TeamUpdated {
        team_id: String,
    },
    TeamDeleted {
        team_id: String,
    },
    TeamAgentAdded {
        team_id: String,
        agent_id: String,
    },
    TeamAgentRemoved {
        team_id: String,
        agent_id: String,
    },
    RunStarted {
        agent_id: String,
    },
    RunStopped {
        agent_id: String,
        steps: u64,
        reason: String,
    },
}

impl SriaEvent {
    /// The wire name of the event, e.g. `"agent_created"`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentCreated { .. } => "agent_created",
            Self::AgentUpdated { .. } => "agent_updated",
            Self::AgentDeleted { .. } => "agent_deleted",
            Self::TemplateAdded { .. } => "template_added",
            Self::Summoned { .. } => "summoned",
            Self::Dismissed { .. } => "dismissed",
            Self::AgentStep { .. } => "agent_step",
            Self::AgentAdded { .. } => "agent_added",
            Self::AgentRemoved { .. } => "agent_removed",
            Self::NetworkSummoned { .. } => "network_summoned",
            Self::CollectiveStep { .. } => "collective_step",
            Self::NetworkDismissed { .. } => "network_dismissed",
            Self::TeamCreated { .. } => "team_created",
            Self::TeamUpdated { .. } => "team_updated",
            Self::TeamDeleted { .. } => "team_deleted",
            Self::TeamAgentAdded { .. } => "team_agent_added",
            Self::TeamAgentRemoved { .. } => "team_agent_removed",
            Self::RunStarted { .. } => "run_started",
            Self::RunStopped { .. } => "run_stopped",
        }
    }

    /// The id of the agent, network or team the event is about.
    pub fn subject(&self) -> &str {
        match self {
            Self::AgentCreated { agent_id, .. }
            | Self::AgentUpdated { agent_id }
            | Self::AgentDeleted { agent_id }
            | Self::Summoned { agent_id, .. }
            | Self::Dismissed { agent_id, .. }
            | Self::AgentStep { agent_id, .. }
            | Self::RunStarted { agent_id }
            | Self::RunStopped { agent_id, .. } => agent_id,
            Self::TemplateAdded { template_id } => template_id,
            Self::AgentAdded { network_id, .. }
            | Self::AgentRemoved { network_id, .. }
            | Self::NetworkSummoned { network_id, .. }
            | Self::CollectiveStep { network_id, .. }
            | Self::NetworkDismissed { network_id, .. } => network_id,
            Self::TeamCreated { team_id, .. }
            | Self::TeamUpdated { team_id }
            | Self::TeamDeleted { team_id }
            | Self::TeamAgentAdded { team_id, .. }
            | Self::TeamAgentRemoved { team_id, .. } => team_id,
        }
    }
}

// ── EventSink trait ─────────────────────────────────────────────────────

/// A destination for events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SriaEvent);
}

/// Shared sink handle, cloned into managers, networks and runners.
pub type SharedSink = Arc<dyn EventSink>;

// ── NullSink ────────────────────────────────────────────────────────────

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &SriaEvent) {}
}

// ── JsonSink ────────────────────────────────────────────────────────────

/// Prints events to stdout as newline-delimited JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSink;

impl EventSink for JsonSink {
    fn emit(&self, event: &SriaEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            println!("{json}");
        }
    }
}

// ── TracingSink ─────────────────────────────────────────────────────────

/// Forwards events to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &SriaEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        tracing::debug!(
            event = event.name(),
            subject = event.subject(),
            payload = %payload,
            "sria event"
        );
    }
}

// ── VecSink ─────────────────────────────────────────────────────────────

/// Collects events in memory for testing.
#[derive(Debug, Default)]
pub struct VecSink {
    events: Mutex<Vec<SriaEvent>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events, oldest first.
    pub fn events(&self) -> Vec<SriaEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Names of all collected events, oldest first.
    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(SriaEvent::name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl EventSink for VecSink {
    fn emit(&self, event: &SriaEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_sink_collects_in_order() {
        let sink = VecSink::new();
        assert!(sink.is_empty());
        sink.emit(&SriaEvent::AgentDeleted {
            agent_id: "a".into(),
        });
        sink.emit(&SriaEvent::TemplateAdded {
            template_id: "t".into(),
        });
        assert_eq!(sink.names(), vec!["agent_deleted", "template_added"]);
        assert_eq!(sink.events()[1].subject(), "t");
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn serializes_with_event_tag() {
        let json = serde_json::to_value(SriaEvent::Summoned {
            agent_id: "a".into(),
            session_id: "s".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "summoned");
        assert_eq!(json["agent_id"], "a");
    }

    #[test]
    fn tag_matches_name() {
        let event = SriaEvent::TeamAgentRemoved {
            team_id: "t".into(),
            agent_id: "a".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
    }
}
