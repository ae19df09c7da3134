//! Agent registry and engine factory.
//!
//! [`AgentManager`] owns every [`AgentDefinition`] and lazily builds at most
//! one [`SriaEngine`] per agent id, handing out shared [`EngineHandle`]s so
//! networks and run loops drive the same engine the manager does.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EngineSettings;
use crate::definition::{
    AgentDefinition, AgentFilter, AgentPatch, AgentTemplate, CreateAgentOptions, TemplateRegistry,
};
use crate::error::{RegistryError, SriaResult};
use crate::event::{NullSink, SharedSink, SriaEvent};
use crate::memory_field::MemoryField;
use crate::sria::engine::{self, EngineHandle, SriaEngine, SriaSnapshot};
use crate::sria::{DismissReport, StepReport, SummonReport};
use crate::sria::CandidateAction;

/// Registry-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_agents: usize,
    /// Engines constructed so far.
    pub active_engines: usize,
    /// Engines currently ACTIVE.
    pub summoned_agents: usize,
    /// Prime → number of agents whose body contains it.
    pub prime_distribution: BTreeMap<u64, usize>,
}

pub struct AgentManager {
    definitions: BTreeMap<String, AgentDefinition>,
    engines: HashMap<String, EngineHandle>,
    templates: TemplateRegistry,
    settings: EngineSettings,
    memory_field: Option<Arc<dyn MemoryField>>,
    sink: SharedSink,
}

impl AgentManager {
    /// An empty manager with the built-in templates and no event sink.
    pub fn new() -> Self {
        Self {
            definitions: BTreeMap::new(),
            engines: HashMap::new(),
            templates: TemplateRegistry::with_builtins(),
            settings: EngineSettings::default(),
            memory_field: None,
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Attach a memory field to every engine, current and future.
    pub fn with_memory_field(mut self, field: Arc<dyn MemoryField>) -> Self {
        for handle in self.engines.values() {
            engine::lock(handle).attach_memory_field(Arc::clone(&field));
        }
        self.memory_field = Some(field);
        self
    }

    /// The sink events are emitted to.
    pub fn sink(&self) -> SharedSink {
        Arc::clone(&self.sink)
    }

    fn emit(&self, event: SriaEvent) {
        self.sink.emit(&event);
    }

    // ── Definitions ─────────────────────────────────────────────────────

    /// Create and register a new agent.
    pub fn create(&mut self, opts: CreateAgentOptions) -> SriaResult<AgentDefinition> {
        let inherits_perception = opts.perception_config.is_some()
            || opts
                .template
                .as_deref()
                .and_then(|t| self.templates.get(t))
                .is_some_and(|t| t.perception_config.is_some());

        let id = crate::new_id("agent");
        let mut def = self.templates.build_definition(id, opts)?;
        if !inherits_perception {
            def.perception_config.prime_count = self.settings.default_prime_count;
        }

        tracing::info!(
            agent = %def.id,
            name = %def.name,
            primes = ?def.body_primes,
            "agent created"
        );
        self.definitions.insert(def.id.clone(), def.clone());
        self.emit(SriaEvent::AgentCreated {
            agent_id: def.id.clone(),
            name: def.name.clone(),
            body_primes: def.body_primes.clone(),
        });
        Ok(def)
    }

    /// Register a definition loaded from storage. Emits nothing.
    pub fn restore_definition(&mut self, def: AgentDefinition) {
        self.definitions.insert(def.id.clone(), def);
    }

    pub fn get(&self, id: &str) -> Option<&AgentDefinition> {
        self.definitions.get(id)
    }

    /// Definitions matching `filter`, oldest first.
    pub fn list(&self, filter: &AgentFilter) -> Vec<&AgentDefinition> {
        let mut defs: Vec<&AgentDefinition> = self
            .definitions
            .values()
            .filter(|d| filter.matches(d))
            .collect();
        defs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        defs
    }

    /// Apply a patch. A live engine picks up the new definition immediately.
    pub fn update(&mut self, id: &str, patch: AgentPatch) -> Option<AgentDefinition> {
        let def = self.definitions.get_mut(id)?;
        def.apply_patch(patch);
        let def = def.clone();

        if let Some(handle) = self.engines.get(id) {
            engine::lock(handle).refresh_definition(def.clone());
        }
        tracing::info!(agent = %id, "agent updated");
        self.emit(SriaEvent::AgentUpdated {
            agent_id: id.to_string(),
        });
        Some(def)
    }

    /// Remove an agent, dismissing its engine first if it is active.
    pub fn delete(&mut self, id: &str) -> bool {
        if self.definitions.remove(id).is_none() {
            return false;
        }
        if let Some(handle) = self.engines.remove(id) {
            let mut engine = engine::lock(&handle);
            if engine.is_active() {
                if let Err(e) = engine.dismiss() {
                    tracing::warn!(agent = %id, error = %e, "dismiss before delete failed");
                }
            }
        }
        tracing::info!(agent = %id, "agent deleted");
        self.emit(SriaEvent::AgentDeleted {
            agent_id: id.to_string(),
        });
        true
    }

    // ── Engines ─────────────────────────────────────────────────────────

    /// The engine for `id`, built on first use. `None` for unknown ids.
    pub fn get_engine(&mut self, id: &str) -> Option<EngineHandle> {
        if let Some(handle) = self.engines.get(id) {
            return Some(Arc::clone(handle));
        }
        let def = self.definitions.get(id)?.clone();
        let mut engine = SriaEngine::new(def);
        if let Some(ref field) = self.memory_field {
            engine.attach_memory_field(Arc::clone(field));
        }
        let handle = engine::handle(engine);
        self.engines.insert(id.to_string(), Arc::clone(&handle));
        tracing::debug!(agent = %id, "engine constructed");
        Some(handle)
    }

    fn require_engine(&mut self, id: &str) -> SriaResult<EngineHandle> {
        self.get_engine(id).ok_or_else(|| {
            RegistryError::AgentNotFound {
                id: id.to_string(),
            }
            .into()
        })
    }

    pub fn summon(&mut self, id: &str) -> SriaResult<SummonReport> {
        self.summon_with_context(id, None)
    }

    pub fn summon_with_context(
        &mut self,
        id: &str,
        context: Option<String>,
    ) -> SriaResult<SummonReport> {
        let handle = self.require_engine(id)?;
        let report = engine::lock(&handle).summon_with_context(context)?;
        self.emit(SriaEvent::Summoned {
            agent_id: id.to_string(),
            session_id: report.session_id.clone(),
        });
        Ok(report)
    }

    pub fn dismiss(&mut self, id: &str) -> SriaResult<DismissReport> {
        let handle = self.require_engine(id)?;
        let report = engine::lock(&handle).dismiss()?;
        self.emit(SriaEvent::Dismissed {
            agent_id: id.to_string(),
            beacon: report.beacon.fingerprint.clone(),
            action_count: report.action_count,
        });
        Ok(report)
    }

    pub fn step(
        &mut self,
        id: &str,
        observation: &str,
        actions: &[CandidateAction],
    ) -> SriaResult<StepReport> {
        let handle = self.require_engine(id)?;
        let report = engine::lock(&handle).full_step(observation, actions)?;
        self.emit(SriaEvent::AgentStep {
            agent_id: id.to_string(),
            epoch: report.learning.epoch,
            action: report.decision.action.action_type.clone(),
            free_energy: report.decision.free_energy,
        });
        Ok(report)
    }

    /// Install an engine rebuilt from a snapshot, replacing any cached one.
    /// The snapshot's definition becomes the registered definition.
    pub fn restore_engine(&mut self, snapshot: SriaSnapshot) -> SriaResult<EngineHandle> {
        let mut engine = SriaEngine::deserialize(snapshot)?;
        if let Some(ref field) = self.memory_field {
            engine.attach_memory_field(Arc::clone(field));
        }
        let id = engine.id().to_string();
        self.definitions
            .insert(id.clone(), engine.definition().clone());
        let handle = engine::handle(engine);
        self.engines.insert(id.clone(), Arc::clone(&handle));
        tracing::debug!(agent = %id, "engine restored");
        Ok(handle)
    }

    /// Snapshots of every constructed engine, ordered by agent id.
    pub fn engine_snapshots(&self) -> Vec<SriaSnapshot> {
        let mut ids: Vec<&String> = self.engines.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| engine::lock(&self.engines[id]).serialize())
            .collect()
    }

    pub fn get_stats(&self) -> AgentStats {
        let mut prime_distribution = BTreeMap::new();
        for def in self.definitions.values() {
            for p in &def.body_primes {
                *prime_distribution.entry(*p).or_insert(0) += 1;
            }
        }
        AgentStats {
            total_agents: self.definitions.len(),
            active_engines: self.engines.len(),
            summoned_agents: self
                .engines
                .values()
                .filter(|h| engine::lock(h).is_active())
                .count(),
            prime_distribution,
        }
    }

    // ── Templates ───────────────────────────────────────────────────────

    /// Register or replace a template.
    pub fn add_template(&mut self, template: AgentTemplate) {
        let template_id = template.id.clone();
        self.templates.insert(template);
        tracing::info!(template = %template_id, "template added");
        self.emit(SriaEvent::TemplateAdded { template_id });
    }

    pub fn templates(&self) -> Vec<&AgentTemplate> {
        self.templates.list()
    }

    pub fn template(&self, id: &str) -> Option<&AgentTemplate> {
        self.templates.get(id)
    }
}

impl Default for AgentManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SriaError;
    use crate::event::VecSink;
    use crate::sria::LifecycleState;

    fn manager() -> (AgentManager, Arc<VecSink>) {
        let sink = Arc::new(VecSink::new());
        (AgentManager::new().with_sink(sink.clone()), sink)
    }

    fn wait() -> Vec<CandidateAction> {
        vec![CandidateAction::new("wait", 0.2, 0.5)]
    }

    #[test]
    fn create_defaults_and_events() {
        let (mut m, sink) = manager();
        let def = m.create(CreateAgentOptions::default()).unwrap();
        assert!(def.id.starts_with("agent_"));
        assert_eq!(def.body_primes, vec![2, 3, 5, 7, 11]);
        assert!(def.name.starts_with("agent-"));
        assert_eq!(sink.names(), vec!["agent_created"]);
    }

    #[test]
    fn settings_prime_count_applies_without_explicit_config() {
        let mut m = AgentManager::new().with_settings(EngineSettings {
            default_prime_count: 3,
        });
        let def = m.create(CreateAgentOptions::default()).unwrap();
        assert_eq!(def.perception_config.prime_count, 3);
    }

    #[test]
    fn engine_is_memoized() {
        let (mut m, _) = manager();
        let def = m.create(CreateAgentOptions::default()).unwrap();
        let a = m.get_engine(&def.id).unwrap();
        let b = m.get_engine(&def.id).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(m.get_engine("agent_missing").is_none());
    }

    #[test]
    fn unknown_ids_are_routine_errors() {
        let (mut m, sink) = manager();
        let err = m.summon("agent_missing").unwrap_err();
        assert!(err.is_routine());
        assert!(matches!(
            err,
            SriaError::Registry(RegistryError::AgentNotFound { .. })
        ));
        assert!(m.dismiss("agent_missing").unwrap_err().is_routine());
        assert!(m.step("agent_missing", "x", &wait()).unwrap_err().is_routine());
        assert!(sink.is_empty());
    }

    #[test]
    fn lifecycle_through_manager() {
        let (mut m, sink) = manager();
        let def = m.create(CreateAgentOptions::default()).unwrap();
        m.summon(&def.id).unwrap();
        assert!(m.summon(&def.id).unwrap_err().is_routine());
        m.step(&def.id, "hello", &wait()).unwrap();
        let report = m.dismiss(&def.id).unwrap();
        assert_eq!(report.action_count, 1);
        assert_eq!(
            sink.names(),
            vec!["agent_created", "summoned", "agent_step", "dismissed"]
        );
    }

    #[test]
    fn update_refreshes_live_engine_and_keeps_identity() {
        let (mut m, _) = manager();
        let def = m.create(CreateAgentOptions::default()).unwrap();
        let handle = m.get_engine(&def.id).unwrap();
        let updated = m
            .update(
                &def.id,
                AgentPatch {
                    name: Some("Renamed".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.body_primes, def.body_primes);
        assert_eq!(updated.created_at, def.created_at);
        assert_eq!(engine::lock(&handle).name(), "Renamed");
        assert!(m.update("agent_missing", AgentPatch::default()).is_none());
    }

    #[test]
    fn delete_dismisses_active_engine() {
        let (mut m, sink) = manager();
        let def = m.create(CreateAgentOptions::default()).unwrap();
        m.summon(&def.id).unwrap();
        let handle = m.get_engine(&def.id).unwrap();
        assert!(m.delete(&def.id));
        assert_eq!(engine::lock(&handle).lifecycle_state(), LifecycleState::Dormant);
        assert!(m.get(&def.id).is_none());
        assert!(!m.delete(&def.id));
        assert_eq!(sink.names().last(), Some(&"agent_deleted"));
    }

    #[test]
    fn list_filters() {
        let (mut m, _) = manager();
        m.create(CreateAgentOptions {
            name: Some("North Scout".into()),
            body_primes: Some(vec![2, 13]),
            ..Default::default()
        })
        .unwrap();
        m.create(CreateAgentOptions {
            name: Some("South Keeper".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(m.list(&AgentFilter::default()).len(), 2);
        let scouts = m.list(&AgentFilter {
            name: Some("scout".into()),
            ..Default::default()
        });
        assert_eq!(scouts.len(), 1);
        let with_13 = m.list(&AgentFilter {
            primes: Some(vec![13]),
            ..Default::default()
        });
        assert_eq!(with_13[0].name, "North Scout");
    }

    #[test]
    fn stats_count_primes_and_summoned() {
        let (mut m, _) = manager();
        let a = m.create(CreateAgentOptions::default()).unwrap();
        m.create(CreateAgentOptions {
            body_primes: Some(vec![2, 17]),
            ..Default::default()
        })
        .unwrap();
        m.summon(&a.id).unwrap();
        let stats = m.get_stats();
        assert_eq!(stats.total_agents, 2);
        assert_eq!(stats.active_engines, 1);
        assert_eq!(stats.summoned_agents, 1);
        assert_eq!(stats.prime_distribution[&2], 2);
        assert_eq!(stats.prime_distribution[&17], 1);
    }

    #[test]
    fn templates_and_restore() {
        let (mut m, sink) = manager();
        m.add_template(AgentTemplate {
            id: "sentry".into(),
            body_primes: Some(vec![53, 59]),
            ..Default::default()
        });
        assert_eq!(sink.names(), vec!["template_added"]);
        assert_eq!(m.templates().len(), 5);

        let def = m
            .create(CreateAgentOptions {
                template: Some("sentry".into()),
                ..Default::default()
            })
            .unwrap();
        m.summon(&def.id).unwrap();
        m.step(&def.id, "ping", &wait()).unwrap();
        let snapshot = engine::lock(&m.get_engine(&def.id).unwrap()).serialize();

        let mut fresh = AgentManager::new();
        let handle = fresh.restore_engine(snapshot).unwrap();
        assert_eq!(engine::lock(&handle).current_epoch(), 1);
        assert!(fresh.get(&def.id).is_some());
        fresh.step(&def.id, "pong", &wait()).unwrap();
    }
}
