//! Agent definitions and the template registry.
//!
//! An [`AgentDefinition`] is pure data: it describes an agent's identity
//! (its body primes) and dispositions, and is what gets persisted. The live
//! [`SriaEngine`](crate::sria::SriaEngine) is built from it on demand.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, SriaResult};
use crate::primes;
use crate::sria::PerceptionLayer;

/// Body primes given to agents created without any.
pub const DEFAULT_BODY_PRIMES: [u64; 5] = [2, 3, 5, 7, 11];

// ---------------------------------------------------------------------------
// Definition parts
// ---------------------------------------------------------------------------

/// How an engine perceives observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionConfig {
    /// Layers evaluated on every step; the strongest projection wins.
    #[serde(default = "default_layers")]
    pub layers: Vec<PerceptionLayer>,
    /// How many body primes an observation is projected onto by default.
    #[serde(default = "default_prime_count")]
    pub prime_count: usize,
    /// Minimum score for fragments recalled from an attached memory field.
    #[serde(default = "default_recall_threshold")]
    pub recall_threshold: f64,
}

fn default_layers() -> Vec<PerceptionLayer> {
    PerceptionLayer::ALL.to_vec()
}
fn default_prime_count() -> usize {
    5
}
fn default_recall_threshold() -> f64 {
    0.3
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            layers: default_layers(),
            prime_count: default_prime_count(),
            recall_threshold: default_recall_threshold(),
        }
    }
}

/// How strongly beliefs sharpen after each step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollapseDynamics {
    /// Scales the belief reweighting toward resonant states.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Beliefs below this probability are not reinforced.
    #[serde(default = "default_collapse_threshold")]
    pub threshold: f64,
}

fn default_temperature() -> f64 {
    1.0
}
fn default_collapse_threshold() -> f64 {
    0.01
}

impl Default for CollapseDynamics {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            threshold: default_collapse_threshold(),
        }
    }
}

/// Hard limits the decision rule respects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyConstraints {
    /// Action types the agent will never select.
    #[serde(default)]
    pub forbidden_actions: Vec<String>,
    /// Decisions above this free energy are flagged `over_budget`.
    #[serde(default)]
    pub max_free_energy: Option<f64>,
}

// ---------------------------------------------------------------------------
// AgentDefinition
// ---------------------------------------------------------------------------

/// The persisted description of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    /// Identity fingerprint. Fixed for the agent's life.
    pub body_primes: Vec<u64>,
    #[serde(default)]
    pub perception_config: PerceptionConfig,
    /// Belief state → prior weight.
    #[serde(default)]
    pub goal_priors: BTreeMap<String, f64>,
    /// Belief state → additive bias applied on top of the priors.
    #[serde(default)]
    pub attractor_biases: BTreeMap<String, f64>,
    #[serde(default)]
    pub collapse_dynamics: CollapseDynamics,
    #[serde(default)]
    pub safety_constraints: SafetyConstraints,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl AgentDefinition {
    /// Build a definition with defaults for everything but identity.
    pub fn new(id: impl Into<String>, name: impl Into<String>, body_primes: Vec<u64>) -> Self {
        let now = crate::now_millis();
        Self {
            id: id.into(),
            name: name.into(),
            body_primes,
            perception_config: PerceptionConfig::default(),
            goal_priors: BTreeMap::new(),
            attractor_biases: BTreeMap::new(),
            collapse_dynamics: CollapseDynamics::default(),
            safety_constraints: SafetyConstraints::default(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a patch in place. Identity fields are never touched.
    pub fn apply_patch(&mut self, patch: AgentPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(cfg) = patch.perception_config {
            self.perception_config = cfg;
        }
        if let Some(priors) = patch.goal_priors {
            self.goal_priors = priors;
        }
        if let Some(biases) = patch.attractor_biases {
            self.attractor_biases = biases;
        }
        if let Some(dynamics) = patch.collapse_dynamics {
            self.collapse_dynamics = dynamics;
        }
        if let Some(safety) = patch.safety_constraints {
            self.safety_constraints = safety;
        }
        if let Some(metadata) = patch.metadata {
            self.metadata.extend(metadata);
        }
        self.updated_at = crate::now_millis().max(self.updated_at + 1);
    }
}

// ---------------------------------------------------------------------------
// Create / patch / filter requests
// ---------------------------------------------------------------------------

/// Options for `AgentManager::create`. Unset fields come from the template,
/// then from defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateAgentOptions {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub body_primes: Option<Vec<u64>>,
    #[serde(default)]
    pub perception_config: Option<PerceptionConfig>,
    #[serde(default)]
    pub goal_priors: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub attractor_biases: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub collapse_dynamics: Option<CollapseDynamics>,
    #[serde(default)]
    pub safety_constraints: Option<SafetyConstraints>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A partial update for an existing definition.
///
/// Body primes are deliberately absent: they are the agent's identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub perception_config: Option<PerceptionConfig>,
    #[serde(default)]
    pub goal_priors: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub attractor_biases: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub collapse_dynamics: Option<CollapseDynamics>,
    #[serde(default)]
    pub safety_constraints: Option<SafetyConstraints>,
    /// Merged key-by-key into the existing metadata.
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

/// Filter for `AgentManager::list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFilter {
    /// Case-insensitive substring of the agent name.
    #[serde(default)]
    pub name: Option<String>,
    /// Every listed prime must be in the agent's body.
    #[serde(default)]
    pub primes: Option<Vec<u64>>,
}

impl AgentFilter {
    pub fn matches(&self, def: &AgentDefinition) -> bool {
        if let Some(ref needle) = self.name {
            if !def.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(ref primes) = self.primes {
            if !primes.iter().all(|p| def.body_primes.contains(p)) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// A partial definition that `create` can start from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentTemplate {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub body_primes: Option<Vec<u64>>,
    #[serde(default)]
    pub perception_config: Option<PerceptionConfig>,
    #[serde(default)]
    pub goal_priors: BTreeMap<String, f64>,
    #[serde(default)]
    pub attractor_biases: BTreeMap<String, f64>,
    #[serde(default)]
    pub collapse_dynamics: Option<CollapseDynamics>,
    #[serde(default)]
    pub safety_constraints: Option<SafetyConstraints>,
}

/// Mutable id → template registry owned by an `AgentManager`.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, AgentTemplate>,
}

impl TemplateRegistry {
    /// A registry holding only the built-in templates.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for template in builtin_templates() {
            registry.insert(template);
        }
        registry
    }

    /// A registry with no templates at all.
    pub fn empty() -> Self {
        Self {
            templates: BTreeMap::new(),
        }
    }

    /// Register or replace a template. Returns the previous one, if any.
    pub fn insert(&mut self, template: AgentTemplate) -> Option<AgentTemplate> {
        self.templates.insert(template.id.clone(), template)
    }

    pub fn get(&self, id: &str) -> Option<&AgentTemplate> {
        self.templates.get(id)
    }

    pub fn list(&self) -> Vec<&AgentTemplate> {
        self.templates.values().collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Resolve create options against the registry into a full definition.
    ///
    /// Explicit options win over template values, which win over defaults.
    pub fn build_definition(
        &self,
        id: String,
        opts: CreateAgentOptions,
    ) -> SriaResult<AgentDefinition> {
        let template = match opts.template {
            Some(ref tid) => Some(self.get(tid).ok_or_else(|| RegistryError::UnknownTemplate {
                template: tid.clone(),
            })?),
            None => None,
        };

        let body_primes = opts
            .body_primes
            .or_else(|| template.and_then(|t| t.body_primes.clone()))
            .unwrap_or_else(|| DEFAULT_BODY_PRIMES.to_vec());
        primes::validate_body_primes(&body_primes)
            .map_err(|message| RegistryError::InvalidBodyPrimes { message })?;

        let name = opts
            .name
            .or_else(|| template.and_then(|t| t.name.clone()))
            .unwrap_or_else(|| format!("agent-{}", &id[id.len().saturating_sub(6)..]));

        let mut def = AgentDefinition::new(id, name, body_primes);

        if let Some(t) = template {
            def.goal_priors = t.goal_priors.clone();
            def.attractor_biases = t.attractor_biases.clone();
            if let Some(ref cfg) = t.perception_config {
                def.perception_config = cfg.clone();
            }
            if let Some(ref dynamics) = t.collapse_dynamics {
                def.collapse_dynamics = dynamics.clone();
            }
            if let Some(ref safety) = t.safety_constraints {
                def.safety_constraints = safety.clone();
            }
            def.metadata
                .insert("template".into(), serde_json::Value::String(t.id.clone()));
        }

        if let Some(cfg) = opts.perception_config {
            def.perception_config = cfg;
        }
        if let Some(priors) = opts.goal_priors {
            def.goal_priors = priors;
        }
        if let Some(biases) = opts.attractor_biases {
            def.attractor_biases = biases;
        }
        if let Some(dynamics) = opts.collapse_dynamics {
            def.collapse_dynamics = dynamics;
        }
        if let Some(safety) = opts.safety_constraints {
            def.safety_constraints = safety;
        }
        def.metadata.extend(opts.metadata);

        Ok(def)
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// The templates every new registry starts with.
pub fn builtin_templates() -> Vec<AgentTemplate> {
    vec![
        AgentTemplate {
            id: "explorer".into(),
            name: Some("Explorer".into()),
            body_primes: Some(vec![2, 3, 5, 7, 11]),
            goal_priors: weights(&[("explore", 0.6), ("exploit", 0.3), ("rest", 0.1)]),
            attractor_biases: weights(&[("novelty", 0.2)]),
            collapse_dynamics: Some(CollapseDynamics {
                temperature: 1.5,
                threshold: 0.01,
            }),
            ..Default::default()
        },
        AgentTemplate {
            id: "analyst".into(),
            name: Some("Analyst".into()),
            body_primes: Some(vec![2, 5, 13, 17, 23]),
            goal_priors: weights(&[("analyze", 0.5), ("verify", 0.3), ("summarize", 0.2)]),
            collapse_dynamics: Some(CollapseDynamics {
                temperature: 0.7,
                threshold: 0.02,
            }),
            ..Default::default()
        },
        AgentTemplate {
            id: "guardian".into(),
            name: Some("Guardian".into()),
            body_primes: Some(vec![3, 7, 19, 29, 31]),
            goal_priors: weights(&[("protect", 0.6), ("observe", 0.4)]),
            attractor_biases: weights(&[("stability", 0.3)]),
            safety_constraints: Some(SafetyConstraints {
                forbidden_actions: vec!["memory_write".into()],
                max_free_energy: Some(0.8),
            }),
            ..Default::default()
        },
        AgentTemplate {
            id: "communicator".into(),
            name: Some("Communicator".into()),
            body_primes: Some(vec![2, 3, 37, 41, 43]),
            goal_priors: weights(&[("respond", 0.5), ("query", 0.3), ("listen", 0.2)]),
            perception_config: Some(PerceptionConfig {
                layers: vec![PerceptionLayer::Semantic, PerceptionLayer::Symbolic],
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_valid() {
        let registry = TemplateRegistry::with_builtins();
        assert_eq!(registry.len(), 4);
        for t in registry.list() {
            let primes = t.body_primes.as_ref().unwrap();
            assert!(primes::validate_body_primes(primes).is_ok(), "{}", t.id);
        }
    }

    #[test]
    fn explicit_options_override_template() {
        let registry = TemplateRegistry::with_builtins();
        let def = registry
            .build_definition(
                "agent_1".into(),
                CreateAgentOptions {
                    name: Some("Scout".into()),
                    template: Some("explorer".into()),
                    body_primes: Some(vec![13, 17]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(def.name, "Scout");
        assert_eq!(def.body_primes, vec![13, 17]);
        // Priors still come from the template.
        assert!(def.goal_priors.contains_key("explore"));
        assert_eq!(def.metadata["template"], "explorer");
    }

    #[test]
    fn unknown_template_is_an_error() {
        let registry = TemplateRegistry::with_builtins();
        let err = registry
            .build_definition(
                "agent_1".into(),
                CreateAgentOptions {
                    template: Some("nope".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(!err.is_routine());
    }

    #[test]
    fn rejects_non_prime_bodies() {
        let registry = TemplateRegistry::empty();
        let result = registry.build_definition(
            "agent_1".into(),
            CreateAgentOptions {
                body_primes: Some(vec![4, 6]),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn patch_preserves_identity() {
        let mut def = AgentDefinition::new("a", "Alpha", vec![2, 3]);
        let created = def.created_at;
        def.apply_patch(AgentPatch {
            name: Some("Beta".into()),
            metadata: Some(BTreeMap::from([("k".to_string(), serde_json::json!(1))])),
            ..Default::default()
        });
        assert_eq!(def.id, "a");
        assert_eq!(def.name, "Beta");
        assert_eq!(def.body_primes, vec![2, 3]);
        assert_eq!(def.created_at, created);
        assert!(def.updated_at > created);
        assert_eq!(def.metadata["k"], 1);
    }

    #[test]
    fn filter_by_name_and_primes() {
        let def = AgentDefinition::new("a", "Deep Scout", vec![2, 3, 5]);
        assert!(AgentFilter::default().matches(&def));
        assert!(AgentFilter {
            name: Some("scout".into()),
            primes: Some(vec![2, 5]),
        }
        .matches(&def));
        assert!(!AgentFilter {
            primes: Some(vec![7]),
            ..Default::default()
        }
        .matches(&def));
    }
}
