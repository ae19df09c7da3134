//! [`SriaEngine`]: lifecycle, session, perception → decision → learning loop,
//! and beacons for a single agent.
//!
//! The engine is synchronous and performs no I/O. Callers that share an engine
//! across threads do so through an [`EngineHandle`]; calls into one engine must
//! still be serialized by the caller.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::definition::AgentDefinition;
use crate::error::{EngineError, SriaResult};
use crate::memory_field::MemoryField;
use crate::primes;

use super::decision::{self, Decision};
use super::lifecycle::{LifecycleState, Operation};
use super::perception::{self, LayerActivation, PerceptionLayer};
use super::types::{
    belief_entropy, renormalize_beliefs, ActionRecord, Beacon, Belief, CandidateAction,
    DismissReport, LearningReport, Percept, PerceptionReport, Quaternion, ResonanceKey,
    ResonanceVerification, Session, SriaState, StepReport, SummonReport,
};

/// Shared, lockable engine as cached by the agent manager and held by networks.
pub type EngineHandle = Arc<Mutex<SriaEngine>>;

/// Wrap an engine in a handle.
pub fn handle(engine: SriaEngine) -> EngineHandle {
    Arc::new(Mutex::new(engine))
}

/// Lock a handle, recovering the engine if a previous holder panicked.
pub fn lock(handle: &EngineHandle) -> MutexGuard<'_, SriaEngine> {
    handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Beliefs a session starts with when the definition has no usable priors.
const FALLBACK_BELIEFS: [(&str, f64); 3] = [("explore", 0.4), ("exploit", 0.4), ("rest", 0.2)];

/// Attention boost given to primes an observation resonated on.
const ATTENTION_RATE: f64 = 0.1;

/// Belief reinforcement rate for states sharing primes with the percept.
const BELIEF_RATE: f64 = 0.1;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Everything needed to restore an engine exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SriaSnapshot {
    pub definition: AgentDefinition,
    pub memory_phases: BTreeMap<u64, Vec<f64>>,
    pub quaternion_state: Quaternion,
    pub lifecycle_state: LifecycleState,
    pub current_epoch: u64,
    pub beacons: Vec<Beacon>,
    pub session: Option<Session>,
    #[serde(default)]
    pub layers: Vec<LayerActivation>,
    pub body_hash: String,
}

/// Read-only summary returned by [`SriaEngine::get_state`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub id: String,
    pub name: String,
    pub body_primes: Vec<u64>,
    pub body_hash: String,
    pub lifecycle_state: LifecycleState,
    pub current_epoch: u64,
    pub quaternion_state: Quaternion,
    pub beacon_count: usize,
    pub active_layers: Vec<PerceptionLayer>,
    pub session: Option<Session>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SriaEngine {
    definition: AgentDefinition,
    memory_phases: BTreeMap<u64, Vec<f64>>,
    quaternion: Quaternion,
    lifecycle: LifecycleState,
    current_epoch: u64,
    beacons: Vec<Beacon>,
    session: Option<Session>,
    layers: BTreeMap<PerceptionLayer, LayerActivation>,
    memory_field: Option<Arc<dyn MemoryField>>,
}

impl SriaEngine {
    /// A dormant engine for `definition`.
    pub fn new(definition: AgentDefinition) -> Self {
        Self {
            definition,
            memory_phases: BTreeMap::new(),
            quaternion: Quaternion::IDENTITY,
            lifecycle: LifecycleState::Dormant,
            current_epoch: 0,
            beacons: Vec::new(),
            session: None,
            layers: BTreeMap::new(),
            memory_field: None,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn body_primes(&self) -> &[u64] {
        &self.definition.body_primes
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    pub fn beacons(&self) -> &[Beacon] {
        &self.beacons
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn memory_phases(&self) -> &BTreeMap<u64, Vec<f64>> {
        &self.memory_phases
    }

    pub fn quaternion(&self) -> Quaternion {
        self.quaternion
    }

    /// Whether `prime` is part of this agent's body.
    pub fn holds_prime(&self, prime: u64) -> bool {
        self.definition.body_primes.contains(&prime)
    }

    /// Most recent phase recorded for `prime`.
    pub fn latest_phase(&self, prime: u64) -> Option<f64> {
        self.memory_phases.get(&prime).and_then(|v| v.last().copied())
    }

    /// Refresh the non-identity parts of the definition. Body primes and id
    /// are kept.
    pub fn refresh_definition(&mut self, mut definition: AgentDefinition) {
        definition.id = self.definition.id.clone();
        definition.body_primes = self.definition.body_primes.clone();
        definition.created_at = self.definition.created_at;
        self.definition = definition;
    }

    /// Attach a memory field consulted during perception and written during learning.
    pub fn attach_memory_field(&mut self, field: Arc<dyn MemoryField>) {
        self.memory_field = Some(field);
    }

    pub fn detach_memory_field(&mut self) -> Option<Arc<dyn MemoryField>> {
        self.memory_field.take()
    }

    // ── Identity & resonance ────────────────────────────────────────────

    /// Stable fingerprint of the body primes.
    pub fn generate_body_hash(&self) -> String {
        format!("{:016x}", primes::hash_primes(&self.definition.body_primes))
    }

    pub fn compute_resonance_key(&self, text: &str) -> ResonanceKey {
        perception::resonance_key(text, crate::now_millis())
    }

    /// A key resonates when it shares at least one prime with the body.
    pub fn verify_resonance(&self, key: &ResonanceKey) -> ResonanceVerification {
        let matching = primes::intersect_ordered(&key.primes, &self.definition.body_primes);
        let strength = if key.primes.is_empty() {
            0.0
        } else {
            matching.len() as f64 / key.primes.len() as f64
        };
        ResonanceVerification {
            verified: !matching.is_empty(),
            matching_primes: matching,
            strength,
        }
    }

    /// Project `text` onto `primes`, or onto the first `prime_count` body
    /// primes when none are given.
    pub fn encode_percept(&self, text: &str, primes: Option<&[u64]>) -> Percept {
        let default_primes: Vec<u64>;
        let primes = match primes {
            Some(p) => p,
            None => {
                default_primes = self
                    .definition
                    .body_primes
                    .iter()
                    .take(self.definition.perception_config.prime_count.max(1))
                    .copied()
                    .collect();
                &default_primes
            }
        };
        Percept {
            raw: text.to_string(),
            timestamp: crate::now_millis(),
            encoded: perception::encode(text, primes),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn summon(&mut self) -> SriaResult<SummonReport> {
        self.summon_with_context(None)
    }

    /// Summon with a context tag recorded on the session.
    pub fn summon_with_context(&mut self, context: Option<String>) -> SriaResult<SummonReport> {
        let next = self.lifecycle.transition(Operation::Summon)?;

        let session = Session {
            id: crate::new_id("session"),
            summoned_at: crate::now_millis(),
            context,
            current_beliefs: self.seed_beliefs(),
            attention: self.uniform_attention(),
            entropy_trajectory: Vec::new(),
            action_history: Vec::new(),
        };
        let report = SummonReport {
            agent_id: self.definition.id.clone(),
            session_id: session.id.clone(),
            state: next,
            beliefs: session.current_beliefs.clone(),
        };

        self.session = Some(session);
        self.lifecycle = next;
        tracing::info!(
            agent = %self.definition.id,
            session = %report.session_id,
            beliefs = report.beliefs.len(),
            "agent summoned"
        );
        Ok(report)
    }

    /// Beliefs from goal priors plus attractor biases, falling back to a
    /// built-in distribution when nothing positive is configured.
    fn seed_beliefs(&self) -> Vec<Belief> {
        let mut weights: BTreeMap<&str, f64> = BTreeMap::new();
        for (state, w) in &self.definition.goal_priors {
            *weights.entry(state.as_str()).or_default() += w;
        }
        for (state, b) in &self.definition.attractor_biases {
            *weights.entry(state.as_str()).or_default() += b;
        }
        weights.retain(|_, w| w.is_finite() && *w > 0.0);

        let seeded: Vec<(&str, f64)> = if weights.is_empty() {
            FALLBACK_BELIEFS.to_vec()
        } else {
            weights.into_iter().collect()
        };

        let body = &self.definition.body_primes;
        let mut beliefs: Vec<Belief> = seeded
            .into_iter()
            .enumerate()
            .map(|(i, (state, w))| Belief::new(state, w, vec![body[i % body.len()]]))
            .collect();
        renormalize_beliefs(&mut beliefs);
        beliefs
    }

    fn uniform_attention(&self) -> BTreeMap<u64, f64> {
        let body = &self.definition.body_primes;
        let w = 1.0 / body.len() as f64;
        body.iter().map(|p| (*p, w)).collect()
    }

    /// Run one perceive → decide → learn cycle.
    pub fn full_step(
        &mut self,
        observation: &str,
        candidates: &[CandidateAction],
    ) -> SriaResult<StepReport> {
        self.lifecycle.transition(Operation::Step)?;

        let perception = self.perceive(observation)?;
        let decision = decision::select_action(candidates, &self.definition.safety_constraints)?;
        if decision.over_budget {
            tracing::warn!(
                agent = %self.definition.id,
                free_energy = decision.free_energy,
                "decision exceeds the free-energy budget"
            );
        }
        let learning = self.learn(observation, &perception, &decision)?;

        tracing::debug!(
            agent = %self.definition.id,
            epoch = learning.epoch,
            layer = %perception.layer,
            action = %decision.action.action_type,
            free_energy = decision.free_energy,
            "step complete"
        );

        Ok(StepReport {
            agent_id: self.definition.id.clone(),
            perception,
            decision,
            learning,
        })
    }

    fn perceive(&mut self, observation: &str) -> SriaResult<PerceptionReport> {
        let percept = self.encode_percept(observation, None);

        let layers = if self.definition.perception_config.layers.is_empty() {
            PerceptionLayer::ALL.to_vec()
        } else {
            self.definition.perception_config.layers.clone()
        };

        let mut layer_magnitudes = BTreeMap::new();
        let mut best: Option<(PerceptionLayer, f64)> = None;
        for layer in layers {
            let activation = self.activate_layer(layer);
            let magnitude = perception::project(observation, layer, &activation.primes);
            layer_magnitudes.insert(layer.label().to_string(), magnitude);
            match best {
                Some((_, m)) if magnitude <= m => {}
                _ => best = Some((layer, magnitude)),
            }
        }
        let (layer, magnitude) = best.unwrap_or((PerceptionLayer::Data, percept.encoded.magnitude));

        let recalled = match self.memory_field {
            Some(ref field) => field
                .query(
                    &self.definition.id,
                    observation,
                    self.definition.perception_config.recall_threshold,
                )
                .unwrap_or_else(|e| {
                    tracing::warn!(agent = %self.definition.id, error = %e, "memory field recall failed");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        Ok(PerceptionReport {
            percept,
            layer,
            magnitude,
            layer_magnitudes,
            recalled,
        })
    }

    fn learn(
        &mut self,
        observation: &str,
        perception: &PerceptionReport,
        decision: &Decision,
    ) -> SriaResult<LearningReport> {
        let encoded = &perception.percept.encoded;
        let magnitude = encoded.magnitude;

        // Phases for the percept primes that belong to the body.
        let mut phases_recorded = Vec::new();
        for (p, phase) in encoded.primes.iter().zip(&encoded.phases) {
            if self.holds_prime(*p) {
                self.memory_phases.entry(*p).or_default().push(*phase);
                phases_recorded.push(*p);
            }
        }

        let epoch = self.current_epoch + 1;
        let dynamics = self.definition.collapse_dynamics.clone();
        let session = self.session.as_mut().ok_or_else(|| EngineError::InvalidArgument {
            message: "active engine has no session".into(),
        })?;

        session.entropy_trajectory.push(decision.free_energy);
        session.action_history.push(ActionRecord {
            action: decision.action.clone(),
            free_energy: decision.free_energy,
            epoch,
            timestamp: crate::now_millis(),
        });

        // Attention drifts toward the primes that just resonated.
        for p in &phases_recorded {
            *session.attention.entry(*p).or_default() += ATTENTION_RATE * magnitude;
        }
        let total: f64 = session.attention.values().sum();
        if total > 0.0 {
            for w in session.attention.values_mut() {
                *w /= total;
            }
        }

        // Beliefs sharing primes with the percept are reinforced.
        for belief in session.current_beliefs.iter_mut() {
            let resonant = belief
                .prime_factors
                .iter()
                .any(|p| encoded.primes.contains(p));
            if resonant && belief.probability >= dynamics.threshold {
                belief.probability *= 1.0 + dynamics.temperature * magnitude * BELIEF_RATE;
            }
        }
        renormalize_beliefs(&mut session.current_beliefs);
        let entropy = belief_entropy(&session.current_beliefs);
        let trajectory_length = session.entropy_trajectory.len();

        // Rotate the internal state by an angle that shrinks as the decision
        // gets cheaper.
        let axis_phase = encoded.phases.first().copied().unwrap_or(0.0);
        let rotation = Quaternion::from_axis_angle(
            [axis_phase.cos(), axis_phase.sin(), magnitude],
            0.1 * decision.free_energy.min(1.0),
        );
        self.quaternion = self.quaternion.mul(&rotation).normalized();
        self.current_epoch = epoch;

        if let Some(ref field) = self.memory_field {
            if let Err(e) = field.store(&self.definition.id, observation, magnitude) {
                tracing::warn!(agent = %self.definition.id, error = %e, "memory field store failed");
            }
        }

        Ok(LearningReport {
            epoch,
            trajectory_length,
            phases_recorded,
            belief_entropy: entropy,
        })
    }

    /// End the session, leaving a beacon behind.
    pub fn dismiss(&mut self) -> SriaResult<DismissReport> {
        let next = self.lifecycle.transition(Operation::Dismiss)?;

        let beacon = self.generate_beacon_fingerprint();
        let (action_count, summoned_at) = self
            .session
            .take()
            .map(|s| (s.action_history.len(), s.summoned_at))
            .unwrap_or((0, crate::now_millis()));
        self.lifecycle = next;

        let report = DismissReport {
            agent_id: self.definition.id.clone(),
            beacon,
            action_count,
            duration_ms: crate::now_millis().saturating_sub(summoned_at),
        };
        tracing::info!(
            agent = %self.definition.id,
            actions = report.action_count,
            beacon = %report.beacon.fingerprint,
            "agent dismissed"
        );
        Ok(report)
    }

    // ── Layers ──────────────────────────────────────────────────────────

    /// Activate a perception layer by name. Repeat calls are served from cache.
    pub fn summon_layer(&mut self, layer: &str) -> SriaResult<LayerActivation> {
        let layer: PerceptionLayer = layer.parse()?;
        Ok(self.activate_layer(layer))
    }

    fn activate_layer(&mut self, layer: PerceptionLayer) -> LayerActivation {
        if let Some(cached) = self.layers.get(&layer) {
            return LayerActivation {
                from_cache: true,
                ..cached.clone()
            };
        }
        let activation = LayerActivation {
            layer,
            primes: layer.select_primes(
                &self.definition.body_primes,
                self.definition.perception_config.prime_count,
            ),
            gain: layer.gain(),
            activated_at: crate::now_millis(),
            from_cache: false,
        };
        self.layers.insert(layer, activation.clone());
        activation
    }

    // ── Beacons ─────────────────────────────────────────────────────────

    /// Append and return a beacon for the current epoch.
    pub fn generate_beacon_fingerprint(&mut self) -> Beacon {
        let body_hash = self.generate_body_hash();
        let timestamp = crate::now_millis();

        let mut h = primes::fnv1a(body_hash.as_bytes());
        h = primes::fnv1a_seeded(h, &self.current_epoch.to_le_bytes());
        h = primes::fnv1a_seeded(h, &(self.beacons.len() as u64).to_le_bytes());
        h = primes::fnv1a_seeded(h, &timestamp.to_le_bytes());
        let fingerprint = format!("beacon_{h:016x}");

        let signature = format!(
            "{:016x}",
            primes::fnv1a_seeded(primes::fnv1a(fingerprint.as_bytes()), body_hash.as_bytes())
        );

        let beacon = Beacon {
            fingerprint,
            epoch: self.current_epoch,
            timestamp,
            body_hash,
            signature,
        };
        self.beacons.push(beacon.clone());
        beacon
    }

    // ── Coupling hooks ──────────────────────────────────────────────────

    /// Append a phase for `prime`. Returns false if the prime is not in the body.
    pub fn record_phase(&mut self, prime: u64, phase: f64) -> bool {
        if !self.holds_prime(prime) {
            return false;
        }
        self.memory_phases.entry(prime).or_default().push(phase);
        true
    }

    /// Add a belief to the current session, merging into an existing entry of
    /// the same state, then renormalize. Returns false when dormant.
    pub fn inject_belief(&mut self, belief: Belief) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        match session
            .current_beliefs
            .iter_mut()
            .find(|b| b.state == belief.state)
        {
            Some(existing) => {
                existing.probability += belief.probability;
                for p in belief.prime_factors {
                    if !existing.prime_factors.contains(&p) {
                        existing.prime_factors.push(p);
                    }
                }
                existing.source = belief.source;
            }
            None => session.current_beliefs.push(belief),
        }
        renormalize_beliefs(&mut session.current_beliefs);
        true
    }

    // ── State & persistence ─────────────────────────────────────────────

    pub fn get_state(&self) -> EngineState {
        EngineState {
            id: self.definition.id.clone(),
            name: self.definition.name.clone(),
            body_primes: self.definition.body_primes.clone(),
            body_hash: self.generate_body_hash(),
            lifecycle_state: self.lifecycle,
            current_epoch: self.current_epoch,
            quaternion_state: self.quaternion,
            beacon_count: self.beacons.len(),
            active_layers: self.layers.keys().copied().collect(),
            session: self.session.clone(),
        }
    }

    /// The `SRIAState` persistence entity.
    pub fn sria_state(&self) -> SriaState {
        SriaState {
            agent_id: self.definition.id.clone(),
            memory_phases: self.memory_phases.clone(),
            quaternion_state: self.quaternion,
            current_epoch: self.current_epoch,
            body_hash: self.generate_body_hash(),
        }
    }

    pub fn serialize(&self) -> SriaSnapshot {
        SriaSnapshot {
            definition: self.definition.clone(),
            memory_phases: self.memory_phases.clone(),
            quaternion_state: self.quaternion,
            lifecycle_state: self.lifecycle,
            current_epoch: self.current_epoch,
            beacons: self.beacons.clone(),
            session: self.session.clone(),
            layers: self.layers.values().cloned().collect(),
            body_hash: self.generate_body_hash(),
        }
    }

    /// Rebuild an engine from a snapshot. The snapshot must be internally
    /// consistent: a session exactly when ACTIVE, and a body hash matching
    /// its primes.
    pub fn deserialize(snapshot: SriaSnapshot) -> SriaResult<Self> {
        if snapshot.lifecycle_state.is_active() != snapshot.session.is_some() {
            return Err(EngineError::InvalidArgument {
                message: format!(
                    "snapshot for \"{}\" is {} but {} a session",
                    snapshot.definition.id,
                    snapshot.lifecycle_state,
                    if snapshot.session.is_some() { "has" } else { "lacks" }
                ),
            }
            .into());
        }
        primes::validate_body_primes(&snapshot.definition.body_primes).map_err(|message| {
            EngineError::InvalidArgument { message }
        })?;

        let engine = Self {
            definition: snapshot.definition,
            memory_phases: snapshot.memory_phases,
            quaternion: snapshot.quaternion_state,
            lifecycle: snapshot.lifecycle_state,
            current_epoch: snapshot.current_epoch,
            beacons: snapshot.beacons,
            session: snapshot.session,
            layers: snapshot
                .layers
                .into_iter()
                .map(|l| (l.layer, LayerActivation { from_cache: false, ..l }))
                .collect(),
            memory_field: None,
        };
        if engine.generate_body_hash() != snapshot.body_hash {
            return Err(EngineError::InvalidArgument {
                message: format!("body hash mismatch for \"{}\"", engine.definition.id),
            }
            .into());
        }
        Ok(engine)
    }
}

impl std::fmt::Debug for SriaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SriaEngine")
            .field("id", &self.definition.id)
            .field("lifecycle", &self.lifecycle)
            .field("epoch", &self.current_epoch)
            .field("beacons", &self.beacons.len())
            .field("memory_field", &self.memory_field.is_some())
            .finish()
    }
}
