//! Value types carried by an engine: sessions, beliefs, percepts, beacons,
//! and the reports returned from each lifecycle operation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::memory_field::Fragment;

use super::decision::Decision;
use super::lifecycle::LifecycleState;
use super::perception::PerceptionLayer;

// ---------------------------------------------------------------------------
// Quaternion
// ---------------------------------------------------------------------------

/// Orientation of the agent's internal state. Kept at unit norm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub const IDENTITY: Self = Self {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn norm(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Unit quaternion for a rotation of `angle` radians about `axis`.
    /// A zero axis yields the identity.
    pub fn from_axis_angle(axis: [f64; 3], angle: f64) -> Self {
        let len = (axis[0] * axis[0] + axis[1] * axis[1] + axis[2] * axis[2]).sqrt();
        if len < f64::EPSILON {
            return Self::IDENTITY;
        }
        let (s, c) = (angle / 2.0).sin_cos();
        Self {
            w: c,
            x: axis[0] / len * s,
            y: axis[1] / len * s,
            z: axis[2] / len * s,
        }
    }

    /// Hamilton product `self * rhs`.
    pub fn mul(&self, rhs: &Self) -> Self {
        Self {
            w: self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            x: self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            y: self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            z: self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        }
    }

    pub fn normalized(&self) -> Self {
        let n = self.norm();
        if n < f64::EPSILON {
            return Self::IDENTITY;
        }
        Self {
            w: self.w / n,
            x: self.x / n,
            y: self.y / n,
            z: self.z / n,
        }
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

// ---------------------------------------------------------------------------
// Beliefs
// ---------------------------------------------------------------------------

/// One entry of a belief distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Belief {
    pub state: String,
    pub probability: f64,
    /// Shannon contribution `-p ln p` of this entry.
    pub entropy: f64,
    pub prime_factors: Vec<u64>,
    /// Network member index this belief was propagated from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<usize>,
}

impl Belief {
    pub fn new(state: impl Into<String>, probability: f64, prime_factors: Vec<u64>) -> Self {
        Self {
            state: state.into(),
            probability,
            entropy: entropy_term(probability),
            prime_factors,
            source: None,
        }
    }
}

/// `-p ln p`, with `0 ln 0 = 0`.
pub fn entropy_term(p: f64) -> f64 {
    if p <= 0.0 { 0.0 } else { -p * p.ln() }
}

/// Renormalize a belief list to sum to 1 and refresh each entropy term.
///
/// Negative probabilities are clamped to zero. If nothing positive remains the
/// distribution becomes uniform.
pub fn renormalize_beliefs(beliefs: &mut [Belief]) {
    if beliefs.is_empty() {
        return;
    }
    for b in beliefs.iter_mut() {
        if !b.probability.is_finite() || b.probability < 0.0 {
            b.probability = 0.0;
        }
    }
    let total: f64 = beliefs.iter().map(|b| b.probability).sum();
    let uniform = 1.0 / beliefs.len() as f64;
    for b in beliefs.iter_mut() {
        b.probability = if total > 0.0 {
            b.probability / total
        } else {
            uniform
        };
        b.entropy = entropy_term(b.probability);
    }
}

/// Total Shannon entropy of a belief list.
pub fn belief_entropy(beliefs: &[Belief]) -> f64 {
    beliefs.iter().map(|b| entropy_term(b.probability)).sum()
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A candidate action. The decision rule reads only `type`, `entropy_cost` and
/// `confidence`; anything else rides along in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(rename = "entropyCost", alias = "entropy_cost")]
    pub entropy_cost: f64,
    pub confidence: f64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CandidateAction {
    pub fn new(action_type: impl Into<String>, entropy_cost: f64, confidence: f64) -> Self {
        Self {
            action_type: action_type.into(),
            entropy_cost,
            confidence,
            extra: BTreeMap::new(),
        }
    }
}

/// An action the engine took, as recorded in the session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: CandidateAction,
    pub free_energy: f64,
    pub epoch: u64,
    pub timestamp: u64,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-summon working state. Exists exactly while the engine is ACTIVE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub summoned_at: u64,
    #[serde(default)]
    pub context: Option<String>,
    pub current_beliefs: Vec<Belief>,
    /// Prime → attention weight; sums to 1.
    pub attention: BTreeMap<u64, f64>,
    pub entropy_trajectory: Vec<f64>,
    pub action_history: Vec<ActionRecord>,
}

impl Session {
    /// Highest-probability belief; ties resolve to the earliest entry.
    pub fn top_belief(&self) -> Option<&Belief> {
        self.current_beliefs.iter().fold(None, |best, b| match best {
            Some(current) if current.probability >= b.probability => Some(current),
            _ => Some(b),
        })
    }
}

// ---------------------------------------------------------------------------
// Percepts and resonance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedPercept {
    pub primes: Vec<u64>,
    /// Phase in `[0, 2π)` for each entry of `primes`.
    pub phases: Vec<f64>,
    /// Phase coherence in `[0, 1]`.
    pub magnitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Percept {
    pub raw: String,
    pub timestamp: u64,
    pub encoded: EncodedPercept,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResonanceKey {
    pub primes: Vec<u64>,
    pub hash: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResonanceVerification {
    pub verified: bool,
    pub matching_primes: Vec<u64>,
    /// `|matching| / |key.primes|`.
    pub strength: f64,
}

// ---------------------------------------------------------------------------
// Beacons and persisted state
// ---------------------------------------------------------------------------

/// Identity/epoch attestation. Appended, never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub fingerprint: String,
    pub epoch: u64,
    pub timestamp: u64,
    pub body_hash: String,
    pub signature: String,
}

/// The engine fields a storage adapter persists as the `SRIAState` entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SriaState {
    pub agent_id: String,
    pub memory_phases: BTreeMap<u64, Vec<f64>>,
    pub quaternion_state: Quaternion,
    pub current_epoch: u64,
    pub body_hash: String,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummonReport {
    pub agent_id: String,
    pub session_id: String,
    pub state: LifecycleState,
    pub beliefs: Vec<Belief>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceptionReport {
    pub percept: Percept,
    /// Layer with the strongest projected magnitude.
    pub layer: PerceptionLayer,
    pub magnitude: f64,
    /// Projected magnitude for every evaluated layer.
    pub layer_magnitudes: BTreeMap<String, f64>,
    /// Fragments recalled from an attached memory field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recalled: Vec<Fragment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningReport {
    pub epoch: u64,
    pub trajectory_length: usize,
    pub phases_recorded: Vec<u64>,
    pub belief_entropy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub agent_id: String,
    pub perception: PerceptionReport,
    pub decision: Decision,
    pub learning: LearningReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DismissReport {
    pub agent_id: String,
    pub beacon: Beacon,
    pub action_count: usize,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renormalize_sums_to_one() {
        let mut beliefs = vec![
            Belief::new("a", 2.0, vec![2]),
            Belief::new("b", 1.0, vec![3]),
            Belief::new("c", -1.0, vec![5]),
        ];
        renormalize_beliefs(&mut beliefs);
        let total: f64 = beliefs.iter().map(|b| b.probability).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(beliefs[2].probability, 0.0);
        assert!((beliefs[0].probability - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn renormalize_all_zero_is_uniform() {
        let mut beliefs = vec![Belief::new("a", 0.0, vec![]), Belief::new("b", 0.0, vec![])];
        renormalize_beliefs(&mut beliefs);
        assert!((beliefs[0].probability - 0.5).abs() < 1e-12);
    }

    #[test]
    fn quaternion_rotation_stays_unit() {
        let q = Quaternion::IDENTITY
            .mul(&Quaternion::from_axis_angle([1.0, 2.0, 3.0], 0.7))
            .mul(&Quaternion::from_axis_angle([0.0, 1.0, 0.0], 1.3));
        assert!((q.norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn candidate_action_accepts_camel_and_extra_fields() {
        let action: CandidateAction = serde_json::from_value(serde_json::json!({
            "type": "wait",
            "entropyCost": 0.1,
            "confidence": 0.9,
            "target": "peer-1"
        }))
        .unwrap();
        assert_eq!(action.action_type, "wait");
        assert_eq!(action.extra["target"], "peer-1");
    }

    #[test]
    fn top_belief_prefers_first_on_tie() {
        let session = Session {
            id: "s".into(),
            summoned_at: 0,
            context: None,
            current_beliefs: vec![Belief::new("a", 0.5, vec![]), Belief::new("b", 0.5, vec![])],
            attention: BTreeMap::new(),
            entropy_trajectory: vec![],
            action_history: vec![],
        };
        assert_eq!(session.top_belief().unwrap().state, "a");
    }
}
