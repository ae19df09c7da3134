//! Deterministic percept encoding and perception layers.
//!
//! Text is NFKC-normalized and lowercased, then projected onto a list of
//! primes: each prime gets a phase derived from a position-weighted codepoint
//! sum modulo that prime. The percept magnitude is the phase coherence
//! `|mean(e^{iφ})|`, so it is 1 when all phases agree and near 0 when they
//! scatter.

use std::collections::BTreeSet;
use std::f64::consts::TAU;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::error::EngineError;
use crate::primes::{self, PRIME_TABLE};

use super::types::{EncodedPercept, ResonanceKey};

/// Number of table primes sampled into a resonance key (before dedup).
pub const KEY_WIDTH: u8 = 5;

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

/// A named view over an agent's body primes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerceptionLayer {
    /// The leading body primes, unweighted.
    Data,
    /// Even-indexed body primes.
    Semantic,
    /// Odd-indexed body primes.
    Symbolic,
    /// The trailing body primes.
    Meta,
}

impl PerceptionLayer {
    pub const ALL: [PerceptionLayer; 4] = [
        PerceptionLayer::Data,
        PerceptionLayer::Semantic,
        PerceptionLayer::Symbolic,
        PerceptionLayer::Meta,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Semantic => "semantic",
            Self::Symbolic => "symbolic",
            Self::Meta => "meta",
        }
    }

    /// Gain applied to the layer's projected magnitude. Breaks ties between
    /// layers that see the same primes in favor of the lower layer.
    pub fn gain(&self) -> f64 {
        match self {
            Self::Data => 1.0,
            Self::Semantic => 0.95,
            Self::Symbolic => 0.9,
            Self::Meta => 0.85,
        }
    }

    /// The body primes this layer projects onto. Never empty for a non-empty body.
    pub fn select_primes(&self, body_primes: &[u64], prime_count: usize) -> Vec<u64> {
        let count = prime_count.max(1);
        let selected: Vec<u64> = match self {
            Self::Data => body_primes.iter().take(count).copied().collect(),
            Self::Semantic => body_primes.iter().step_by(2).copied().collect(),
            Self::Symbolic => body_primes.iter().skip(1).step_by(2).copied().collect(),
            Self::Meta => body_primes
                .iter()
                .skip(body_primes.len().saturating_sub(count))
                .copied()
                .collect(),
        };
        if selected.is_empty() {
            body_primes.to_vec()
        } else {
            selected
        }
    }
}

impl fmt::Display for PerceptionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PerceptionLayer {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .find(|l| l.label() == wanted)
            .copied()
            .ok_or_else(|| EngineError::UnknownLayer {
                layer: s.to_string(),
            })
    }
}

/// A layer that has been summoned on an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerActivation {
    pub layer: PerceptionLayer,
    pub primes: Vec<u64>,
    pub gain: f64,
    pub activated_at: u64,
    /// Whether this activation was served from the engine's layer cache.
    #[serde(default)]
    pub from_cache: bool,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Canonical form of observed text.
pub fn normalize_text(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

/// Phase of `text` on prime `p`, in `[0, 2π)`.
fn phase_for(normalized: &str, text_hash: u64, p: u64) -> f64 {
    let weighted = normalized
        .chars()
        .enumerate()
        .fold(0u64, |acc, (i, c)| {
            let term = (u64::from(u32::from(c)) % p) * ((i as u64 + 1) % p) % p;
            (acc + term) % p
        });
    let residue = (weighted + text_hash % p) % p;
    TAU * residue as f64 / p as f64
}

/// Phase coherence of a set of phases: `|Σ e^{iφ}| / n`.
pub fn coherence(phases: &[f64]) -> f64 {
    if phases.is_empty() {
        return 0.0;
    }
    let (re, im) = phases
        .iter()
        .fold((0.0, 0.0), |(re, im), phi| (re + phi.cos(), im + phi.sin()));
    (re * re + im * im).sqrt() / phases.len() as f64
}

/// Project `text` onto `primes`.
pub fn encode(text: &str, primes: &[u64]) -> EncodedPercept {
    let normalized = normalize_text(text);
    let text_hash = primes::fnv1a(normalized.as_bytes());
    let phases: Vec<f64> = primes
        .iter()
        .map(|p| phase_for(&normalized, text_hash, (*p).max(2)))
        .collect();
    let magnitude = coherence(&phases);
    EncodedPercept {
        primes: primes.to_vec(),
        phases,
        magnitude,
    }
}

/// Magnitude of `text` projected through `layer`.
pub fn project(text: &str, layer: PerceptionLayer, layer_primes: &[u64]) -> f64 {
    encode(text, layer_primes).magnitude * layer.gain()
}

/// Resonance key for `text`: a stable hash plus primes sampled from
/// [`PRIME_TABLE`]. Depends on nothing but the text.
pub fn resonance_key(text: &str, timestamp: u64) -> ResonanceKey {
    let normalized = normalize_text(text);
    let hash = primes::fnv1a(normalized.as_bytes());
    let sampled: BTreeSet<u64> = (0..KEY_WIDTH)
        .map(|i| {
            let h = primes::fnv1a_seeded(hash, &[i]);
            PRIME_TABLE[(h % PRIME_TABLE.len() as u64) as usize]
        })
        .collect();
    ResonanceKey {
        primes: sampled.into_iter().collect(),
        hash: format!("{hash:016x}"),
        timestamp,
    }
}
