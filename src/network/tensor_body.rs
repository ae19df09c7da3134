//! The tensor body: the shared structure of a network's members.
//!
//! Members couple to each other in proportion to how much of their body they
//! share (Jaccard overlap of body primes). Phases recorded on a prime by one
//! member leak, damped by coupling, into every strongly-coupled member that
//! holds the same prime.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::CouplingConfig;
use crate::primes;
use crate::sria::engine::{self, EngineHandle};

/// One phase written into a member by propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseUpdate {
    pub source: usize,
    pub target: usize,
    pub prime: u64,
    pub phase: f64,
    pub coupling: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorBody {
    member_primes: Vec<Vec<u64>>,
    shared_primes: Vec<u64>,
    /// Symmetric, unit diagonal.
    coupling_matrix: Vec<Vec<f64>>,
    phase_alignment: BTreeMap<u64, f64>,
}

impl TensorBody {
    /// Build from each member's body primes, in member order.
    pub fn new(member_primes: Vec<Vec<u64>>) -> Self {
        let shared_primes = match member_primes.split_first() {
            Some((first, rest)) => first
                .iter()
                .copied()
                .filter(|p| rest.iter().all(|other| other.contains(p)))
                .collect(),
            None => Vec::new(),
        };

        let n = member_primes.len();
        let mut coupling_matrix = vec![vec![0.0; n]; n];
        for i in 0..n {
            coupling_matrix[i][i] = 1.0;
            for j in (i + 1)..n {
                let c = primes::jaccard(&member_primes[i], &member_primes[j]);
                coupling_matrix[i][j] = c;
                coupling_matrix[j][i] = c;
            }
        }

        Self {
            member_primes,
            shared_primes,
            coupling_matrix,
            phase_alignment: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.member_primes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_primes.is_empty()
    }

    /// Primes held by every member, in the first member's order.
    pub fn shared_primes(&self) -> &[u64] {
        &self.shared_primes
    }

    pub fn coupling_matrix(&self) -> &[Vec<f64>] {
        &self.coupling_matrix
    }

    /// Coupling between members `i` and `j`. Zero for out-of-range indices.
    pub fn coupling(&self, i: usize, j: usize) -> f64 {
        self.coupling_matrix
            .get(i)
            .and_then(|row| row.get(j))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn phase_alignment(&self) -> &BTreeMap<u64, f64> {
        &self.phase_alignment
    }

    /// Average each shared prime's latest phase over the members that have
    /// recorded one. Primes nobody has recorded are left out.
    pub fn compute_phase_alignment(&mut self, members: &[EngineHandle]) -> &BTreeMap<u64, f64> {
        let mut alignment = BTreeMap::new();
        for &p in &self.shared_primes {
            let phases: Vec<f64> = members
                .iter()
                .filter_map(|h| engine::lock(h).latest_phase(p))
                .collect();
            if !phases.is_empty() {
                alignment.insert(p, phases.iter().sum::<f64>() / phases.len() as f64);
            }
        }
        self.phase_alignment = alignment;
        &self.phase_alignment
    }

    /// Push `phase` on `prime` from `source` into every other member holding
    /// that prime whose coupling to the source exceeds the phase threshold.
    ///
    /// The source's engine must not be locked by the caller.
    pub fn propagate_phase(
        &self,
        members: &[EngineHandle],
        source: usize,
        prime: u64,
        phase: f64,
        config: &CouplingConfig,
    ) -> Vec<PhaseUpdate> {
        let mut updates = Vec::new();
        for (target, handle) in members.iter().enumerate() {
            if target == source {
                continue;
            }
            let coupling = self.coupling(source, target);
            if coupling <= config.phase_threshold {
                continue;
            }
            let damped = phase * coupling * config.phase_damping;
            if engine::lock(handle).record_phase(prime, damped) {
                updates.push(PhaseUpdate {
                    source,
                    target,
                    prime,
                    phase: damped,
                    coupling,
                });
            }
        }
        if !updates.is_empty() {
            tracing::debug!(source, prime, targets = updates.len(), "phase propagated");
        }
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::AgentDefinition;
    use crate::sria::SriaEngine;

    fn handles(bodies: &[&[u64]]) -> Vec<EngineHandle> {
        bodies
            .iter()
            .enumerate()
            .map(|(i, b)| {
                engine::handle(SriaEngine::new(AgentDefinition::new(
                    format!("a{i}"),
                    format!("A{i}"),
                    b.to_vec(),
                )))
            })
            .collect()
    }

    #[test]
    fn coupling_matrix_properties() {
        let body = TensorBody::new(vec![
            vec![2, 3, 5, 7, 11],
            vec![2, 3, 5, 7, 11],
            vec![13, 17],
            vec![2, 3, 13, 17, 19],
        ]);
        assert_eq!(body.coupling(0, 1), 1.0);
        assert_eq!(body.coupling(0, 2), 0.0);
        for i in 0..4 {
            assert_eq!(body.coupling(i, i), 1.0);
            for j in 0..4 {
                assert_eq!(body.coupling(i, j), body.coupling(j, i));
            }
        }
        // {2,3} shared of 8 distinct.
        assert!((body.coupling(0, 3) - 0.25).abs() < 1e-12);
        assert_eq!(body.coupling(0, 9), 0.0);
        assert!(body.shared_primes().is_empty());
    }

    #[test]
    fn shared_primes_keep_first_member_order() {
        let body = TensorBody::new(vec![vec![7, 3, 2], vec![2, 3, 7, 11]]);
        assert_eq!(body.shared_primes(), &[7, 3, 2]);
    }

    #[test]
    fn alignment_only_covers_recorded_primes() {
        let members = handles(&[&[2, 3, 5], &[2, 3, 7]]);
        let mut body = TensorBody::new(vec![vec![2, 3, 5], vec![2, 3, 7]]);
        assert!(body.compute_phase_alignment(&members).is_empty());

        engine::lock(&members[0]).record_phase(2, 1.0);
        engine::lock(&members[1]).record_phase(2, 3.0);
        let alignment = body.compute_phase_alignment(&members);
        assert_eq!(alignment.len(), 1);
        assert!((alignment[&2] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn propagation_respects_threshold_and_prime_ownership() {
        let members = handles(&[&[2, 3, 5], &[2, 3, 7], &[2, 41, 43, 47, 53, 59, 61, 67, 71, 73]]);
        let body = TensorBody::new(vec![
            vec![2, 3, 5],
            vec![2, 3, 7],
            vec![2, 41, 43, 47, 53, 59, 61, 67, 71, 73],
        ]);
        let cfg = CouplingConfig::default();
        // Member 1 couples at 0.5, member 2 at 1/12 (below 0.1).
        let updates = body.propagate_phase(&members, 0, 2, 1.0, &cfg);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].target, 1);
        assert!((updates[0].phase - 0.25).abs() < 1e-12);
        assert_eq!(engine::lock(&members[1]).latest_phase(2), Some(0.25));
        assert_eq!(engine::lock(&members[2]).latest_phase(2), None);

        // Prime 5 is not in member 1's body.
        assert!(body.propagate_phase(&members, 0, 5, 1.0, &cfg).is_empty());
    }
}
