//! Coupled policy: per-member action distributions that learn together.
//!
//! A reward for one member's action nudges that member's weight for the
//! action, and a damped copy of the reward reaches every member coupled to
//! it strongly enough. Each member's weights are a probability distribution
//! after every update.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::CouplingConfig;
use crate::error::{RegistryError, SriaResult};

use super::tensor_body::TensorBody;

/// One applied weight change. The log is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub member: usize,
    pub action_type: String,
    pub reward: f64,
    /// Member whose reward was propagated, if this is a coupled update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagated_from: Option<usize>,
    /// Probability of `action_type` after renormalization.
    pub probability: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoupledPolicy {
    weights: Vec<BTreeMap<String, f64>>,
    updates: Vec<PolicyUpdate>,
}

impl CoupledPolicy {
    /// A policy for `members` members with no action types yet.
    pub fn new(members: usize) -> Self {
        Self {
            weights: vec![BTreeMap::new(); members],
            updates: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Reset every member to a uniform distribution over `action_types`.
    pub fn initialize_weights(&mut self, action_types: &[String]) {
        let uniform = if action_types.is_empty() {
            0.0
        } else {
            1.0 / action_types.len() as f64
        };
        for member in self.weights.iter_mut() {
            *member = action_types
                .iter()
                .map(|t| (t.clone(), uniform))
                .collect();
        }
    }

    /// A copy of member `i`'s distribution.
    pub fn get_action_probabilities(&self, i: usize) -> SriaResult<BTreeMap<String, f64>> {
        self.weights.get(i).cloned().ok_or_else(|| {
            RegistryError::MemberOutOfRange {
                index: i,
                len: self.weights.len(),
            }
            .into()
        })
    }

    /// Probability member `i` assigns to `action_type`; zero if unknown.
    pub fn probability(&self, i: usize, action_type: &str) -> f64 {
        self.weights
            .get(i)
            .and_then(|w| w.get(action_type))
            .copied()
            .unwrap_or(0.0)
    }

    /// Every member's distribution, in member order.
    pub fn weights(&self) -> &[BTreeMap<String, f64>] {
        &self.weights
    }

    /// Replace all weights, e.g. when restoring a snapshot. Ignored if the
    /// member count differs.
    pub fn restore_weights(&mut self, weights: Vec<BTreeMap<String, f64>>) -> bool {
        if weights.len() != self.weights.len() {
            return false;
        }
        self.weights = weights;
        true
    }

    pub fn updates(&self) -> &[PolicyUpdate] {
        &self.updates
    }

    /// Reward member `i` for `action_type` and propagate to coupled members.
    /// Returns the updates applied, the direct one first.
    pub fn update(
        &mut self,
        i: usize,
        action_type: &str,
        reward: f64,
        body: &TensorBody,
        config: &CouplingConfig,
    ) -> SriaResult<Vec<PolicyUpdate>> {
        if i >= self.weights.len() {
            return Err(RegistryError::MemberOutOfRange {
                index: i,
                len: self.weights.len(),
            }
            .into());
        }

        let start = self.updates.len();
        self.apply(i, action_type, reward, None, config.learning_rate);
        for j in 0..self.weights.len() {
            if j == i {
                continue;
            }
            let coupling = body.coupling(i, j);
            if coupling > config.policy_threshold {
                self.apply(
                    j,
                    action_type,
                    reward * coupling * config.policy_damping,
                    Some(i),
                    config.learning_rate,
                );
            }
        }
        Ok(self.updates[start..].to_vec())
    }

    fn apply(
        &mut self,
        member: usize,
        action_type: &str,
        reward: f64,
        propagated_from: Option<usize>,
        learning_rate: f64,
    ) {
        let weights = &mut self.weights[member];
        let w = weights.entry(action_type.to_string()).or_insert(0.0);
        *w = (*w + learning_rate * reward * (1.0 - *w)).max(0.0);
        normalize(weights);

        self.updates.push(PolicyUpdate {
            member,
            action_type: action_type.to_string(),
            reward,
            propagated_from,
            probability: weights.get(action_type).copied().unwrap_or(0.0),
            timestamp: crate::now_millis(),
        });
    }
}

/// Clamp to non-negative and scale to sum 1; uniform if nothing positive remains.
fn normalize(weights: &mut BTreeMap<String, f64>) {
    for w in weights.values_mut() {
        if !w.is_finite() || *w < 0.0 {
            *w = 0.0;
        }
    }
    let total: f64 = weights.values().sum();
    let uniform = 1.0 / weights.len().max(1) as f64;
    for w in weights.values_mut() {
        *w = if total > 0.0 { *w / total } else { uniform };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types() -> Vec<String> {
        CouplingConfig::default().action_types
    }

    fn sums_to_one(w: &BTreeMap<String, f64>) -> bool {
        (w.values().sum::<f64>() - 1.0).abs() < 1e-9 && w.values().all(|p| *p >= 0.0)
    }

    #[test]
    fn initial_weights_uniform() {
        let mut policy = CoupledPolicy::new(2);
        policy.initialize_weights(&types());
        let w = policy.get_action_probabilities(1).unwrap();
        assert_eq!(w.len(), 5);
        assert!(w.values().all(|p| (*p - 0.2).abs() < 1e-12));
        assert!(policy.get_action_probabilities(2).is_err());
    }

    #[test]
    fn reward_raises_probability_and_propagates() {
        let body = TensorBody::new(vec![vec![2, 3, 5], vec![2, 3, 7], vec![41, 43]]);
        let mut policy = CoupledPolicy::new(3);
        policy.initialize_weights(&types());

        let applied = policy
            .update(0, "query", 1.0, &body, &CouplingConfig::default())
            .unwrap();
        // Member 1 is coupled at 0.5 > 0.2; member 2 at 0.
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[1].member, 1);
        assert_eq!(applied[1].propagated_from, Some(0));
        assert!((applied[1].reward - 0.15).abs() < 1e-12);

        assert!(policy.probability(0, "query") > 0.2);
        assert!(policy.probability(1, "query") > 0.2);
        assert!(policy.probability(0, "query") > policy.probability(1, "query"));
        assert!((policy.probability(2, "query") - 0.2).abs() < 1e-12);
        assert_eq!(policy.updates().len(), 2);
    }

    #[test]
    fn distributions_stay_valid_under_arbitrary_rewards() {
        let body = TensorBody::new(vec![vec![2, 3], vec![2, 3]]);
        let mut policy = CoupledPolicy::new(2);
        policy.initialize_weights(&types());
        let cfg = CouplingConfig::default();
        let rewards = [1.0, -5.0, 0.3, -100.0, 42.0, 0.0, -0.5];
        for (k, r) in rewards.iter().enumerate() {
            let action = &types()[k % 5];
            policy.update(k % 2, action, *r, &body, &cfg).unwrap();
            for w in policy.weights() {
                assert!(sums_to_one(w));
            }
        }
        // Unknown action types are added, not rejected.
        policy.update(0, "dance", 1.0, &body, &cfg).unwrap();
        assert!(policy.probability(0, "dance") > 0.0);
        assert!(sums_to_one(&policy.get_action_probabilities(0).unwrap()));
    }

    #[test]
    fn out_of_range_member() {
        let mut policy = CoupledPolicy::new(1);
        let body = TensorBody::new(vec![vec![2]]);
        assert!(policy
            .update(3, "wait", 1.0, &body, &CouplingConfig::default())
            .is_err());
    }
}
