//! Belief network: aggregation and coupled propagation of session beliefs.

use serde::{Deserialize, Serialize};

use crate::config::CouplingConfig;
use crate::sria::engine::{self, EngineHandle};
use crate::sria::Belief;

use super::tensor_body::TensorBody;

/// Prefix marking beliefs that arrived from another member.
pub const SHARED_PREFIX: &str = "shared_";

/// One propagation attempt. The log is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeliefPropagation {
    pub state: String,
    pub source: usize,
    pub timestamp: u64,
    /// Members the belief was injected into.
    pub propagated_to: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BeliefNetwork {
    log: Vec<BeliefPropagation>,
}

/// `shared_{state}`, without stacking the prefix on already-shared states.
pub fn shared_state(state: &str) -> String {
    if state.starts_with(SHARED_PREFIX) {
        state.to_string()
    } else {
        format!("{SHARED_PREFIX}{state}")
    }
}

impl BeliefNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> &[BeliefPropagation] {
        &self.log
    }

    /// Mean belief per state over active members, most probable first.
    ///
    /// Probabilities and entropies are summed per state and divided by the
    /// number of active members; prime factors are unioned.
    pub fn aggregate_beliefs(&self, members: &[EngineHandle]) -> Vec<Belief> {
        let mut grouped: Vec<Belief> = Vec::new();
        let mut active = 0usize;

        for handle in members {
            let engine = engine::lock(handle);
            let Some(session) = engine.session() else {
                continue;
            };
            active += 1;
            for belief in &session.current_beliefs {
                match grouped.iter_mut().find(|b| b.state == belief.state) {
                    Some(acc) => {
                        acc.probability += belief.probability;
                        acc.entropy += belief.entropy;
                        for p in &belief.prime_factors {
                            if !acc.prime_factors.contains(p) {
                                acc.prime_factors.push(*p);
                            }
                        }
                    }
                    None => grouped.push(Belief {
                        source: None,
                        ..belief.clone()
                    }),
                }
            }
        }

        if active == 0 {
            return Vec::new();
        }
        for b in grouped.iter_mut() {
            b.probability /= active as f64;
            b.entropy /= active as f64;
        }
        // Stable sort keeps first-seen order among equals.
        grouped.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        grouped
    }

    /// Inject a damped copy of `belief` into every other active member whose
    /// coupling to `source` exceeds the belief threshold.
    ///
    /// The source's engine must not be locked by the caller.
    pub fn propagate_belief(
        &mut self,
        members: &[EngineHandle],
        body: &TensorBody,
        belief: &Belief,
        source: usize,
        config: &CouplingConfig,
    ) -> BeliefPropagation {
        let state = shared_state(&belief.state);
        let mut propagated_to = Vec::new();

        for (target, handle) in members.iter().enumerate() {
            if target == source {
                continue;
            }
            let coupling = body.coupling(source, target);
            if coupling <= config.belief_threshold {
                continue;
            }
            let mut shared = Belief::new(
                state.clone(),
                belief.probability * coupling * config.belief_damping,
                belief.prime_factors.clone(),
            );
            shared.source = Some(source);
            if engine::lock(handle).inject_belief(shared) {
                propagated_to.push(target);
            }
        }

        let entry = BeliefPropagation {
            state,
            source,
            timestamp: crate::now_millis(),
            propagated_to,
        };
        if !entry.propagated_to.is_empty() {
            tracing::debug!(
                source,
                state = %entry.state,
                targets = entry.propagated_to.len(),
                "belief propagated"
            );
        }
        self.log.push(entry.clone());
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::AgentDefinition;
    use crate::sria::SriaEngine;

    fn summoned(bodies: &[&[u64]]) -> Vec<EngineHandle> {
        bodies
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let mut e = SriaEngine::new(AgentDefinition::new(
                    format!("a{i}"),
                    format!("A{i}"),
                    b.to_vec(),
                ));
                e.summon().unwrap();
                engine::handle(e)
            })
            .collect()
    }

    fn beliefs(h: &EngineHandle) -> Vec<Belief> {
        engine::lock(h).session().unwrap().current_beliefs.clone()
    }

    #[test]
    fn weak_coupling_changes_nothing() {
        // Jaccard({2,3,5,7,11,13,17}, {2,19,23,29,31,37,41}) = 1/13.
        let bodies: [&[u64]; 2] = [&[2, 3, 5, 7, 11, 13, 17], &[2, 19, 23, 29, 31, 37, 41]];
        let members = summoned(&bodies);
        let body = TensorBody::new(bodies.iter().map(|b| b.to_vec()).collect());
        let before = beliefs(&members[1]);

        let mut net = BeliefNetwork::new();
        let entry = net.propagate_belief(
            &members,
            &body,
            &Belief::new("explore", 0.9, vec![2]),
            0,
            &CouplingConfig::default(),
        );
        assert!(entry.propagated_to.is_empty());
        assert_eq!(beliefs(&members[1]), before);
        assert_eq!(net.log().len(), 1);
    }

    #[test]
    fn strong_coupling_adds_one_shared_belief() {
        let bodies: [&[u64]; 2] = [&[2, 3, 5], &[2, 3, 7]];
        let members = summoned(&bodies);
        let body = TensorBody::new(bodies.iter().map(|b| b.to_vec()).collect());
        let before = beliefs(&members[1]).len();

        let mut net = BeliefNetwork::new();
        let cfg = CouplingConfig::default();
        let belief = Belief::new("explore", 0.5, vec![2]);
        let entry = net.propagate_belief(&members, &body, &belief, 0, &cfg);
        assert_eq!(entry.propagated_to, vec![1]);
        assert_eq!(entry.state, "shared_explore");

        let after = beliefs(&members[1]);
        assert_eq!(after.len(), before + 1);
        let shared = after.iter().find(|b| b.state == "shared_explore").unwrap();
        assert_eq!(shared.source, Some(0));
        assert!((after.iter().map(|b| b.probability).sum::<f64>() - 1.0).abs() < 1e-12);

        // Repeating merges instead of adding.
        net.propagate_belief(&members, &body, &belief, 0, &cfg);
        assert_eq!(beliefs(&members[1]).len(), before + 1);
        // The source is untouched.
        assert!(beliefs(&members[0]).iter().all(|b| b.source.is_none()));
    }

    #[test]
    fn dormant_members_are_skipped() {
        let bodies: [&[u64]; 2] = [&[2, 3], &[2, 3]];
        let members = summoned(&bodies);
        engine::lock(&members[1]).dismiss().unwrap();
        let body = TensorBody::new(bodies.iter().map(|b| b.to_vec()).collect());
        let mut net = BeliefNetwork::new();
        let entry = net.propagate_belief(
            &members,
            &body,
            &Belief::new("rest", 0.5, vec![]),
            0,
            &CouplingConfig::default(),
        );
        assert!(entry.propagated_to.is_empty());
        // Aggregation only counts the active member.
        let agg = net.aggregate_beliefs(&members);
        assert!((agg.iter().map(|b| b.probability).sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn aggregate_averages_over_active_members() {
        let members = summoned(&[&[2, 3], &[5, 7]]);
        let agg = BeliefNetwork::new().aggregate_beliefs(&members);
        // Both use the fallback explore/exploit/rest distribution.
        assert_eq!(agg.len(), 3);
        assert_eq!(agg[0].state, "explore");
        assert!((agg[0].probability - 0.4).abs() < 1e-12);
        assert_eq!(agg[0].prime_factors, vec![2, 5]);
        assert_eq!(agg[2].state, "rest");
    }

    #[test]
    fn shared_prefix_is_not_stacked() {
        assert_eq!(shared_state("explore"), "shared_explore");
        assert_eq!(shared_state("shared_explore"), "shared_explore");
    }
}
