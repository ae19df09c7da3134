//! Free-energy action selection.
//!
//! `F = entropy_cost · (1 − confidence)`: cheaper and more confident actions
//! have lower free energy, and the engine takes the global minimum. Ties keep
//! the earliest candidate in declaration order.

use serde::{Deserialize, Serialize};

use crate::definition::SafetyConstraints;
use crate::error::EngineError;

use super::types::CandidateAction;

/// Free energy of one candidate. Non-finite costs score as infinitely bad.
pub fn free_energy(entropy_cost: f64, confidence: f64) -> f64 {
    if !entropy_cost.is_finite() {
        return f64::INFINITY;
    }
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    entropy_cost.max(0.0) * (1.0 - confidence)
}

/// How one candidate scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedAction {
    pub action_type: String,
    pub free_energy: f64,
    /// Why the candidate was excluded, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

/// The outcome of the decision phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: CandidateAction,
    pub free_energy: f64,
    /// Set when the chosen free energy exceeds `safety_constraints.max_free_energy`.
    #[serde(default)]
    pub over_budget: bool,
    pub evaluated: Vec<EvaluatedAction>,
}

/// Pick the minimum-free-energy candidate that the safety constraints allow.
pub fn select_action(
    candidates: &[CandidateAction],
    safety: &SafetyConstraints,
) -> Result<Decision, EngineError> {
    let mut evaluated = Vec::with_capacity(candidates.len());
    let mut best: Option<(usize, f64)> = None;

    for (i, action) in candidates.iter().enumerate() {
        let fe = free_energy(action.entropy_cost, action.confidence);
        if safety.forbidden_actions.contains(&action.action_type) {
            evaluated.push(EvaluatedAction {
                action_type: action.action_type.clone(),
                free_energy: fe,
                rejected: Some("forbidden by safety constraints".into()),
            });
            continue;
        }
        evaluated.push(EvaluatedAction {
            action_type: action.action_type.clone(),
            free_energy: fe,
            rejected: None,
        });
        // Strict `<` keeps the first of equal candidates.
        match best {
            Some((_, best_fe)) if fe >= best_fe => {}
            _ => best = Some((i, fe)),
        }
    }

    let (index, fe) = best.ok_or(EngineError::NoCandidateActions)?;
    let over_budget = safety.max_free_energy.is_some_and(|cap| fe > cap);
    Ok(Decision {
        action: candidates[index].clone(),
        free_energy: fe,
        over_budget,
        evaluated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn act(t: &str, cost: f64, conf: f64) -> CandidateAction {
        CandidateAction::new(t, cost, conf)
    }

    #[test]
    fn monotone_in_cost_and_confidence() {
        assert!(free_energy(0.5, 0.5) < free_energy(1.0, 0.5));
        assert!(free_energy(1.0, 0.9) < free_energy(1.0, 0.5));
        assert_eq!(free_energy(1.0, 1.0), 0.0);
        assert_eq!(free_energy(1.0, 2.0), 0.0); // confidence clamps
        assert_eq!(free_energy(-3.0, 0.0), 0.0); // cost clamps
        assert_eq!(free_energy(f64::NAN, 0.5), f64::INFINITY);
    }

    #[test]
    fn cheap_confident_action_wins() {
        let decision = select_action(
            &[act("a", 10.0, 0.1), act("b", 0.01, 0.99)],
            &SafetyConstraints::default(),
        )
        .unwrap();
        assert_eq!(decision.action.action_type, "b");
        assert_eq!(decision.evaluated.len(), 2);
    }

    #[test]
    fn ties_keep_declaration_order() {
        let decision = select_action(
            &[act("first", 1.0, 0.5), act("second", 0.5, 0.0)],
            &SafetyConstraints::default(),
        )
        .unwrap();
        assert_eq!(decision.action.action_type, "first");
    }

    #[test]
    fn forbidden_actions_are_skipped() {
        let safety = SafetyConstraints {
            forbidden_actions: vec!["b".into()],
            max_free_energy: Some(0.5),
        };
        let decision = select_action(&[act("a", 10.0, 0.1), act("b", 0.01, 0.99)], &safety).unwrap();
        assert_eq!(decision.action.action_type, "a");
        assert!(decision.over_budget);
        assert!(decision.evaluated[1].rejected.is_some());
    }

    #[test]
    fn empty_candidates_error() {
        assert!(matches!(
            select_action(&[], &SafetyConstraints::default()),
            Err(EngineError::NoCandidateActions)
        ));
    }
}
