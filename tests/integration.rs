//! End-to-end integration tests for the sria runtime.
//!
//! These tests drive engines, registries and coupled networks through the
//! public API only, checking the lifecycle, decision, identity and coupling
//! guarantees together.

use std::sync::Arc;

use sria::config::CouplingConfig;
use sria::definition::{AgentDefinition, CreateAgentOptions, SafetyConstraints};
use sria::event::VecSink;
use sria::manager::AgentManager;
use sria::network::{MemberStatus, MultiAgentNetwork, TensorBody};
use sria::sria::engine::{self, SriaEngine};
use sria::sria::{CandidateAction, LifecycleState, free_energy, select_action};
use sria::team::{CreateTeamOptions, TeamManager};

fn engine(primes: &[u64]) -> SriaEngine {
    SriaEngine::new(AgentDefinition::new("agent_it", "Integration", primes.to_vec()))
}

fn actions() -> Vec<CandidateAction> {
    vec![
        CandidateAction::new("query", 0.5, 0.8),
        CandidateAction::new("response", 0.3, 0.6),
        CandidateAction::new("wait", 0.1, 0.2),
    ]
}

#[test]
fn summon_and_dismiss_strictly_alternate() {
    let mut e = engine(&[2, 3, 5]);
    assert!(e.dismiss().is_err());
    assert!(e.full_step("too early", &actions()).is_err());

    e.summon().unwrap();
    assert_eq!(e.lifecycle_state(), LifecycleState::Active);
    let err = e.summon().unwrap_err();
    assert!(err.is_routine());

    e.dismiss().unwrap();
    assert_eq!(e.lifecycle_state(), LifecycleState::Dormant);
    assert!(e.dismiss().is_err());
    e.summon().unwrap();
}

#[test]
fn resonance_keys_are_deterministic_and_verifiable() {
    let e = engine(&[2, 3, 5, 7, 11]);
    let a = e.compute_resonance_key("the same text");
    let b = e.compute_resonance_key("the same text");
    assert_eq!(a.primes, b.primes);
    assert_eq!(a.hash, b.hash);
    let c = e.compute_resonance_key("something else entirely");
    assert_ne!(a.hash, c.hash);

    let verification = e.verify_resonance(&a);
    let expected: Vec<u64> = a
        .primes
        .iter()
        .copied()
        .filter(|p| e.body_primes().contains(p))
        .collect();
    assert_eq!(verification.matching_primes, expected);
    assert_eq!(verification.verified, !expected.is_empty());
}

#[test]
fn lower_free_energy_wins() {
    let decision = select_action(
        &[
            CandidateAction::new("A", 10.0, 0.1),
            CandidateAction::new("B", 0.01, 0.99),
        ],
        &SafetyConstraints::default(),
    )
    .unwrap();
    assert_eq!(decision.action.action_type, "B");
}

#[test]
fn session_histories_track_steps_and_reset() {
    let mut e = engine(&[2, 3, 5, 7]);
    e.summon().unwrap();
    for i in 0..4 {
        e.full_step(&format!("observation {i}"), &actions()).unwrap();
    }
    let session = e.session().unwrap();
    assert_eq!(session.entropy_trajectory.len(), 4);
    assert_eq!(session.action_history.len(), 4);
    assert_eq!(e.current_epoch(), 4);

    e.dismiss().unwrap();
    e.summon().unwrap();
    let session = e.session().unwrap();
    assert!(session.entropy_trajectory.is_empty());
    assert!(session.action_history.is_empty());
}

#[test]
fn beacons_accumulate_across_dismissals() {
    let mut e = engine(&[3, 5, 7]);
    for round in 1..=3 {
        e.summon().unwrap();
        let report = e.dismiss().unwrap();
        assert!(report.beacon.fingerprint.starts_with("beacon_"));
        assert_eq!(report.beacon.body_hash, e.generate_body_hash());
        assert_eq!(e.beacons().len(), round);
    }
}

#[test]
fn snapshot_round_trip_preserves_identity() {
    let mut e = engine(&[2, 5, 13]);
    e.summon().unwrap();
    e.full_step("one", &actions()).unwrap();
    e.dismiss().unwrap();

    let restored = SriaEngine::deserialize(e.serialize()).unwrap();
    assert_eq!(restored.name(), e.name());
    assert_eq!(restored.body_primes(), e.body_primes());
    assert_eq!(restored.current_epoch(), e.current_epoch());
    assert_eq!(restored.beacons(), e.beacons());
    assert_eq!(restored.generate_body_hash(), e.generate_body_hash());
}

#[test]
fn coupling_matrix_is_jaccard() {
    let body = TensorBody::new(vec![vec![2, 3, 5], vec![2, 3, 5], vec![7, 11]]);
    assert!((body.coupling(0, 1) - 1.0).abs() < 1e-12);
    assert_eq!(body.coupling(0, 2), 0.0);
    for i in 0..3 {
        for j in 0..3 {
            assert_eq!(body.coupling(i, j), body.coupling(j, i));
        }
    }
}

#[test]
fn policies_stay_distributions_after_collective_steps() {
    let mut net = MultiAgentNetwork::new("net_policy", CouplingConfig::default());
    for primes in [&[2u64, 3, 5][..], &[2, 3, 7], &[2, 11, 13]] {
        net.add_agent(engine::handle(engine(primes)));
    }
    net.summon_all(None);
    for i in 0..5 {
        net.collective_step(&format!("tick {i}"), &actions());
    }
    for i in 0..net.len() {
        let probs = net.policy().get_action_probabilities(i).unwrap();
        assert!(probs.values().all(|p| *p >= 0.0));
        assert!((probs.values().sum::<f64>() - 1.0).abs() < 1e-9);
    }
}

#[test]
fn two_agent_network_end_to_end() {
    let sink = Arc::new(VecSink::new());
    let mut net = MultiAgentNetwork::new("net_pair", CouplingConfig::default())
        .with_sink(sink.clone());
    let a = engine::handle(SriaEngine::new(AgentDefinition::new(
        "agent_a",
        "A",
        vec![2, 3, 5, 7, 11],
    )));
    let b = engine::handle(SriaEngine::new(AgentDefinition::new(
        "agent_b",
        "B",
        vec![2, 3, 13, 17, 19],
    )));
    net.add_agent(a);
    net.add_agent(b);
    assert_eq!(net.body().shared_primes(), &[2, 3]);

    net.summon_all(Some("pair"));
    let report = net.collective_step("a shared observation", &actions());

    assert_eq!(report.active_agents, 2);
    assert!(report.agent_results.iter().all(|r| r.status == MemberStatus::Ok));
    let mean = report
        .agent_results
        .iter()
        .filter_map(|r| r.free_energy)
        .sum::<f64>()
        / 2.0;
    assert!((report.collective_free_energy - mean).abs() < 1e-12);

    for prime in report.phase_alignment.keys() {
        assert!(net.body().shared_primes().contains(prime));
        assert!(
            net.members()
                .iter()
                .any(|h| engine::lock(h).latest_phase(*prime).is_some())
        );
    }
    assert_eq!(sink.names().last().copied(), Some("collective_step"));
}

#[test]
fn single_wait_action_sets_collective_free_energy() {
    let mut net = MultiAgentNetwork::new("net_hello", CouplingConfig::default());
    net.add_agent(engine::handle(SriaEngine::new(AgentDefinition::new(
        "agent_a",
        "A",
        vec![2, 3, 5, 7, 11],
    ))));
    net.add_agent(engine::handle(SriaEngine::new(AgentDefinition::new(
        "agent_b",
        "B",
        vec![2, 3, 13, 17, 19],
    ))));
    net.summon_all(None);

    let report = net.collective_step("hello", &[CandidateAction::new("wait", 0.1, 0.9)]);
    assert_eq!(report.active_agents, 2);

    // Both members bias against the same uniform policy over five types.
    let expected = free_energy(0.1 / 0.2, 0.9);
    for result in &report.agent_results {
        assert_eq!(result.action.as_deref(), Some("wait"));
        assert!((result.free_energy.unwrap() - expected).abs() < 1e-12);
    }
    assert!((report.collective_free_energy - expected).abs() < 1e-12);

    for prime in report.phase_alignment.keys() {
        assert!(
            net.members()
                .iter()
                .any(|h| engine::lock(h).latest_phase(*prime).is_some())
        );
    }
}

#[test]
fn dormant_members_are_skipped_not_failed() {
    let mut net = MultiAgentNetwork::new("net_skip", CouplingConfig::default());
    net.add_agent(engine::handle(engine(&[2, 3])));
    net.add_agent(engine::handle(engine(&[2, 5])));
    net.summon_all(None);
    engine::lock(&net.members()[1]).dismiss().unwrap();

    let report = net.collective_step("x", &actions());
    assert_eq!(report.active_agents, 1);
    assert_eq!(report.agent_results[1].status, MemberStatus::Skipped);
}

#[test]
fn teams_drive_the_managers_engines() {
    let mut agents = AgentManager::new();
    let a = agents
        .create(CreateAgentOptions {
            body_primes: Some(vec![2, 3, 5, 7, 11]),
            ..Default::default()
        })
        .unwrap();
    let b = agents
        .create(CreateAgentOptions {
            template: Some("analyst".into()),
            ..Default::default()
        })
        .unwrap();

    let mut teams = TeamManager::default();
    let team = teams.create(CreateTeamOptions {
        name: "crew".into(),
        agent_ids: vec![a.id.clone(), b.id.clone()],
        ..Default::default()
    });

    teams.summon(&team.id, &mut agents).unwrap();
    let handle = agents.get_engine(&a.id).unwrap();
    assert!(engine::lock(&handle).is_active());

    let report = teams
        .step(&team.id, &mut agents, "together", &actions())
        .unwrap();
    assert_eq!(report.active_agents, 2);
    assert_eq!(engine::lock(&handle).current_epoch(), 1);

    teams.dismiss(&team.id, &mut agents).unwrap();
    assert_eq!(agents.get_stats().summoned_agents, 0);
}
