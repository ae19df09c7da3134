// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # sria
//!
//! Summonable Resonant Intelligent Agents: a free-energy decision engine for
//! single agents plus a coupling layer that lets agents with overlapping
//! "body" primes share phases, policies and beliefs.
//!
//! ## Architecture
//!
//! - **Engine** (`sria`): lifecycle, session, perceive → decide → learn loop, beacons
//! - **Registry** (`definition`, `manager`): agent definitions, templates, engine cache
//! - **Coupling** (`network`): tensor body, coupled policy, belief network
//! - **Teams** (`team`): named groupings projected into networks on demand
//! - **Runner** (`runner`): cancellable background run loops
//! - **Surface** (`action`, `runtime`): flat JSON action dispatch
//! - **Persistence** (`store`): passive storage adapters (memory, redb)
//!
//! ## Library usage
//!
//! ```no_run
//! use sria::definition::CreateAgentOptions;
//! use sria::manager::AgentManager;
//! use sria::sria::CandidateAction;
//!
//! let mut manager = AgentManager::new();
//! let def = manager
//!     .create(CreateAgentOptions {
//!         template: Some("explorer".into()),
//!         ..Default::default()
//!     })
//!     .unwrap();
//! manager.summon(&def.id).unwrap();
//! let report = manager
//!     .step(&def.id, "a new signal", &[CandidateAction::new("query", 0.4, 0.7)])
//!     .unwrap();
//! println!("chose {}", report.decision.action.action_type);
//! ```

pub mod action;
pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod manager;
pub mod memory_field;
pub mod network;
pub mod paths;
pub mod primes;
pub mod runner;
pub mod runtime;
pub mod sria;
pub mod store;
pub mod team;

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `"{prefix}_{millis base36}{random suffix}"`, unique enough for registry ids.
pub(crate) fn new_id(prefix: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..36u32.pow(6));
    format!("{prefix}_{}{}", base36(now_millis()), pad_base36(suffix as u64, 6))
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn pad_base36(n: u64, width: usize) -> String {
    format!("{:0>width$}", base36(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix_and_differ() {
        let a = new_id("agent");
        let b = new_id("agent");
        assert!(a.starts_with("agent_"));
        assert_ne!(a, b);
    }

    #[test]
    fn base36_digits() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(pad_base36(1, 3), "001");
    }
}
