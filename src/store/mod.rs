//! Passive persistence for agents, teams and engine state.
//!
//! Two backends implement [`StorageAdapter`]:
//!
//! - [`MemoryStore`] — process-local map, for tests and embedding
//! - [`DurableStore`] — ACID key-value file (redb)
//!
//! Values are JSON documents under `"{kind}/{id}"` keys. Nothing in the
//! engine, manager or network calls a store on its own; callers decide when
//! to save and load.

pub mod durable;
pub mod mem;

pub use durable::DurableStore;
pub use mem::MemoryStore;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::definition::AgentDefinition;
use crate::error::StoreError;
use crate::sria::{Beacon, Session, SriaSnapshot, SriaState};
use crate::team::Team;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The kinds of entity a store holds. Each kind is its own key namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Agent,
    Team,
    SriaState,
    Session,
    Beacon,
    Snapshot,
}

impl EntityKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Team => "team",
            Self::SriaState => "sria_state",
            Self::Session => "session",
            Self::Beacon => "beacon",
            Self::Snapshot => "snapshot",
        }
    }

    /// Full store key for `id`.
    pub fn key(&self, id: &str) -> String {
        format!("{}/{id}", self.prefix())
    }
}

/// Raw byte storage plus typed save/load/delete for every entity.
///
/// Implementors only provide the four raw operations.
pub trait StorageAdapter: Send + Sync {
    fn put_raw(&self, kind: EntityKind, id: &str, value: &[u8]) -> StoreResult<()>;
    fn get_raw(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Vec<u8>>>;
    /// Returns whether the entry existed.
    fn delete_raw(&self, kind: EntityKind, id: &str) -> StoreResult<bool>;
    /// Ids of every entry of `kind`, in key order.
    fn list_ids(&self, kind: EntityKind) -> StoreResult<Vec<String>>;

    // ── Agents ──────────────────────────────────────────────────────────

    fn save_agent(&self, def: &AgentDefinition) -> StoreResult<()> {
        put_json(self, EntityKind::Agent, &def.id, def)
    }

    fn load_agent(&self, id: &str) -> StoreResult<Option<AgentDefinition>> {
        get_json(self, EntityKind::Agent, id)
    }

    fn delete_agent(&self, id: &str) -> StoreResult<bool> {
        self.delete_raw(EntityKind::Agent, id)
    }

    fn load_agents(&self) -> StoreResult<Vec<AgentDefinition>> {
        load_all(self, EntityKind::Agent)
    }

    // ── Teams ───────────────────────────────────────────────────────────

    fn save_team(&self, team: &Team) -> StoreResult<()> {
        put_json(self, EntityKind::Team, &team.id, team)
    }

    fn load_team(&self, id: &str) -> StoreResult<Option<Team>> {
        get_json(self, EntityKind::Team, id)
    }

    fn delete_team(&self, id: &str) -> StoreResult<bool> {
        self.delete_raw(EntityKind::Team, id)
    }

    fn load_teams(&self) -> StoreResult<Vec<Team>> {
        load_all(self, EntityKind::Team)
    }

    // ── Engine state ────────────────────────────────────────────────────

    fn save_sria_state(&self, state: &SriaState) -> StoreResult<()> {
        put_json(self, EntityKind::SriaState, &state.agent_id, state)
    }

    fn load_sria_state(&self, agent_id: &str) -> StoreResult<Option<SriaState>> {
        get_json(self, EntityKind::SriaState, agent_id)
    }

    fn delete_sria_state(&self, agent_id: &str) -> StoreResult<bool> {
        self.delete_raw(EntityKind::SriaState, agent_id)
    }

    /// Sessions are keyed by the agent that holds them.
    fn save_session(&self, agent_id: &str, session: &Session) -> StoreResult<()> {
        put_json(self, EntityKind::Session, agent_id, session)
    }

    fn load_session(&self, agent_id: &str) -> StoreResult<Option<Session>> {
        get_json(self, EntityKind::Session, agent_id)
    }

    fn delete_session(&self, agent_id: &str) -> StoreResult<bool> {
        self.delete_raw(EntityKind::Session, agent_id)
    }

    fn save_beacon(&self, agent_id: &str, beacon: &Beacon) -> StoreResult<()> {
        put_json(
            self,
            EntityKind::Beacon,
            &format!("{agent_id}/{}", beacon.fingerprint),
            beacon,
        )
    }

    /// An agent's beacons, oldest first.
    fn load_beacons(&self, agent_id: &str) -> StoreResult<Vec<Beacon>> {
        let prefix = format!("{agent_id}/");
        let mut beacons = Vec::new();
        for id in self.list_ids(EntityKind::Beacon)? {
            if id.starts_with(&prefix) {
                if let Some(b) = get_json::<Self, Beacon>(self, EntityKind::Beacon, &id)? {
                    beacons.push(b);
                }
            }
        }
        beacons.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.epoch.cmp(&b.epoch))
        });
        Ok(beacons)
    }

    /// Delete every beacon of an agent. Returns how many were removed.
    fn delete_beacons(&self, agent_id: &str) -> StoreResult<usize> {
        let prefix = format!("{agent_id}/");
        let mut removed = 0;
        for id in self.list_ids(EntityKind::Beacon)? {
            if id.starts_with(&prefix) && self.delete_raw(EntityKind::Beacon, &id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ── Full engine snapshots ───────────────────────────────────────────

    fn save_snapshot(&self, snapshot: &SriaSnapshot) -> StoreResult<()> {
        put_json(self, EntityKind::Snapshot, &snapshot.definition.id, snapshot)
    }

    fn load_snapshot(&self, agent_id: &str) -> StoreResult<Option<SriaSnapshot>> {
        get_json(self, EntityKind::Snapshot, agent_id)
    }

    fn delete_snapshot(&self, agent_id: &str) -> StoreResult<bool> {
        self.delete_raw(EntityKind::Snapshot, agent_id)
    }

    fn load_snapshots(&self) -> StoreResult<Vec<SriaSnapshot>> {
        load_all(self, EntityKind::Snapshot)
    }

    /// Persist every entity derived from one engine snapshot.
    fn save_engine(&self, snapshot: &SriaSnapshot) -> StoreResult<()> {
        let agent_id = &snapshot.definition.id;
        self.save_snapshot(snapshot)?;
        self.save_sria_state(&SriaState {
            agent_id: agent_id.clone(),
            memory_phases: snapshot.memory_phases.clone(),
            quaternion_state: snapshot.quaternion_state,
            current_epoch: snapshot.current_epoch,
            body_hash: snapshot.body_hash.clone(),
        })?;
        match snapshot.session {
            Some(ref session) => self.save_session(agent_id, session)?,
            None => {
                self.delete_session(agent_id)?;
            }
        }
        for beacon in &snapshot.beacons {
            self.save_beacon(agent_id, beacon)?;
        }
        Ok(())
    }

    /// Remove an agent and everything stored about it.
    fn purge_agent(&self, agent_id: &str) -> StoreResult<()> {
        self.delete_agent(agent_id)?;
        self.delete_snapshot(agent_id)?;
        self.delete_sria_state(agent_id)?;
        self.delete_session(agent_id)?;
        self.delete_beacons(agent_id)?;
        Ok(())
    }
}

fn put_json<S: StorageAdapter + ?Sized, T: Serialize>(
    store: &S,
    kind: EntityKind,
    id: &str,
    value: &T,
) -> StoreResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization {
        message: format!("{}: {e}", kind.key(id)),
    })?;
    store.put_raw(kind, id, &bytes)
}

fn get_json<S: StorageAdapter + ?Sized, T: DeserializeOwned>(
    store: &S,
    kind: EntityKind,
    id: &str,
) -> StoreResult<Option<T>> {
    match store.get_raw(kind, id)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization {
                message: format!("{}: {e}", kind.key(id)),
            }),
        None => Ok(None),
    }
}

fn load_all<S: StorageAdapter + ?Sized, T: DeserializeOwned>(
    store: &S,
    kind: EntityKind,
) -> StoreResult<Vec<T>> {
    let mut out = Vec::new();
    for id in store.list_ids(kind)? {
        if let Some(v) = get_json(store, kind, &id)? {
            out.push(v);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(EntityKind::Agent.key("agent_1"), "agent/agent_1");
        assert_eq!(EntityKind::SriaState.key("a"), "sria_state/a");
    }
}
