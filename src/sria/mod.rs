//! The SRIA engine: one agent's perceive → decide → act → learn loop.
//!
//! - [`lifecycle`]: the DORMANT/ACTIVE state machine
//! - [`types`]: sessions, beliefs, percepts, beacons and step reports
//! - [`perception`]: deterministic text → prime-phase encoding and layers
//! - [`decision`]: free-energy action selection
//! - [`engine`]: [`SriaEngine`] itself, tying the above together

pub mod decision;
pub mod engine;
pub mod lifecycle;
pub mod perception;
pub mod types;

pub use decision::{free_energy, select_action, Decision};
pub use engine::{EngineHandle, EngineState, SriaEngine, SriaSnapshot};
pub use lifecycle::LifecycleState;
pub use perception::{LayerActivation, PerceptionLayer};
pub use types::{
    ActionRecord, Beacon, Belief, CandidateAction, DismissReport, EncodedPercept, LearningReport,
    Percept, PerceptionReport, Quaternion, ResonanceKey, ResonanceVerification, Session,
    SriaState, StepReport, SummonReport,
};
