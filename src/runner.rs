//! Background run loops.
//!
//! [`AgentRunner::start`] drives one agent's engine from a dedicated thread
//! until a [`StopCondition`] is met or the run is stopped. Each step's
//! observation after the first is the action type the previous step chose.
//!
//! The loop checks the stop flag while holding the engine lock, and
//! [`RunHandle::stop`] sets the flag before taking that lock. Once `stop`
//! returns no further step starts, and a step already in progress always
//! runs to completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, RegistryError, SriaResult};
use crate::event::{SharedSink, SriaEvent};
use crate::manager::AgentManager;
use crate::sria::engine::{self, EngineHandle};
use crate::sria::lifecycle::LifecycleState;
use crate::sria::CandidateAction;

/// Longest the loop sleeps before rechecking the stop flag.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopCondition {
    /// Stop after this many steps.
    MaxSteps { steps: u64 },
    /// Stop once a step's free energy drops below the threshold.
    FreeEnergyBelow { threshold: f64 },
    /// Run until stopped.
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    pub initial_observation: String,
    pub actions: Vec<CandidateAction>,
    pub stop_condition: StopCondition,
    /// Pause between steps.
    #[serde(default, rename = "interval_ms", with = "millis")]
    pub interval: Duration,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    /// The stop condition was met.
    Completed,
    /// Stopped from outside.
    Stopped,
    /// A step returned an error.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub agent_id: String,
    pub state: RunState,
    pub steps: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_free_energy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunStatus {
    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Control over one background run.
pub struct RunHandle {
    agent_id: String,
    engine: EngineHandle,
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<RunStatus>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RunHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn status(&self) -> RunStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The flag the loop polls. Setting it has the same effect as `stop`
    /// minus the wait, which makes it suitable for signal handlers.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Stop the run and wait for the loop to exit.
    pub fn stop(&self) -> RunStatus {
        self.stop.store(true, Ordering::SeqCst);
        // Waiting for the lock means any step in progress has finished and
        // the loop will see the flag before starting another.
        drop(engine::lock(&self.engine));
        self.join();
        self.status()
    }

    /// Wait for the loop to exit on its own.
    pub fn wait(&self) -> RunStatus {
        self.join();
        self.status()
    }

    fn join(&self) {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::warn!(agent = %self.agent_id, "run loop panicked");
            }
        }
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.join();
    }
}

// ---------------------------------------------------------------------------
// AgentRunner
// ---------------------------------------------------------------------------

/// Registry of background runs, at most one per agent.
#[derive(Default)]
pub struct AgentRunner {
    runs: HashMap<String, RunHandle>,
}

impl AgentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a run loop for an ACTIVE agent.
    pub fn start(
        &mut self,
        manager: &mut AgentManager,
        agent_id: &str,
        options: RunOptions,
    ) -> SriaResult<RunStatus> {
        if self.runs.get(agent_id).is_some_and(|h| h.status().is_running()) {
            return Err(RegistryError::AlreadyRunning {
                id: agent_id.to_string(),
            }
            .into());
        }
        let handle = manager
            .get_engine(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound {
                id: agent_id.to_string(),
            })?;
        let actual = engine::lock(&handle).lifecycle_state();
        if !actual.is_active() {
            return Err(EngineError::InvalidTransition {
                operation: "run".into(),
                required: LifecycleState::Active,
                actual,
            }
            .into());
        }

        let run = spawn(agent_id.to_string(), handle, manager.sink(), options)?;
        let status = run.status();
        self.runs.insert(agent_id.to_string(), run);
        Ok(status)
    }

    pub fn status(&self, agent_id: &str) -> SriaResult<RunStatus> {
        self.handle(agent_id).map(RunHandle::status)
    }

    pub fn stop(&self, agent_id: &str) -> SriaResult<RunStatus> {
        self.handle(agent_id).map(RunHandle::stop)
    }

    /// Wait for a run to finish on its own.
    pub fn wait(&self, agent_id: &str) -> SriaResult<RunStatus> {
        self.handle(agent_id).map(RunHandle::wait)
    }

    pub fn handle(&self, agent_id: &str) -> SriaResult<&RunHandle> {
        self.runs.get(agent_id).ok_or_else(|| {
            RegistryError::RunNotFound {
                id: agent_id.to_string(),
            }
            .into()
        })
    }

    /// Stop every run.
    pub fn stop_all(&self) -> Vec<RunStatus> {
        self.runs.values().map(RunHandle::stop).collect()
    }
}

fn spawn(
    agent_id: String,
    engine: EngineHandle,
    sink: SharedSink,
    options: RunOptions,
) -> SriaResult<RunHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let status = Arc::new(Mutex::new(RunStatus {
        agent_id: agent_id.clone(),
        state: RunState::Running,
        steps: 0,
        last_action: None,
        last_free_energy: None,
        error: None,
    }));

    // `run_started` must precede the loop's `run_stopped`.
    tracing::info!(agent = %agent_id, "run started");
    sink.emit(&SriaEvent::RunStarted {
        agent_id: agent_id.clone(),
    });

    let thread = {
        let (agent_id, engine, stop, status, sink) = (
            agent_id.clone(),
            Arc::clone(&engine),
            Arc::clone(&stop),
            Arc::clone(&status),
            Arc::clone(&sink),
        );
        std::thread::Builder::new()
            .name(format!("sria-run-{agent_id}"))
            .spawn(move || run_loop(agent_id, engine, stop, status, sink, options))
            .map_err(|e| EngineError::InvalidArgument {
                message: format!("failed to spawn run loop: {e}"),
            })?
    };

    Ok(RunHandle {
        agent_id,
        engine,
        stop,
        status,
        thread: Mutex::new(Some(thread)),
    })
}

fn run_loop(
    agent_id: String,
    engine: EngineHandle,
    stop: Arc<AtomicBool>,
    status: Arc<Mutex<RunStatus>>,
    sink: SharedSink,
    options: RunOptions,
) {
    let mut observation = options.initial_observation;
    let mut steps = 0u64;

    let (state, reason) = loop {
        if let StopCondition::MaxSteps { steps: max } = options.stop_condition {
            if steps >= max {
                break (RunState::Completed, "max_steps".to_string());
            }
        }

        let outcome = {
            let mut engine = engine::lock(&engine);
            if stop.load(Ordering::SeqCst) {
                break (RunState::Stopped, "stopped".to_string());
            }
            engine.full_step(&observation, &options.actions)
        };

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(agent = %agent_id, error = %e, "run step failed");
                status.lock().unwrap_or_else(|p| p.into_inner()).error = Some(e.to_string());
                break (RunState::Failed, "error".to_string());
            }
        };

        steps += 1;
        let free_energy = report.decision.free_energy;
        observation = report.decision.action.action_type;
        {
            let mut s = status.lock().unwrap_or_else(|p| p.into_inner());
            s.steps = steps;
            s.last_action = Some(observation.clone());
            s.last_free_energy = Some(free_energy);
        }
        tracing::debug!(agent = %agent_id, step = steps, action = %observation, free_energy, "run step");
        sink.emit(&SriaEvent::AgentStep {
            agent_id: agent_id.clone(),
            epoch: report.learning.epoch,
            action: observation.clone(),
            free_energy,
        });

        if let StopCondition::FreeEnergyBelow { threshold } = options.stop_condition {
            if free_energy < threshold {
                break (RunState::Completed, "free_energy_below".to_string());
            }
        }

        let deadline = Instant::now() + options.interval;
        loop {
            let now = Instant::now();
            if now >= deadline || stop.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    };

    status.lock().unwrap_or_else(|p| p.into_inner()).state = state;
    tracing::info!(agent = %agent_id, steps, reason = %reason, "run stopped");
    sink.emit(&SriaEvent::RunStopped {
        agent_id,
        steps,
        reason,
    });
}
