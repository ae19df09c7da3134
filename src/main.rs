//! sria CLI: summonable resonant agents.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use sria::action::ActionRequest;
use sria::config::SriaConfig;
use sria::definition::{AgentFilter, AgentPatch, CreateAgentOptions};
use sria::event::TracingSink;
use sria::paths::SriaPaths;
use sria::runner::StopCondition;
use sria::runtime::Runtime;
use sria::sria::CandidateAction;
use sria::store::DurableStore;
use sria::team::{CreateTeamOptions, TeamConfig};

#[derive(Parser)]
#[command(name = "sria", version, about = "Summonable resonant agents")]
struct Cli {
    /// Keep config and data under this directory instead of the XDG locations.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage and drive individual agents.
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Manage and drive coupled teams.
    Team {
        #[command(subcommand)]
        action: TeamAction,
    },

    /// Inspect agent templates.
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Execute a raw JSON action request ("-" reads stdin).
    Exec { request: String },

    /// Manage the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Create an agent.
    Create {
        #[arg(long)]
        name: Option<String>,
        /// Template to start from (explorer, analyst, guardian, communicator).
        #[arg(long)]
        template: Option<String>,
        /// Body primes, comma-separated (e.g. "2,3,5,7,11").
        #[arg(long, value_delimiter = ',')]
        primes: Option<Vec<u64>>,
    },
    /// List agents.
    List {
        /// Case-insensitive name substring.
        #[arg(long)]
        name: Option<String>,
        /// Only agents whose body holds all of these primes.
        #[arg(long, value_delimiter = ',')]
        primes: Option<Vec<u64>>,
    },
    /// Show an agent's definition and engine state.
    Show { agent_id: String },
    /// Update an agent's name or metadata.
    Update {
        agent_id: String,
        #[arg(long)]
        name: Option<String>,
        /// Metadata entry as KEY=VALUE; VALUE is parsed as JSON when possible.
        #[arg(long = "meta", value_parser = parse_meta)]
        metadata: Vec<(String, serde_json::Value)>,
    },
    /// Delete an agent.
    Delete { agent_id: String },
    /// Summon an agent into a new session.
    Summon {
        agent_id: String,
        #[arg(long)]
        context: Option<String>,
    },
    /// Dismiss an agent, leaving a beacon.
    Dismiss { agent_id: String },
    /// Run one perceive/decide/learn step.
    Step {
        agent_id: String,
        observation: String,
        /// Candidate action as TYPE:COST:CONFIDENCE. Defaults to the configured types.
        #[arg(long = "action", value_parser = parse_action)]
        actions: Vec<CandidateAction>,
    },
    /// Show registry statistics.
    Stats,
    /// Step an agent repeatedly in the foreground. Ctrl-C stops it.
    Run {
        agent_id: String,
        observation: String,
        #[arg(long = "action", value_parser = parse_action)]
        actions: Vec<CandidateAction>,
        /// Stop after this many steps.
        #[arg(long, conflicts_with_all = ["until_free_energy", "manual"])]
        max_steps: Option<u64>,
        /// Stop once a step's free energy drops below this value.
        #[arg(long, conflicts_with = "manual")]
        until_free_energy: Option<f64>,
        /// Run until interrupted.
        #[arg(long)]
        manual: bool,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum TeamAction {
    /// Create a team.
    Create {
        name: String,
        /// Member agent ids, comma-separated.
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,
        /// Context tag members are summoned with.
        #[arg(long)]
        context: Option<String>,
    },
    /// List teams.
    List,
    /// Show a team and its network state.
    Show { team_id: String },
    /// Add an agent to a team.
    AddAgent { team_id: String, agent_id: String },
    /// Remove an agent from a team.
    RemoveAgent { team_id: String, agent_id: String },
    /// Summon every member.
    Summon { team_id: String },
    /// Run one collective step.
    Step {
        team_id: String,
        observation: String,
        #[arg(long = "action", value_parser = parse_action)]
        actions: Vec<CandidateAction>,
    },
    /// Dismiss every member.
    Dismiss { team_id: String },
    /// Delete a team. Its agents are kept.
    Delete { team_id: String },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// List registered templates.
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration.
    Show,
}

fn parse_action(s: &str) -> std::result::Result<CandidateAction, String> {
    let mut parts = s.splitn(3, ':');
    let action_type = parts.next().filter(|t| !t.is_empty()).ok_or("missing action type")?;
    let cost = match parts.next() {
        Some(c) => c.parse::<f64>().map_err(|e| format!("bad entropy cost {c:?}: {e}"))?,
        None => 1.0,
    };
    let confidence = match parts.next() {
        Some(c) => c.parse::<f64>().map_err(|e| format!("bad confidence {c:?}: {e}"))?,
        None => 0.5,
    };
    Ok(CandidateAction::new(action_type, cost, confidence))
}

fn parse_meta(s: &str) -> std::result::Result<(String, serde_json::Value), String> {
    let (key, value) = s.split_once('=').ok_or("expected KEY=VALUE")?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let paths = match cli.data_dir {
        Some(ref root) => SriaPaths::from_root(root),
        None => SriaPaths::resolve()?,
    };

    if let Commands::Config { action } = cli.command {
        return run_config(&paths, action);
    }

    paths.ensure_dirs()?;
    let config = SriaConfig::load_or_default(&paths.config_file())?;
    let store = DurableStore::open(&paths.store_file())?;
    let mut runtime = Runtime::with_sink(config, Arc::new(TracingSink));
    runtime.restore(&store)?;

    match cli.command {
        Commands::Agent { action } => run_agent(&mut runtime, &store, action),
        Commands::Team { action } => run_team(&mut runtime, &store, action),
        Commands::Template {
            action: TemplateAction::List,
        } => execute(&mut runtime, &store, ActionRequest::TemplateList),
        Commands::Exec { request } => {
            let text = if request == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf).into_diagnostic()?;
                buf
            } else {
                request
            };
            execute(&mut runtime, &store, ActionRequest::from_json(&text)?)
        }
        Commands::Config { .. } => Ok(()),
    }
}

/// Dispatch, persist if the request can change state, then print the response.
fn execute(runtime: &mut Runtime, store: &DurableStore, request: ActionRequest) -> Result<()> {
    let response = dispatch(runtime, store, request)?;
    print_json(&response)
}

fn dispatch(
    runtime: &mut Runtime,
    store: &DurableStore,
    request: ActionRequest,
) -> Result<serde_json::Value> {
    let mutating = request.is_mutating();
    let response = runtime.dispatch(request)?;
    if mutating {
        runtime.persist(store)?;
    }
    if response["success"] == false {
        let error = response["error"].as_str().unwrap_or("action failed");
        miette::bail!("{error}");
    }
    Ok(response)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

fn run_agent(runtime: &mut Runtime, store: &DurableStore, action: AgentAction) -> Result<()> {
    let request = match action {
        AgentAction::Create {
            name,
            template,
            primes,
        } => ActionRequest::AgentCreate {
            options: CreateAgentOptions {
                name,
                template,
                body_primes: primes,
                ..Default::default()
            },
        },
        AgentAction::List { name, primes } => ActionRequest::AgentList {
            filter: AgentFilter { name, primes },
        },
        AgentAction::Show { agent_id } => {
            let agent = dispatch(
                runtime,
                store,
                ActionRequest::AgentGet {
                    agent_id: agent_id.clone(),
                },
            )?;
            let state = dispatch(runtime, store, ActionRequest::AgentState { agent_id })?;
            return print_json(&serde_json::json!({
                "agent": agent["agent"],
                "state": state["state"],
            }));
        }
        AgentAction::Update {
            agent_id,
            name,
            metadata,
        } => ActionRequest::AgentUpdate {
            agent_id,
            patch: AgentPatch {
                name,
                metadata: (!metadata.is_empty())
                    .then(|| metadata.into_iter().collect::<BTreeMap<_, _>>()),
                ..Default::default()
            },
        },
        AgentAction::Delete { agent_id } => ActionRequest::AgentDelete { agent_id },
        AgentAction::Summon { agent_id, context } => {
            ActionRequest::AgentSummon { agent_id, context }
        }
        AgentAction::Dismiss { agent_id } => ActionRequest::AgentDismiss { agent_id },
        AgentAction::Step {
            agent_id,
            observation,
            actions,
        } => ActionRequest::AgentStep {
            agent_id,
            observation,
            actions,
        },
        AgentAction::Stats => ActionRequest::AgentStats,
        AgentAction::Run {
            agent_id,
            observation,
            actions,
            max_steps,
            until_free_energy,
            manual,
            interval_ms,
        } => {
            let stop_condition = if manual {
                Some(StopCondition::Manual)
            } else if let Some(threshold) = until_free_energy {
                Some(StopCondition::FreeEnergyBelow { threshold })
            } else {
                max_steps.map(|steps| StopCondition::MaxSteps { steps })
            };
            return run_foreground(
                runtime,
                store,
                ActionRequest::AgentRun {
                    agent_id,
                    observation,
                    actions,
                    stop_condition,
                    interval_ms,
                },
            );
        }
    };
    execute(runtime, store, request)
}

/// Start a run, stop it on SIGINT, and persist once it ends.
fn run_foreground(runtime: &mut Runtime, store: &DurableStore, request: ActionRequest) -> Result<()> {
    let ActionRequest::AgentRun { ref agent_id, .. } = request else {
        miette::bail!("expected an agent.run request");
    };
    let agent_id = agent_id.clone();
    dispatch(runtime, store, request)?;

    let handle = runtime.runner().handle(&agent_id)?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, handle.stop_flag())
        .into_diagnostic()?;
    tracing::info!(agent = %agent_id, "running, press Ctrl-C to stop");

    let status = handle.wait();
    runtime.persist(store)?;
    print_json(&serde_json::to_value(&status).into_diagnostic()?)
}

fn run_team(runtime: &mut Runtime, store: &DurableStore, action: TeamAction) -> Result<()> {
    let request = match action {
        TeamAction::Create {
            name,
            agents,
            context,
        } => ActionRequest::TeamCreate {
            options: CreateTeamOptions {
                name,
                agent_ids: agents,
                config: TeamConfig {
                    context,
                    ..Default::default()
                },
                ..Default::default()
            },
        },
        TeamAction::List => ActionRequest::TeamList,
        TeamAction::Show { team_id } => ActionRequest::TeamState { team_id },
        TeamAction::AddAgent { team_id, agent_id } => {
            ActionRequest::TeamAddAgent { team_id, agent_id }
        }
        TeamAction::RemoveAgent { team_id, agent_id } => {
            ActionRequest::TeamRemoveAgent { team_id, agent_id }
        }
        TeamAction::Summon { team_id } => ActionRequest::TeamSummon { team_id },
        TeamAction::Step {
            team_id,
            observation,
            actions,
        } => ActionRequest::TeamStep {
            team_id,
            observation,
            actions,
        },
        TeamAction::Dismiss { team_id } => ActionRequest::TeamDismiss { team_id },
        TeamAction::Delete { team_id } => ActionRequest::TeamDelete { team_id },
    };
    execute(runtime, store, request)
}

fn run_config(paths: &SriaPaths, action: ConfigAction) -> Result<()> {
    let path = paths.config_file();
    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                miette::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            SriaConfig::default().save(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        ConfigAction::Show => {
            let config = SriaConfig::load_or_default(&path)?;
            print!("{}", config.to_toml()?);
        }
    }
    Ok(())
}
