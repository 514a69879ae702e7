//! Agent Relay - Main Entry Point
//!
//! Runs one agent per process (the front-line orchestrator or a specialist,
//! depending on the config file) or the whole team in-process with `demo`.

use agentrelay::broker::{BrokerConnector, InMemoryBroker, InMemoryConnector};
use agentrelay::config::{AgentConfig, BrokerScheme};
use agentrelay::human::StdinHuman;
use agentrelay::observability::logging::{parse_level, LogFormat};
use agentrelay::observability::{
    health_port_from_env, init_default_logging, init_logging, HealthServer,
};
use agentrelay::pipeline::FrontLine;
use agentrelay::session::{SessionError, SessionSupervisor, SessionWorkload};
use agentrelay::specialist::{SpecialistAgent, SpecialistRole};
use agentrelay::transport::MqttConnector;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Time specialists get to finish their current poll after a shutdown request
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Multi-agent pull request testing over a thread broker
#[derive(Parser)]
#[command(name = "agentrelay")]
#[command(about = "Delegates pull request checkout, diff review and test runs to specialist agents")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent described by the config file
    Run,
    /// Run the orchestrator and all specialists over an in-process broker
    Demo {
        /// Directory the checkout specialist clones into
        #[arg(long, value_name = "DIR", default_value = ".")]
        workspace: PathBuf,
    },
    /// Validate the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

type MainResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        level => {
            let format =
                LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".into()));
            let level = if level == 1 { "debug" } else { "trace" };
            init_logging(parse_level(level), format, false);
        }
    }

    info!("Starting agentrelay v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Commands::Run => match load_configuration(&cli.config) {
            Ok(config) => run_agent(config).await,
            Err(e) => Err(e),
        },
        Commands::Demo { workspace } => run_demo(workspace).await,
        Commands::Config { show } => {
            load_configuration(&cli.config).and_then(|config| handle_config_command(config, show))
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> MainResult<AgentConfig> {
    let path = match config_path {
        Some(path) => path.clone(),
        None => AgentConfig::find_default_file()?,
    };
    info!("Loading configuration from: {}", path.display());
    Ok(AgentConfig::load_from_file(&path)?)
}

fn build_connector(config: &AgentConfig) -> MainResult<Arc<dyn BrokerConnector>> {
    let connector: Arc<dyn BrokerConnector> = match config.broker_scheme()? {
        BrokerScheme::Memory => Arc::new(
            InMemoryConnector::new(Arc::new(InMemoryBroker::new()))
                .with_wait_for_agents(config.broker.wait_for_agents, config.wait_for_agents_timeout()),
        ),
        BrokerScheme::Mqtt | BrokerScheme::Mqtts => {
            Arc::new(MqttConnector::new(config.broker.clone()))
        }
    };
    Ok(connector)
}

fn start_health_server(agent_id: &str, supervisor: &SessionSupervisor) {
    let Some(port) = health_port_from_env() else {
        info!("Health server disabled");
        return;
    };
    let server = Arc::new(HealthServer::new(
        agent_id.to_string(),
        port,
        supervisor.health(),
    ));
    tokio::spawn(server.start());
}

async fn run_agent(config: AgentConfig) -> MainResult<()> {
    let identity = config.identity();
    info!(agent_id = %identity.id, "Application starting");

    let connector = build_connector(&config)?;
    let supervisor = SessionSupervisor::new(connector, identity.clone(), config.reconnect_policy());
    start_health_server(&identity.id, &supervisor);

    match &config.specialist {
        Some(section) => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let tool_config = section.tool_config();
            let agent = SpecialistAgent::with_builtin_tool(
                section.role,
                section.coordinator_id.clone(),
                section.poll_timeout(),
                Some(&tool_config),
            )
            .await?
            .with_shutdown(shutdown_rx);

            let mut task = spawn_supervised(supervisor, agent);
            tokio::select! {
                joined = &mut task => joined?.map_err(Into::into),
                _ = shutdown_signal() => {
                    shutdown_tx.send_replace(true);
                    finish_within(task, section.poll_timeout() + SHUTDOWN_GRACE).await;
                    Ok(())
                }
            }
        }
        None => {
            let front_line = FrontLine::new(config.pipeline_settings(), StdinHuman::new());
            let mut task = spawn_supervised(supervisor, front_line);
            tokio::select! {
                joined = &mut task => joined?.map_err(Into::into),
                _ = shutdown_signal() => {
                    task.abort();
                    Ok(())
                }
            }
        }
    }
}

async fn run_demo(workspace: PathBuf) -> MainResult<()> {
    let config = AgentConfig::demo();
    let broker = Arc::new(InMemoryBroker::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_timeout = Duration::from_secs(1);

    let mut specialists = Vec::new();
    for role in SpecialistRole::ALL {
        let identity = role.default_identity();
        let tool_config = serde_json::json!({ "workspace_dir": workspace });
        let agent = SpecialistAgent::with_builtin_tool(
            role,
            config.agent.id.clone(),
            poll_timeout,
            Some(&tool_config),
        )
        .await?
        .with_shutdown(shutdown_rx.clone());

        let supervisor = SessionSupervisor::new(
            Arc::new(InMemoryConnector::new(broker.clone())),
            identity,
            config.reconnect_policy(),
        );
        specialists.push(spawn_supervised(supervisor, agent));
    }

    let connector = InMemoryConnector::new(broker.clone()).with_wait_for_agents(
        config.broker.wait_for_agents,
        config.wait_for_agents_timeout(),
    );
    let supervisor = SessionSupervisor::new(
        Arc::new(connector),
        config.identity(),
        config.reconnect_policy(),
    );
    start_health_server(&config.agent.id, &supervisor);

    let front_line = FrontLine::new(config.pipeline_settings(), StdinHuman::new());
    let mut task = spawn_supervised(supervisor, front_line);
    let result: MainResult<()> = tokio::select! {
        joined = &mut task => joined?.map_err(Into::into),
        _ = shutdown_signal() => {
            task.abort();
            Ok(())
        }
    };

    shutdown_tx.send_replace(true);
    for specialist in specialists {
        finish_within(specialist, poll_timeout + SHUTDOWN_GRACE).await;
    }
    result
}

fn spawn_supervised<W>(
    supervisor: SessionSupervisor,
    mut workload: W,
) -> JoinHandle<Result<(), SessionError>>
where
    W: SessionWorkload + 'static,
{
    tokio::spawn(async move { supervisor.run(&mut workload).await })
}

/// Wait for a supervised task to stop, aborting it after `grace`
async fn finish_within(mut task: JoinHandle<Result<(), SessionError>>, grace: Duration) {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "Agent stopped with error"),
        Ok(Err(e)) => warn!(error = %e, "Agent task failed"),
        Err(_) => {
            warn!("Agent did not stop in time, aborting");
            task.abort();
        }
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Could not install SIGTERM handler");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Received Ctrl-C, shutting down gracefully...");
    }
}

fn handle_config_command(config: AgentConfig, show: bool) -> MainResult<()> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
