use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepflow_core::config::AppConfig;
use stepflow_core::event::EventKind;
use stepflow_engine::{PipelineDefinition, PipelineLoader, RunLogger, WorkflowInput};

#[derive(Parser)]
#[command(name = "stepflow", version, about = "Composable workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline and print the response as JSON
    Run {
        /// Pipeline definition (TOML)
        pipeline: PathBuf,
        /// Input message; read from stdin when omitted
        #[arg(short, long)]
        input: Option<String>,
        /// Parse the input as JSON instead of plain text
        #[arg(long)]
        json: bool,
        /// Session to load and persist
        #[arg(short, long, env = "STEPFLOW_SESSION")]
        session: Option<String>,
        /// Print agent output chunks as they stream
        #[arg(long)]
        stream: bool,
    },
    /// Build a pipeline without running it
    Validate {
        /// Pipeline definition (TOML)
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stepflow=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            pipeline,
            input,
            json,
            session,
            stream,
        } => run_pipeline(config, &pipeline, input, json, session, stream).await,
        Commands::Validate { pipeline } => validate_pipeline(&config, &pipeline),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home) = dirs_home() {
        let home_config = home.join(".stepflow").join("config.toml");
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    info!("No config file found, using defaults");
    Ok(AppConfig::default())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn read_input(input: Option<String>, json: bool) -> anyhow::Result<WorkflowInput> {
    let text = match input {
        Some(text) => text,
        None => io::stdin()
            .lock()
            .lines()
            .map_while(|l| l.ok())
            .collect::<Vec<_>>()
            .join("\n"),
    };
    if json {
        let value: serde_json::Value = serde_json::from_str(&text)?;
        Ok(WorkflowInput::from(value))
    } else {
        Ok(WorkflowInput::from(text))
    }
}

async fn run_pipeline(
    mut config: AppConfig,
    pipeline: &Path,
    input: Option<String>,
    json: bool,
    session: Option<String>,
    stream: bool,
) -> anyhow::Result<()> {
    if session.is_some() {
        config.workflow.session_id = session;
    }
    if stream {
        config.workflow.stream = true;
    }

    let def = PipelineDefinition::load(pipeline)?;
    let loader = PipelineLoader::new().with_defaults(config.defaults.clone());
    let mut builder = loader.workflow_builder(&def, &config)?;
    if config.workflow.session_id.is_some() {
        let storage_config = config.storage.clone().unwrap_or_default();
        builder = builder.storage(stepflow_memory::open_storage(&storage_config)?);
    }
    let workflow = builder.build()?;
    if !config.events.enabled && (config.workflow.stream || config.log.is_some()) {
        warn!("Events are disabled; streaming output and run logs will be empty");
    }

    let cancel = workflow.cancel_token();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        ctrl_c.cancel();
    });

    let bus = workflow.events();
    let log_cancel = cancel.child_token();
    let logger = match config.log {
        Some(ref log) if log.enabled && config.events.enabled => {
            let key = config
                .workflow
                .session_id
                .clone()
                .unwrap_or_else(|| workflow.id().to_string());
            info!(level = log.level, "RunLogger started");
            Some(RunLogger::new(log.log_dir(), log.level).spawn(&bus, key, log_cancel.clone()))
        }
        _ => None,
    };

    if config.workflow.stream {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if event.kind == EventKind::StepOutput {
                    if let Some(chunk) = event.payload["chunk"].as_str() {
                        let mut stderr = io::stderr();
                        stderr.write_all(chunk.as_bytes()).ok();
                        stderr.flush().ok();
                    }
                }
                if event.kind.is_terminal() {
                    break;
                }
            }
        });
    }

    let result = workflow.run(read_input(input, json)?).await;
    // Runs rejected before starting emit no terminal event.
    log_cancel.cancel();

    if let Some(handle) = logger {
        match handle.await {
            Ok(Some(path)) => info!(path = %path.display(), "Run log written"),
            Ok(None) => warn!("Run log could not be written"),
            Err(e) => warn!(error = %e, "RunLogger task failed"),
        }
    }

    let response = result?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn validate_pipeline(config: &AppConfig, pipeline: &Path) -> anyhow::Result<()> {
    let def = PipelineDefinition::load(pipeline)?;
    let loader = PipelineLoader::new().with_defaults(config.defaults.clone());
    let workflow = loader.build_workflow(&def, config)?;
    println!(
        "Pipeline '{}' ({}) is valid: {} node(s)",
        workflow.name(),
        workflow.id(),
        workflow.nodes().len()
    );
    for (i, node) in workflow.nodes().iter().enumerate() {
        println!("  {}. {:?}", i + 1, node);
    }
    Ok(())
}
