//! uwtriage - underwriting document triage pipeline
//!
//! Runs one pipeline unit per invocation against local job and blob
//! stores, with Ollama serving the vision and reasoning models.
//!
//! Exit codes:
//!   0 - Unit succeeded
//!   1 - Runtime error (bad event, config, client setup)
//!   2 - Unit returned an `{"error": ...}` result

mod agent;
mod analysis;
mod chunking;
mod cli;
mod config;
mod jobs;
mod knowledge;
mod models;
mod pages;
mod parser;
mod store;
mod units;

use anyhow::{Context, Result};
use cli::Args;
use config::Config;
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    debug!("uwtriage v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run_unit(&args).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Unit failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .uwtriage.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(config::CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit it manually.",
            config::CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", config::CONFIG_FILE))?;

    eprintln!("Created {} with default settings.", config::CONFIG_FILE);
    Ok(())
}

/// Initialize logging on stderr so stdout carries only the result JSON.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run the requested unit. Returns the exit code (0 or 2).
async fn run_unit(args: &Args) -> Result<i32> {
    let Some(unit) = args.unit else {
        anyhow::bail!("No unit given");
    };

    let config = load_config(args)?;
    let services = build_services(&config)?;
    let event = read_event(args)?;

    info!(unit = ?unit, "Running unit");
    let output = units::run(unit, &event, &services).await;

    let rendered = if config.general.pretty {
        serde_json::to_string_pretty(&output)
    } else {
        serde_json::to_string(&output)
    }
    .context("Failed to serialize unit output")?;
    println!("{}", rendered);

    if let Some(message) = output.get("error") {
        warn!(unit = ?unit, "Unit reported an error: {}", message);
        return Ok(2);
    }
    Ok(0)
}

/// Load configuration from file or use defaults, then apply CLI overrides.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        Config::load(config_path)?
    } else {
        match Config::load_default() {
            Ok(Some(config)) => {
                debug!("Loaded default config from {}", config::CONFIG_FILE);
                config
            }
            Ok(None) => {
                debug!("No config file found, using defaults");
                Config::default()
            }
            Err(e) => {
                warn!("Failed to load config: {:#}", e);
                Config::default()
            }
        }
    };

    config.merge_with_args(args);
    Ok(config)
}

/// Construct the stores and clients every unit shares.
fn build_services(config: &Config) -> Result<units::Services> {
    let model = &config.model;
    let job_store: Arc<dyn jobs::JobStore> = Arc::new(
        jobs::SqliteJobStore::open(config.storage.jobs_db())
            .context("Failed to open job store")?,
    );
    let tracker = if config.pipeline.strict_transitions {
        jobs::StatusTracker::strict(job_store)
    } else {
        jobs::StatusTracker::new(job_store)
    };

    let backend = agent::OllamaBackend::new(&model.ollama_url, model.timeout_seconds)
        .context("Failed to create Ollama client")?;

    let knowledge = match &config.knowledge_base.url {
        Some(url) => {
            let kb = knowledge::HttpKnowledgeBase::new(
                url,
                config.knowledge_base.top_k,
                model.timeout_seconds,
            )
            .context("Failed to create knowledge base client")?;
            Some(Arc::new(kb) as Arc<dyn knowledge::KnowledgeBase>)
        }
        None => None,
    };

    let reasoning = agent::AgentConfig {
        ollama_url: model.ollama_url.clone(),
        model_name: model.name.clone(),
        temperature: model.temperature,
        max_iterations: model.max_iterations,
        timeout_seconds: model.timeout_seconds,
        max_context_messages: model.max_context_messages,
    };
    let vision = agent::AgentConfig {
        model_name: model.vision_name.clone(),
        ..reasoning.clone()
    };

    Ok(units::Services {
        tracker,
        blobs: Arc::new(store::FsBlobStore::new(config.storage.blobs_dir())),
        backend: Arc::new(backend),
        knowledge,
        pages: Arc::new(pages::DirPageSource::new(config.storage.pages_dir())),
        settings: units::Settings {
            reasoning,
            vision,
            batch_size: config.pipeline.batch_size.max(1),
            max_chunk_bytes: config.pipeline.max_chunk_bytes,
        },
    })
}

/// Read the event JSON from the --event file or stdin.
fn read_event(args: &Args) -> Result<Value> {
    let raw = match args.event_path() {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file: {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read event from stdin")?;
            buf
        }
    };

    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let event: Value = serde_json::from_str(&raw).context("Event is not valid JSON")?;

    // Events may arrive double-encoded as a JSON string.
    match event {
        Value::String(inner) => serde_json::from_str(&inner).context("Event is not valid JSON"),
        other => Ok(other),
    }
}
