//! Command-line interface argument parsing.
//!
//! One invocation runs one pipeline unit: the event JSON comes from a file
//! or stdin and the unit's JSON result goes to stdout.

use crate::units::Unit;
use clap::Parser;
use std::path::PathBuf;

/// uwtriage - underwriting document triage with local models
///
/// Runs one stage of the triage pipeline (classify, extract, analyze,
/// detect, score, act) on a JSON event and prints the JSON result.
///
/// Examples:
///   uwtriage create-job --event new-job.json
///   echo '{"detail":{"object":{"key":"uploads/JOB/app.pdf"}}}' | uwtriage classify
///   uwtriage score --event score.json --model qwen2.5:14b --pretty
///   uwtriage --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Pipeline unit to run
    #[arg(value_enum, required_unless_present = "init_config")]
    pub unit: Option<Unit>,

    /// Event JSON file; reads stdin when omitted or "-"
    #[arg(short, long, value_name = "FILE")]
    pub event: Option<PathBuf>,

    /// Ollama model for reasoning stages
    #[arg(short, long, env = "UWTRIAGE_MODEL")]
    pub model: Option<String>,

    /// Ollama model for classification and extraction
    #[arg(long, value_name = "MODEL")]
    pub vision_model: Option<String>,

    /// Ollama API endpoint URL
    #[arg(long, env = "OLLAMA_URL", value_name = "URL")]
    pub ollama_url: Option<String>,

    /// Directory holding job records, blobs and rendered pages
    #[arg(long, env = "UWTRIAGE_DATA_DIR", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Knowledge base retrieval endpoint
    #[arg(long, value_name = "URL")]
    pub kb_url: Option<String>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .uwtriage.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Temperature for model responses (0.0 - 1.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Reject job status transitions that move backwards
    #[arg(long)]
    pub strict: bool,

    /// Pretty-print the result JSON
    #[arg(long)]
    pub pretty: bool,

    /// Generate a default .uwtriage.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        for (name, url) in [("Ollama", &self.ollama_url), ("Knowledge base", &self.kb_url)] {
            if let Some(url) = url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(format!("{} URL must start with 'http://' or 'https://'", name));
                }
            }
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=1.0).contains(&temperature) {
                return Err("Temperature must be between 0.0 and 1.0".to_string());
            }
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        Ok(())
    }

    /// Event file, or `None` for stdin.
    pub fn event_path(&self) -> Option<&PathBuf> {
        self.event.as_ref().filter(|p| p.as_os_str() != "-")
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
