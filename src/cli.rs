//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// cropsys - crop rotation indicators with AI-assisted gap filling
///
/// Stores cropping systems as JSON documents, rolls intervention values up
/// to steps and system totals, and asks a local Ollama model to estimate
/// missing indicators.
///
/// Examples:
///   cropsys import ./rotation.json
///   cropsys prepare rotation-1
///   cropsys run rotation-1 --concurrency 3
///   cropsys compute rotation-1 0 2 gnr
///   cropsys report rotation-1 --format json --output report.json
///   cropsys init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    ///
    /// If not specified, looks for .cropsys.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding systems and the process log
    #[arg(long, value_name = "DIR", env = "CROPSYS_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Ollama model used for estimates
    #[arg(short, long, env = "CROPSYS_MODEL", global = true)]
    pub model: Option<String>,

    /// Ollama API endpoint URL
    #[arg(long, env = "OLLAMA_URL", global = true)]
    pub ollama_url: Option<String>,

    /// HTTP timeout for one model request, in seconds
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,

    /// Disable AI calculation for this invocation
    #[arg(long, global = true)]
    pub no_ai: bool,

    /// User recorded in process logs
    #[arg(long, env = "USER", default_value = "local", global = true)]
    pub user: String,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate a default .cropsys.toml configuration file
    InitConfig,

    /// Import a system document (JSON) into the data directory
    Import {
        /// System document to import
        file: PathBuf,
    },

    /// Recompute step rollups and system totals
    Recompute {
        /// System id
        system: String,
    },

    /// Count missing indicators and estimate batch duration
    Prepare {
        /// System id
        system: String,
    },

    /// Run an AI batch over missing (or all non-user) indicators
    Run {
        /// System id
        system: String,

        /// Recompute every indicator not entered by a user
        #[arg(long)]
        all: bool,

        /// Number of concurrent model calls
        #[arg(long, value_name = "NUM")]
        concurrency: Option<usize>,

        /// Process log created by `prepare`
        #[arg(long, value_name = "ID")]
        process_log: Option<String>,
    },

    /// Ask a running batch to stop after its in-flight calls
    Abort {
        /// Process log id
        process_log: String,
    },

    /// Estimate a single indicator
    Compute {
        /// System id
        system: String,
        /// Step index (0-based)
        step: usize,
        /// Intervention index within the step (0-based)
        intervention: usize,
        /// Indicator key, e.g. gnr or coutsPhytos
        key: String,
    },

    /// Continue the conversation on a single indicator
    Refine {
        /// System id
        system: String,
        /// Step index (0-based)
        step: usize,
        /// Intervention index within the step (0-based)
        intervention: usize,
        /// Indicator key
        key: String,
        /// Message sent to the model
        #[arg(short = 'M', long)]
        message: String,
    },

    /// Render a system report
    Report {
        /// System id
        system: String,

        /// Output format (markdown, json)
        #[arg(long, default_value = "markdown", value_name = "FORMAT")]
        format: OutputFormat,

        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref url) = self.ollama_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        match self.command {
            Command::Run {
                concurrency: Some(0),
                ..
            } => return Err("Concurrency must be at least 1".to_string()),
            Command::Import { ref file } if !file.is_file() => {
                return Err(format!("System file does not exist: {}", file.display()));
            }
            Command::Refine { ref message, .. } if message.trim().is_empty() => {
                return Err("Refinement message must not be empty".to_string());
            }
            _ => {}
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings. `--quiet` wins
    /// over a configured verbose default.
    pub fn log_level(&self, verbose_default: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || verbose_default {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args(command: Command) -> Args {
        Args {
            command,
            config: None,
            data_dir: None,
            model: None,
            ollama_url: None,
            timeout: None,
            no_ai: false,
            user: "tester".to_string(),
            verbose: false,
            quiet: false,
        }
    }

    fn run(concurrency: Option<usize>) -> Command {
        Command::Run {
            system: "s".to_string(),
            all: false,
            concurrency,
            process_log: None,
        }
    }

    #[test]
    fn test_parse_run_subcommand() {
        let args = Args::try_parse_from([
            "cropsys",
            "run",
            "rotation-1",
            "--all",
            "--concurrency",
            "3",
            "--verbose",
        ])
        .unwrap();

        assert!(args.verbose);
        match args.command {
            Command::Run {
                system,
                all,
                concurrency,
                process_log,
            } => {
                assert_eq!(system, "rotation-1");
                assert!(all);
                assert_eq!(concurrency, Some(3));
                assert_eq!(process_log, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_refine_subcommand() {
        let args = Args::try_parse_from([
            "cropsys", "refine", "r1", "0", "2", "gnr", "--message", "use 90 l/ha",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            Command::Refine { step: 0, intervention: 2, ref message, .. } if message == "use 90 l/ha"
        ));
    }

    #[test]
    fn test_validation_invalid_url() {
        let mut args = make_args(run(None));
        args.ollama_url = Some("localhost:11434".to_string());
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_zero_concurrency() {
        assert!(make_args(run(Some(0))).validate().is_err());
        assert!(make_args(run(Some(2))).validate().is_ok());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args(Command::InitConfig);
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args(Command::InitConfig);
        assert_eq!(args.log_level(false), tracing::Level::INFO);
        assert_eq!(args.log_level(true), tracing::Level::DEBUG);

        args.verbose = true;
        assert_eq!(args.log_level(false), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(true), tracing::Level::ERROR);
    }
}
