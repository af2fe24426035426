use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ProgressionMode;

/// snipseq - Operator console for robot snippet sequences
#[derive(Parser)]
#[command(name = "snipseq")]
#[command(about = "Run, pause, skip and stop ordered robot-program snippets")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a demo sequence of simulated snippets from an interactive console
    Run {
        /// Engine configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of simulated snippets
        #[arg(short = 'n', long, default_value_t = 3)]
        steps: usize,

        /// How long each simulated snippet moves, in milliseconds
        #[arg(long, default_value_t = 2_000)]
        step_ms: u64,

        /// Override the configured progression mode
        #[arg(short, long)]
        progression: Option<ProgressionMode>,

        /// Override the configured inter-step delay
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Add a global constraint with this name (repeatable)
        #[arg(short, long = "global")]
        globals: Vec<String>,

        /// Give every snippet its own scoped constraint
        #[arg(long)]
        scoped: bool,

        /// Simulate an enabled but disconnected robot transport
        #[arg(long)]
        transport_offline: bool,
    },
    /// Validate an engine configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
    /// Write a default engine configuration file
    InitConfig {
        /// Destination path
        path: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["snipseq"]).is_err());
    }

    #[test]
    fn test_cli_run_defaults() {
        let cli = Cli::try_parse_from(["snipseq", "run"]).unwrap();
        match cli.command {
            Commands::Run {
                config,
                steps,
                step_ms,
                progression,
                globals,
                scoped,
                transport_offline,
                ..
            } => {
                assert!(config.is_none());
                assert_eq!(steps, 3);
                assert_eq!(step_ms, 2_000);
                assert!(progression.is_none());
                assert!(globals.is_empty());
                assert!(!scoped);
                assert!(!transport_offline);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "snipseq",
            "run",
            "--progression",
            "continue_with_delay",
            "--delay-ms",
            "500",
            "-g",
            "speed_limit",
            "-g",
            "safe_zone",
            "--scoped",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                progression,
                delay_ms,
                globals,
                scoped,
                ..
            } => {
                assert_eq!(progression, Some(ProgressionMode::ContinueWithDelay));
                assert_eq!(delay_ms, Some(500));
                assert_eq!(globals, vec!["speed_limit", "safe_zone"]);
                assert!(scoped);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_progression() {
        let result = Cli::try_parse_from(["snipseq", "run", "--progression", "sometimes"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_validate_command() {
        let cli = Cli::try_parse_from(["snipseq", "validate", "/path/to/engine.json"]).unwrap();
        match cli.command {
            Commands::Validate { config } => {
                assert_eq!(config.to_str().unwrap(), "/path/to/engine.json");
            }
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_cli_init_config_command() {
        let cli = Cli::try_parse_from(["snipseq", "init-config", "engine.json"]).unwrap();
        assert!(matches!(cli.command, Commands::InitConfig { .. }));
    }
}
