//! Command-line interface.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use crate::config::{DetectorConfig, DEFAULT_NODE_LIMIT};

/// Offline use-after-free and data-race detector for traces of
/// task-based, event-loop programs.
#[derive(Parser, Debug)]
#[command(name = "taskgrind", version, about, long_about = None)]
pub struct Cli {
    /// Trace file to analyze
    pub trace: PathBuf,

    /// Also sweep each allocation for data races
    #[arg(long)]
    pub data_races: bool,

    /// Report pairs matching the in-task initialization heuristic
    /// instead of suppressing them
    #[arg(long)]
    pub no_suppress: bool,

    /// Keep only the first finding per free (UAF) or allocation (race)
    #[arg(long)]
    pub first_per_object: bool,

    /// Give up when the compressed graph exceeds this many nodes
    #[arg(long, default_value_t = DEFAULT_NODE_LIMIT)]
    pub node_limit: usize,

    /// Keep analyzing past the node limit
    #[arg(long)]
    pub run_over_node_limit: bool,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Write the report to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            data_races: self.data_races,
            suppress_false_positives: !self.no_suppress,
            first_per_object: self.first_per_object,
            node_limit: self.node_limit,
            run_over_node_limit: self.run_over_node_limit,
            ..DetectorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["taskgrind", "trace.txt"]);
        assert_eq!(cli.trace, PathBuf::from("trace.txt"));
        assert_eq!(cli.format, OutputFormat::Text);
        let cfg = cli.detector_config();
        assert!(!cfg.data_races);
        assert!(cfg.suppress_false_positives);
        assert_eq!(cfg.node_limit, DEFAULT_NODE_LIMIT);
    }

    #[test]
    fn test_flags_map_to_config() {
        let cli = Cli::parse_from([
            "taskgrind",
            "--data-races",
            "--no-suppress",
            "--first-per-object",
            "--node-limit",
            "500",
            "--run-over-node-limit",
            "--format",
            "json",
            "trace.txt",
        ]);
        let cfg = cli.detector_config();
        assert!(cfg.data_races);
        assert!(!cfg.suppress_false_positives);
        assert!(cfg.first_per_object);
        assert_eq!(cfg.node_limit, 500);
        assert!(cfg.run_over_node_limit);
        assert_eq!(cli.format, OutputFormat::Json);
    }

    #[test]
    fn test_verbosity_counts() {
        let cli = Cli::parse_from(["taskgrind", "-vv", "trace.txt"]);
        assert_eq!(cli.verbose, 2);
    }
}
