//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Flux command-line arguments.
///
/// Flags given here win over the values in `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "flux", about = "Flux action sync and replication core")]
pub struct CliArgs {
    /// Number of simulated peers joining the host.
    #[arg(long, default_value_t = 2)]
    pub peers: u32,

    /// Number of simulation ticks to run.
    #[arg(long, default_value_t = 120)]
    pub ticks: u32,

    /// Jitter buffer delay in milliseconds.
    #[arg(long)]
    pub jitter_delay_ms: Option<f64>,

    /// Simulation tick rate (Hz).
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Tracing filter directive, e.g. `debug` or `flux_net=trace`.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Capture dispatch backtraces into actions.
    #[arg(long)]
    pub capture_stack: bool,

    /// Directory holding `config.ron` instead of the platform default.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Overwrites every setting the user passed a flag for.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(delay) = args.jitter_delay_ms {
            self.network.jitter_buffer_delay_ms = delay;
        }
        if let Some(rate) = args.tick_rate {
            self.network.tick_rate = rate;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if args.capture_stack {
            self.actions.capture_stack = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> CliArgs {
        CliArgs {
            peers: 2,
            ticks: 120,
            jitter_delay_ms: None,
            tick_rate: None,
            log_level: None,
            capture_stack: false,
            config: None,
        }
    }

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            jitter_delay_ms: Some(250.0),
            log_level: Some("trace".to_string()),
            ..empty_args()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.jitter_buffer_delay_ms, 250.0);
        assert_eq!(config.debug.log_level, "trace");
        assert_eq!(config.network.tick_rate, 60);
        assert!(!config.actions.capture_stack);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&empty_args());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parse_flags() {
        let args = CliArgs::parse_from(["flux", "--peers", "4", "--tick-rate", "30", "--capture-stack"]);
        assert_eq!(args.peers, 4);
        assert_eq!(args.tick_rate, Some(30));
        assert!(args.capture_stack);
        assert_eq!(args.ticks, 120);
    }
}
