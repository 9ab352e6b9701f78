//! Command line interface of the `flowrun` binary.
//!
//! [`Cli`] carries the [`Command`] (demo, check) and the global flags
//! (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

/// flowrun: drive flow runs against an orchestration API.
#[derive(Debug, Parser)]
#[command(name = "flowrun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Settings file to load instead of ./flowrun.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the built-in demo flow and print its final state.
    Demo {
        /// Number of attempts that fail before the flow succeeds.
        #[arg(long, default_value_t = 0)]
        fail_times: u32,

        /// Retries the orchestrator may grant after a failed attempt.
        #[arg(long, default_value_t = 0)]
        retries: u32,

        /// RUNNING proposals held in PENDING before the run is admitted.
        /// Only honoured by the in-memory orchestrator.
        #[arg(long, default_value_t = 0)]
        hold: u32,

        /// Drive the run from a blocked thread instead of a runtime.
        #[arg(long, default_value_t = false)]
        blocking: bool,

        /// Flow name.
        #[arg(long, default_value = "demo")]
        name: String,

        /// Flow parameter as KEY=VALUE. VALUE is read as JSON, or as a string
        /// when it is not valid JSON.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
    },

    /// Check that the configured orchestration API is reachable.
    Check,
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_parses_demo_defaults() {
        let cli = Cli::parse_from(["flowrun", "demo"]);
        match cli.command {
            Command::Demo {
                fail_times,
                retries,
                hold,
                blocking,
                name,
                params,
            } => {
                assert_eq!(fail_times, 0);
                assert_eq!(retries, 0);
                assert_eq!(hold, 0);
                assert!(!blocking);
                assert_eq!(name, "demo");
                assert!(params.is_empty());
            }
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_parses_demo_flags() {
        let cli = Cli::parse_from([
            "flowrun",
            "demo",
            "--fail-times",
            "1",
            "--retries",
            "2",
            "--hold",
            "3",
            "--blocking",
            "--param",
            "greeting=hi",
            "--param",
            "count=4",
        ]);
        match cli.command {
            Command::Demo {
                fail_times,
                retries,
                hold,
                blocking,
                params,
                ..
            } => {
                assert_eq!((fail_times, retries, hold), (1, 2, 3));
                assert!(blocking);
                assert_eq!(
                    params,
                    vec![
                        ("greeting".to_string(), json!("hi")),
                        ("count".to_string(), json!(4)),
                    ]
                );
            }
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["flowrun", "--config", "other.toml", "--verbose", "check"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("other.toml")));
        assert!(matches!(cli.command, Command::Check));
    }

    #[test]
    fn malformed_param_is_rejected() {
        assert!(parse_param("no-equals").is_err());
        assert!(parse_param("=1").is_err());
        assert_eq!(parse_param("x=").unwrap(), ("x".to_string(), json!("")));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
