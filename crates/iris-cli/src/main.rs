mod commands;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use iris_engine::EnrollPolicy;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "iris", version, about = "Iris enrollment and verification")]
pub struct Cli {
    /// Template database (overrides config and IRIS_DB_PATH).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Enroll an eye image under an identity.
    Enroll {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        image: PathBuf,
        /// append | single | replace (default from config).
        #[arg(long)]
        policy: Option<EnrollPolicy>,
    },
    /// Verify an eye image against a claimed identity.
    Verify {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        image: PathBuf,
    },
    /// Search every enrolled identity for a match.
    Identify {
        #[arg(long)]
        image: PathBuf,
    },
    /// List templates of one identity, or every identity.
    List {
        #[arg(long)]
        identity: Option<String>,
    },
    /// Remove one template, or a whole identity.
    Remove {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        template: Option<String>,
    },
    /// Show store and configuration status.
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::from(output::EXIT_INTERNAL);
        }
    };

    match runtime.block_on(commands::run(cli)) {
        Ok(report) => {
            if let Err(e) = output::print_json(&report.body) {
                eprintln!("error: failed to write output: {e}");
                return ExitCode::from(output::EXIT_INTERNAL);
            }
            report.exit_code()
        }
        Err(err) => output::render_error(&err),
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(fmt_layer);
    if tracing::subscriber::set_global_default(registry).is_err() {
        // Already initialised (tests).
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_enroll_with_policy() {
        let cli = Cli::try_parse_from([
            "iris", "--db", "/tmp/t.db", "-vv", "enroll", "--identity", "alice", "--image",
            "eye.png", "--policy", "replace",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/t.db")));
        match cli.command {
            Commands::Enroll {
                identity, policy, ..
            } => {
                assert_eq!(identity, "alice");
                assert_eq!(policy, Some(EnrollPolicy::Replace));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_policy() {
        let parsed = Cli::try_parse_from([
            "iris", "enroll", "--identity", "a", "--image", "x.png", "--policy", "twice",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["iris", "status", "--config", "iris.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("iris.toml")));
        assert!(matches!(cli.command, Commands::Status));
    }
}
