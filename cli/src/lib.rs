//! Thin wiring around `klack-core`.
//!
//! The dispatcher talks to this binary over pipes: a hook-context JSON
//! payload on stdin, a structured JSON answer on stdout. Human-readable
//! summaries and all tracing go to stderr so stdout stays a clean JSON
//! channel. Exit code 0 means the command may proceed (bypassed or clean
//! session), 2 means it stays blocked.

use std::io::Read;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use klack_core::Handler;
use klack_core::SessionGate;
use klack_core::config::Config;
use klack_core::config::find_klack_home;
use klack_core::dump;
use klack_core::handler::format_bypass_message;
use klack_core::handler::format_denial_message;
use klack_core::protocol::HookContext;
use klack_core::protocol::SessionCheck;
use klack_core::system_clock;
use tracing_subscriber::EnvFilter;

/// Exit code signalling that the command stays blocked.
pub const EXIT_BLOCKED: i32 = 2;

/// klack: exception tokens and session poisoning for hook-gated commands.
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Evaluate an exception token for a blocked command. Reads a
    /// hook-context JSON payload from stdin.
    Hook,

    /// Session-poisoning operations.
    #[clap(subcommand)]
    Session(SessionCommand),

    /// Print journal and rate-limit statistics as JSON.
    Status,

    /// Trim audit journals by age and drop expired sessions.
    Cleanup,

    /// Write a sanitized crash dump of the current configuration.
    Dump(DumpArgs),
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Gate a command against the poisoned-session state. Reads a
    /// hook-context JSON payload from stdin.
    Check,

    /// Poison the session after a validator block. Reads a hook-context
    /// JSON payload from stdin.
    Poison(PoisonArgs),
}

#[derive(Debug, clap::Args)]
pub struct PoisonArgs {
    /// Comma-separated error codes the session must acknowledge.
    #[arg(long, value_delimiter = ',')]
    pub codes: Vec<String>,

    /// Human-readable block message shown on subsequent commands.
    #[arg(long, default_value = "")]
    pub message: String,
}

#[derive(Debug, clap::Args)]
pub struct DumpArgs {
    /// Directory the dump file is written into. Must exist.
    #[arg(long)]
    pub dir: std::path::PathBuf,
}

pub fn run_main(cli: Cli) -> anyhow::Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error")),
        )
        .with_writer(std::io::stderr)
        .init();

    let klack_home = find_klack_home()?;
    let config = Config::load(&klack_home)?;
    let clock = system_clock();

    match cli.command {
        Command::Hook => {
            let hook = read_hook_context()?;
            let handler = Handler::new(&config, clock);
            let response = handler.handle(&hook);

            let summary = if response.bypassed {
                format_bypass_message(&response)
            } else {
                format_denial_message(&response)
            };
            eprintln!("{summary}");
            println!("{}", serde_json::to_string(&response)?);

            Ok(if response.bypassed { 0 } else { EXIT_BLOCKED })
        }
        Command::Session(SessionCommand::Check) => {
            let hook = read_hook_context()?;
            let gate = SessionGate::new(&config.sessions, &config.exceptions.env_var, clock);
            let check = gate.check(&hook);

            if let SessionCheck::Blocked { message, .. } = &check {
                eprintln!("❌ {message}");
            }
            println!("{}", serde_json::to_string(&check)?);

            Ok(match check {
                SessionCheck::Blocked { .. } => EXIT_BLOCKED,
                SessionCheck::Clean | SessionCheck::Unpoisoned { .. } => 0,
            })
        }
        Command::Session(SessionCommand::Poison(args)) => {
            let hook = read_hook_context()?;
            let gate = SessionGate::new(&config.sessions, &config.exceptions.env_var, clock);
            gate.poison(&hook, &args.codes, &args.message);
            Ok(0)
        }
        Command::Status => {
            let handler = Handler::new(&config, clock.clone());
            let gate = SessionGate::new(&config.sessions, &config.exceptions.env_var, clock);

            let exception_stats = handler.journal().stats()?;
            let session_stats = gate.journal().stats()?;
            let usage = handler.rate_limiter().usage_snapshot();

            let status = serde_json::json!({
                "exceptions": {
                    "log_file": exception_stats.log_file,
                    "size_mb": exception_stats.size_mb,
                    "entry_count": exception_stats.entry_count,
                    "backup_count": exception_stats.backup_count,
                },
                "sessions": {
                    "log_file": session_stats.log_file,
                    "size_mb": session_stats.size_mb,
                    "entry_count": session_stats.entry_count,
                    "backup_count": session_stats.backup_count,
                    "tracked": gate.tracker().state_snapshot().sessions.len(),
                },
                "rate_limit": {
                    "global_hourly_count": usage.global_hourly_count,
                    "global_daily_count": usage.global_daily_count,
                    "hour_start_time": usage.hour_start_time,
                    "day_start_time": usage.day_start_time,
                },
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(0)
        }
        Command::Cleanup => {
            let handler = Handler::new(&config, clock.clone());
            let gate = SessionGate::new(&config.sessions, &config.exceptions.env_var, clock);

            let exception_entries = handler.journal().cleanup()?;
            let session_entries = gate.journal().cleanup()?;
            let sessions = gate.tracker().cleanup_expired();
            if sessions > 0 {
                gate.tracker().save()?;
            }

            eprintln!(
                "removed {exception_entries} exception entries, {session_entries} session entries, {sessions} expired sessions"
            );
            Ok(0)
        }
        Command::Dump(args) => {
            let config_value = serde_json::to_value(&config).context("serialize config")?;
            let path = dump::write_dump(&args.dir, &config_value, &clock)?;
            eprintln!("wrote {}", path.display());
            Ok(0)
        }
    }
}

fn read_hook_context() -> anyhow::Result<HookContext> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("read hook context from stdin")?;
    serde_json::from_str(&input).context("parse hook context JSON")
}
