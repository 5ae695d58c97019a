use crate::audit::AuditOutcome;
use crate::authority::{CommandType, WaRole};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// `CIRIS` - guardrailed cognitive-task runtime with a hash-chained audit log.
#[derive(Parser, Debug)]
#[command(name = "ciris")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A guardrailed agent runtime with an auditable decision trail.", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.ciris/config.toml, created on first run)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent and run until it has shut down (Ctrl-C starts the shutdown)
    Run,

    /// Queue a task; a running agent picks it up on its next round
    Submit {
        /// What the agent should do
        description: String,

        /// Lower runs first; negative values are critical
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,

        /// Channel replies go to (default: agent.default_channel)
        #[arg(long)]
        channel: Option<String>,

        /// Who is asking
        #[arg(long)]
        requester: Option<String>,
    },

    /// Show the last status written by the agent
    Status,

    /// Inspect the audit log
    Audit {
        #[command(subcommand)]
        audit_command: AuditCommands,
    },

    /// Wise Authority keys, signed commands and manifests
    Wa {
        #[command(subcommand)]
        wa_command: WaCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuditCommands {
    /// Recompute the hash chain from genesis
    Verify,

    /// List audit records, oldest first
    Query {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long)]
        stakeholder: Option<String>,

        /// OK, ERROR, DEFERRED or BLOCKED
        #[arg(long)]
        outcome: Option<AuditOutcome>,

        #[arg(long)]
        correlation: Option<String>,

        /// RFC 3339 lower bound
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// RFC 3339 upper bound
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Print JSON lines instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum WaCommands {
    /// Generate an Ed25519 keypair offline and print its certificate
    Keygen {
        /// Where to write the private key (refuses to overwrite)
        #[arg(long)]
        out: PathBuf,

        #[arg(long, default_value = "wise-authority")]
        name: String,

        /// ROOT, AUTHORITY or OBSERVER
        #[arg(long, default_value = "AUTHORITY")]
        role: WaRole,

        #[arg(long = "scope")]
        scopes: Vec<String>,
    },

    /// Sign a privileged command
    SignCommand {
        /// Private key written by `wa keygen`
        #[arg(long)]
        key: PathBuf,

        /// Defaults to the id derived from the key fingerprint
        #[arg(long)]
        wa_id: Option<String>,

        /// EMERGENCY_SHUTDOWN or RELOAD_CONFIG
        #[arg(long = "type")]
        command_type: CommandType,

        #[arg(long)]
        reason: String,

        /// Target agent (default: agent.agent_id from the config)
        #[arg(long)]
        target: Option<String>,

        /// Seconds until the command expires
        #[arg(long)]
        expires_in: Option<i64>,

        /// Drop the command into the agent's inbox instead of printing it
        #[arg(long)]
        deliver: bool,
    },

    /// Check a signed command against the configured allowlist
    VerifyCommand {
        /// JSON command file
        file: PathBuf,
    },

    /// Sign the SHA-256 checksum of a file
    SignManifest {
        #[arg(long)]
        key: PathBuf,

        #[arg(long)]
        wa_id: Option<String>,

        file: PathBuf,
    },

    /// Check a file against a detached manifest signature
    VerifyManifest {
        file: PathBuf,

        /// JSON signature written by `wa sign-manifest`
        #[arg(long)]
        signature: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn submit_accepts_negative_priority() {
        let cli = Cli::try_parse_from(["ciris", "submit", "check the logs", "-p", "-20"]).unwrap();
        match cli.command {
            Commands::Submit {
                description,
                priority,
                ..
            } => {
                assert_eq!(description, "check the logs");
                assert_eq!(priority, -20);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn sign_command_parses_command_type() {
        let cli = Cli::try_parse_from([
            "ciris",
            "--config",
            "/tmp/ciris.toml",
            "wa",
            "sign-command",
            "--key",
            "wa.key",
            "--type",
            "emergency_shutdown",
            "--reason",
            "drill",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/ciris.toml")));
        let Commands::Wa {
            wa_command: WaCommands::SignCommand { command_type, .. },
        } = cli.command
        else {
            panic!("expected wa sign-command");
        };
        assert_eq!(command_type, CommandType::EmergencyShutdown);
    }

    #[test]
    fn audit_query_parses_outcome() {
        let cli =
            Cli::try_parse_from(["ciris", "audit", "query", "--outcome", "error", "--limit", "5"])
                .unwrap();
        let Commands::Audit {
            audit_command: AuditCommands::Query { outcome, limit, .. },
        } = cli.command
        else {
            panic!("expected audit query");
        };
        assert_eq!(outcome, Some(AuditOutcome::Error));
        assert_eq!(limit, 5);
    }
}
