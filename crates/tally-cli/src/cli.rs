use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tally_core::{ConflictPolicy, SyncStrategy};

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Sync Tally's local records and documents with the cloud")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Vault passphrase for an encrypted sync key (or TALLY_VAULT_PASSPHRASE)
    #[arg(long, global = true, value_name = "PASSPHRASE")]
    pub passphrase: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run and inspect cloud sync
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Configure the sync endpoint
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Show endpoint, policy and last sync time
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one sync
    Run {
        /// How to reconcile the two sides
        #[arg(long, value_enum, default_value_t = StrategyArg::Full)]
        strategy: StrategyArg,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set which side wins conflicting records in a full sync
    Policy {
        #[arg(value_enum)]
        policy: PolicyArg,
    },
    /// Apply remote changes as they happen until Ctrl-C
    Watch,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Save the remote URL and key
    Endpoint {
        /// Project URL, e.g. https://<project>.supabase.co
        #[arg(long, value_name = "URL")]
        url: String,
        /// API key (sealed when the vault is unlocked)
        #[arg(long, value_name = "KEY")]
        key: String,
        /// Save without enabling sync
        #[arg(long)]
        disabled: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StrategyArg {
    Full,
    MergePull,
    MergePush,
    ForcePull,
    ForcePush,
}

impl From<StrategyArg> for SyncStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Full => Self::Full,
            StrategyArg::MergePull => Self::MergePull,
            StrategyArg::MergePush => Self::MergePush,
            StrategyArg::ForcePull => Self::ForcePull,
            StrategyArg::ForcePush => Self::ForcePush,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PolicyArg {
    CloudWins,
    LocalWins,
}

impl From<PolicyArg> for ConflictPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::CloudWins => Self::CloudWins,
            PolicyArg::LocalWins => Self::LocalWins,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
