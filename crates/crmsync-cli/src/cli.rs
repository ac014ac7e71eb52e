use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use crmsync_core::operator::Resolution;
use crmsync_core::{RecordKind, SyncState};

#[derive(Parser)]
#[command(name = "crmsync")]
#[command(about = "Run and inspect the CRM cache and sync layer")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sync workers and reconcilers until interrupted
    Run {
        /// Reconcile these owners once and exit instead of running
        #[arg(long)]
        once: bool,
        /// Owner partitions to register (repeatable)
        #[arg(long = "owner", value_name = "OWNER")]
        owners: Vec<String>,
    },
    /// Show queue depth, record states and reconciler positions
    Status {
        /// Restrict to one owner
        #[arg(long, value_name = "OWNER")]
        owner: Option<String>,
    },
    /// List cached records of an owner
    List {
        #[arg(long, value_name = "OWNER")]
        owner: String,
        #[arg(long, value_enum, default_value_t = KindArg::Case)]
        kind: KindArg,
        /// Only records in this state
        #[arg(long, value_enum)]
        state: Option<StateArg>,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// List writes the CRM rejected or that ran out of retries
    DeadLetters {
        #[arg(long, value_name = "OWNER")]
        owner: String,
    },
    /// Send a failed record's writes again
    Retry {
        #[arg(long, value_name = "OWNER")]
        owner: String,
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Local or CRM id of the record
        id: String,
    },
    /// Settle a record in conflict
    Resolve {
        #[arg(long, value_name = "OWNER")]
        owner: String,
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Local or CRM id of the record
        id: String,
        /// Which side wins
        #[arg(long, value_enum)]
        keep: KeepArg,
    },
    /// List records waiting for conflict resolution
    Conflicts {
        #[arg(long, value_name = "OWNER")]
        owner: String,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Output file, or a directory to receive the shell's conventional
        /// file name (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    Document,
    Case,
}

impl From<KindArg> for RecordKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Document => Self::Document,
            KindArg::Case => Self::Case,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StateArg {
    Local,
    Pending,
    Synced,
    Conflict,
    Failed,
}

impl From<StateArg> for SyncState {
    fn from(state: StateArg) -> Self {
        match state {
            StateArg::Local => Self::Local,
            StateArg::Pending => Self::Pending,
            StateArg::Synced => Self::Synced,
            StateArg::Conflict => Self::Conflict,
            StateArg::Failed => Self::Failed,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepArg {
    /// Push the portal's version to the CRM
    Local,
    /// Adopt the CRM's version
    Remote,
}

impl From<KeepArg> for Resolution {
    fn from(keep: KeepArg) -> Self {
        match keep {
            KeepArg::Local => Self::KeepLocal,
            KeepArg::Remote => Self::AcceptRemote,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    #[value(name = "powershell")]
    PowerShell,
}
