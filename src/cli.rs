use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use policyseek::settings::EmbedderKind;

#[derive(Debug, Parser)]
#[command(
    name = "policyseek",
    about = "Semantic search over a travel policy document"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the ColBERT model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Embedding backend: colbert or hash
    #[arg(long, global = true)]
    pub embedder: Option<EmbedderKind>,

    /// Do not read or write the persistent embedding cache
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Find the policy passages most relevant to a query
    Search(SearchArgs),
    /// Show how the policy document is split into chunks
    Chunks(ChunksArgs),
    /// Show resolved settings and document state
    Status(StatusArgs),
    /// Start MCP server exposing the search_policies tool
    Mcp(McpArgs),
    /// Manage the ColBERT model configuration
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Manage stored settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect or empty the persistent embedding cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Model --

#[derive(Debug, Subcommand)]
pub enum ModelAction {
    /// Show the currently resolved model
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a default model ID or local path in config.redb
    Set {
        /// Model ID (HuggingFace) or local path
        model: String,
    },
    /// Clear the stored model setting (revert to default)
    Clear,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// List stored settings
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Store a setting
    Set {
        /// One of: model_name, policy_path, chunk_size, chunk_overlap,
        /// top_k, metric, embedder
        key: String,
        value: String,
    },
    /// Remove a stored setting
    Unset { key: String },
}

// -- Cache --

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show how many embeddings and documents are cached
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete every cached embedding
    Clear,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of passages to return
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Policy document to search
    #[arg(short = 'd', long)]
    pub document: Option<PathBuf>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Chunks --

#[derive(Debug, Parser)]
pub struct ChunksArgs {
    /// Policy document to chunk
    #[arg(short = 'd', long)]
    pub document: Option<PathBuf>,

    /// Output chunks as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- MCP --

#[derive(Debug, Parser)]
pub struct McpArgs {
    /// Policy document to serve
    #[arg(short = 'd', long)]
    pub document: Option<PathBuf>,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "policyseek",
            &mut std::io::stdout(),
        );
    }
}
