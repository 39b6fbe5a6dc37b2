use clap::{Parser, Subcommand};

/// Incant - Fingerprint-addressed cache for generated scripts
///
/// Incant resolves natural-language tasks to cached, sandboxed scripts:
/// identical requests reuse the stored artifact instead of regenerating it.
#[derive(Parser, Debug)]
#[command(name = "incant")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Fingerprint-addressed cache for generated scripts", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Common configuration arguments shared across commands
#[derive(Parser, Debug, Clone)]
pub struct CommonConfigArgs {
    /// Config file path
    #[arg(short = 'c', long, env = "INCANT_CONFIG")]
    pub config: Option<String>,

    /// Artifact store directory
    #[arg(long, env = "INCANT_CONFIG_STORE_DIR")]
    pub config_store_dir: Option<String>,

    /// Generation backend URL (omit for the built-in template generator)
    #[arg(long, env = "INCANT_CONFIG_GENERATOR_URL")]
    pub config_generator_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve a prompt to a cached script and execute it
    Run(RunArgs),

    /// List all cached entries
    List(ListArgs),

    /// Show a cached entry by fingerprint
    Show(ShowArgs),

    /// Apply an invalidation signal to a cached entry
    Invalidate(InvalidateArgs),

    /// Remove all cached entries
    Clear(ClearArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Natural-language task prompt
    pub prompt: String,

    /// Context as inline JSON, or @path to read from a file
    #[arg(long, default_value = "{}")]
    pub context: String,

    /// Target language (python, bash)
    #[arg(long, default_value = "python")]
    pub language: String,

    /// Archive any cached entry first and regenerate
    #[arg(long)]
    pub refresh: bool,

    /// Restrict the result output to these fields, comma-separated
    #[arg(long, value_delimiter = ',')]
    pub select: Vec<String>,

    /// Validate the script without executing it
    #[arg(long)]
    pub check: bool,

    /// Execution timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    #[command(flatten)]
    pub common: CommonConfigArgs,
}

#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Show detailed information
    #[arg(short, long)]
    pub verbose: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub common: CommonConfigArgs,
}

#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Fingerprint of the cached entry
    pub fingerprint: String,

    /// Print the script source instead of the manifest
    #[arg(long)]
    pub script: bool,

    #[command(flatten)]
    pub common: CommonConfigArgs,
}

#[derive(Parser, Debug)]
pub struct InvalidateArgs {
    /// Fingerprint of the cached entry
    pub fingerprint: String,

    #[command(subcommand)]
    pub signal: SignalCommand,
}

#[derive(Subcommand, Debug)]
pub enum SignalCommand {
    /// A pinned dependency resolved to a different version
    DependencyDrift {
        /// Dependency name
        #[arg(long)]
        dependency: String,

        /// Version the dependency now resolves to
        #[arg(long)]
        resolved: String,

        /// The resolved version is known vulnerable
        #[arg(long)]
        vulnerable: bool,

        #[command(flatten)]
        common: CommonConfigArgs,
    },

    /// A security advisory against a dependency
    Advisory {
        /// Subject of the advisory (dependency name)
        #[arg(long)]
        subject: String,

        #[command(flatten)]
        common: CommonConfigArgs,
    },

    /// The entry failed at execution time
    ExecutionFailure {
        /// Regeneration could plausibly fix the failure
        #[arg(long)]
        fixable: bool,

        #[command(flatten)]
        common: CommonConfigArgs,
    },
}

#[derive(Parser, Debug)]
pub struct ClearArgs {
    /// Skip confirmation
    #[arg(short, long)]
    pub force: bool,

    #[command(flatten)]
    pub common: CommonConfigArgs,
}
