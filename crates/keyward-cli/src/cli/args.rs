use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "keyward",
    version,
    about = "Scoped session keys for smart accounts, driven by natural-language intent"
)]
pub struct Cli {
    /// YAML config file (default: KEYWARD_* environment variables)
    #[arg(long, global = true, env = "KEYWARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Translate a prompt and apply the resulting payloads
    Prompt(PromptArgs),
    /// Apply a payload array from a JSON file ("-" for stdin)
    Apply(ApplyArgs),
    /// Show the currently enabled session per kind
    Allowances(AllowancesArgs),
    Version,
}

#[derive(Parser, Debug)]
pub struct PromptArgs {
    /// Natural-language instruction, e.g. "let the agent spend 1000 USDC today"
    pub text: String,

    /// Print the translated payloads without enabling or submitting anything
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser, Debug)]
pub struct ApplyArgs {
    pub file: PathBuf,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser, Debug)]
pub struct AllowancesArgs {
    /// Override the allowance store location
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone, Copy)]
pub struct OutputArgs {
    /// Print the per-entry report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}
