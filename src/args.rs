use std::num::{NonZeroU64, NonZeroUsize};

use clap::{Parser, Subcommand};
use url::Url;

#[derive(Parser, Debug, Clone)]
#[command(about = "Cross-check eth_getLogs counts between a reference and a candidate provider")]
pub struct Args {
    #[clap(long, default_value_t = default_config_path())]
    pub config_path: String,
    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Store reference counts for every range of the span
    Populate(PopulateArgs),
    /// Compare a candidate's counts against the stored reference counts
    Verify(VerifyArgs),
    /// Bisect stored discrepancies down to the blocks that cause them
    Narrow(NarrowArgs),
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct SpanArgs {
    #[clap(long)]
    pub start: Option<u64>,
    #[clap(long)]
    pub end: Option<u64>,
    /// Blocks per stored range
    #[clap(long = "range")]
    pub range_size: Option<NonZeroU64>,
    /// Blocks per step chunk
    #[clap(long = "step")]
    pub step_size: Option<NonZeroU64>,
    #[clap(long)]
    pub concurrency: Option<NonZeroUsize>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct PopulateArgs {
    /// Reference provider, overrides the `[reference]` url
    #[clap(long, env = "REF_PROVIDER")]
    pub provider: Option<Url>,
    #[command(flatten)]
    pub span: SpanArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Candidate provider, overrides the `[candidate]` url
    #[clap(long, env = "TEST_PROVIDER")]
    pub test_provider: Option<Url>,
    #[command(flatten)]
    pub span: SpanArgs,
    /// Move the span onto the closest stored range boundaries
    #[clap(long)]
    pub snap: bool,
    /// Delete the provider's stored discrepancies before verifying
    #[clap(long)]
    pub clear: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct NarrowArgs {
    #[clap(long, env = "REF_PROVIDER")]
    pub provider: Option<Url>,
    #[clap(long, env = "TEST_PROVIDER")]
    pub test_provider: Option<Url>,
    /// Narrow only this range instead of the stored discrepancies
    #[clap(long, requires = "to")]
    pub from: Option<u64>,
    #[clap(long, requires = "from")]
    pub to: Option<u64>,
    #[clap(long)]
    pub min_width: Option<NonZeroU64>,
}

fn default_config_path() -> String {
    "logcount.toml".to_owned()
}
