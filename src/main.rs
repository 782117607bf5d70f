use anyhow::Context;
use rpc_logcount::{Args, Runner};

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    Runner::run(args).await.context("run log count checker")
}
