use clap::Parser;
use ethscription_withdrawer::cli::Cli;
use ethscription_withdrawer::tracing::init_logging;

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(cli.run())
}
