use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = eventsink_cli::Cli::parse();
    eventsink_cli::run_cli(cli)
}
