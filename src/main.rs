use std::process::ExitCode;

use clap::Parser;
use layercraft::{cli, logger};

fn main() -> ExitCode {
    let args = cli::CliArgs::parse();

    // Initialize session log (overwrites previous session log)
    logger::init(args.verbose);
    log::info!("LayerCraft {} starting", env!("CARGO_PKG_VERSION"));

    cli::run(args)
}
