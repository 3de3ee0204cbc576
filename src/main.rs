use clap::Parser;
use std::process::ExitCode;
use tidytree::cli::{Cli, run_cli};
use tidytree::logging::init_logging;
use tidytree::output::OutputFormatter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run_cli(cli) {
        OutputFormatter::error(&e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
