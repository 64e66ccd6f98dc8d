use std::process::ExitCode;

use clap::Parser;
use slex::cli::Cli;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Any host failed
const EXIT_HOST_FAILED: u8 = 1;
/// Setup error, no host contacted
const EXIT_SETUP: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();
    slex::init_logging(cli.debug);

    let command = match cli.read_command(std::io::stdin()) {
        Ok(command) => command,
        Err(e) => return fail(e),
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return fail(e),
    };

    match runtime.block_on(slex::run(cli, command)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_HOST_FAILED),
        Err(e) => fail(e),
    }
}

fn fail(e: impl std::fmt::Display) -> ExitCode {
    eprintln!("slex: {}", e);
    ExitCode::from(EXIT_SETUP)
}
