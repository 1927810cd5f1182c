//! The main entrypoint for osprov, which is the CLI.

use std::io::Write as _;

use anyhow::Result;
use owo_colors::OwoColorize;

use osprov_lib::cli::Exit;

fn run() -> Result<Exit> {
    osprov_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(osprov_lib::cli::run_from_iter(std::env::args()))
}

fn main() {
    // In order to print the error in a custom format (with :#) our
    // main simply invokes a run() where all the work is done.
    // This code just captures any errors.
    match run() {
        Ok(exit) => std::process::exit(exit.code()),
        Err(e) => {
            let mut stderr = anstream::stderr();
            // Don't panic if writing fails
            let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
            std::process::exit(1);
        }
    }
}
