//! The main entrypoint for bootplace, which just performs global initialization, and then
//! calls out into the library.

use anyhow::Result;
use owo_colors::OwoColorize;

fn run() -> Result<()> {
    bootplace_utils::initialize_tracing();
    tracing::trace!("starting");
    bootplace_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    // In order to print the error in a custom format (with :#) our
    // main simply invokes a run() where all the work is done.
    // This code just captures any errors.
    if let Err(e) = run() {
        anstream::eprintln!("{}{:#}", "error: ".red(), e);
        std::process::exit(1);
    }
}
