use anyhow::Result;
use std::process::ExitCode;

fn main() -> Result<ExitCode> {
    snakebox::cli::run()
}
