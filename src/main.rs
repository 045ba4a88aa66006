//! Stackhand CLI: Terraform/AWS stack orchestration.

use clap::Parser;
use stackhand::cli::Cli;

fn main() {
    let cli = Cli::parse();
    if let Err(e) = stackhand::cli::run(cli) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
