//! projlens CLI entry point.

use clap::Parser;
use projlens::cli::{self, Cli, Commands, EXIT_ERROR};

fn main() {
    let cli = Cli::parse();
    cli::init_logging(cli.verbose);

    let config = cli.config.as_deref();
    let result = match &cli.command {
        Commands::Analyze(args) => cli::run_analyze(config, args),
        Commands::Scan(args) => cli::run_scan(args),
        Commands::History(command) => cli::run_history(config, command),
        Commands::Config(command) => cli::run_config(config, command),
        Commands::Manual(args) => cli::run_manual(config, args),
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_ERROR
        }
    };

    std::process::exit(exit_code);
}
