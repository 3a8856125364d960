//! Droplet lifecycle engine binary entry point.
use clap::Parser;
use droplet_cli::{cli, commands, logging};

fn main() {
    let args = cli::Cli::parse();
    let command_name = match &args.command {
        cli::Command::Stage(_) => "stage",
        cli::Command::Run(_) => "run",
        cli::Command::Version => "version",
    };
    // The DEBUG environment variable raises the run entry point to debug
    // level, matching the container contract.
    let debug = args.debug
        || (matches!(args.command, cli::Command::Run(_))
            && std::env::var("DEBUG").is_ok_and(|v| !v.is_empty()));
    logging::init_subscriber(debug, command_name);
    let log = std::sync::Arc::new(logging::Logger::new(command_name, debug));

    let result = match args.command {
        cli::Command::Stage(opts) => commands::stage::run(&opts, &log).map(|()| 0),
        cli::Command::Run(opts) => commands::run::run(&opts, &log),
        cli::Command::Version => {
            let version = option_env!("DROPLET_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
            println!("droplet {version}");
            return;
        }
    };

    match result {
        Ok(rc) => std::process::exit(rc),
        Err(e) => {
            eprintln!("\x1b[31mERROR: {e:#}\x1b[0m");
            std::process::exit(1);
        }
    }
}
