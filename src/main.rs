use aircompressor_tools::commands;
use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_FILTER_VAR: &str = "AIRCOMPRESSOR_TOOLS_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers::Args),
    Read(commands::read::Args),
    Monitor(commands::monitor::Args),
    Control(commands::control::Args),
}

#[derive(thiserror::Error, Debug)]
#[error("could not parse the `AIRCOMPRESSOR_TOOLS_LOG` log filter")]
struct FilterError(#[source] tracing_subscriber::filter::ParseError);

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description = std::env::var(LOG_FILTER_VAR).unwrap_or_else(|_| "info".into());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => return end(Err(FilterError(e))),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Monitor(args) => end(commands::monitor::run(args)),
        Commands::Control(args) => end(commands::control::run(args)),
    }
}
