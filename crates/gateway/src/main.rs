//! HomeBase gateway binary.

mod api;
mod bootstrap;
mod devices;
mod prompts;
mod runtime;
mod sched;
mod state;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use hb_domain::config::Config;

#[derive(Parser)]
#[command(name = "homebase", version, about = "HomeBase personal-assistant gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server.
    Run {
        /// Path to the TOML config file.
        #[arg(long, default_value = "homebase.toml")]
        config: PathBuf,
    },
    /// Print the effective configuration and exit.
    Config {
        #[arg(long, default_value = "homebase.toml")]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hb_gateway=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run {
        config: PathBuf::from("homebase.toml"),
    }) {
        Command::Run { config } => {
            let config = Config::load(&config)?;
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(bootstrap::run(config))
        }
        Command::Config { config } => {
            let config = Config::load(&config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
