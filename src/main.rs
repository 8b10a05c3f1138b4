use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod aggregator;
mod app;
mod commands;
mod config;
mod db;
mod error;
mod feed;
mod models;
mod router;

use app::AppState;
use config::Config;
use error::Result;
use router::Command;

/// A multi-user RSS aggregator for the terminal.
#[derive(Parser, Debug)]
#[command(name = "gator", version, about)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, env = "GATOR_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    /// login, register, reset, users, agg, addfeed, feeds, follow, following, unfollow or browse
    command: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let level = if cli.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();
    tracing::debug!("Using config {}", config.path().display());

    let mut state = AppState::new(config).await?;
    let command = Command::new(cli.command, cli.args);

    commands::router().run(&mut state, &command).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_collects_command_and_arguments() {
        let cli = Cli::try_parse_from(["gator", "-v", "addfeed", "blog", "http://x/feed.xml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.command, "addfeed");
        assert_eq!(cli.args, vec!["blog", "http://x/feed.xml"]);
    }

    #[test]
    fn cli_passes_hyphenated_arguments_through() {
        let cli = Cli::try_parse_from(["gator", "register", "-bob"]).unwrap();
        assert_eq!(cli.args, vec!["-bob"]);
        assert!(cli.config.is_none() || std::env::var_os("GATOR_CONFIG").is_some());
    }

    #[test]
    fn cli_requires_a_command() {
        assert!(Cli::try_parse_from(["gator"]).is_err());
    }
}
