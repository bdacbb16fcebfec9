//! `side` — the Sidekick CLI

mod init;
mod start;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const HELP_TEMPLATE: &str = "\
{about}

Usage: {usage}

Available Commands:
{subcommands}

Options:
{options}";

#[derive(Parser)]
#[command(
    name = "side",
    about = "Sidekick — an AI coding assistant for your local repository",
    help_template = HELP_TEMPLATE
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize Sidekick in the current repository
    Init,
    /// Start the Sidekick agent runtime for this repository
    Start,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        None => {
            println!("Usage: side init | side start");
            println!("Run 'side --help' for details.");
            std::process::exit(1);
        }
        Some(Command::Init) => init::run().await,
        Some(Command::Start) => start::run().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_help_lists_commands() {
        let help = Cli::command().render_help().to_string();
        assert!(help.contains("Sidekick"));
        assert!(help.contains("Available Commands:"));
        assert!(help.contains("init"));
        assert!(help.contains("start"));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        assert!(matches!(
            Cli::try_parse_from(["side", "init"]).unwrap().command,
            Some(Command::Init)
        ));
        assert!(matches!(
            Cli::try_parse_from(["side", "start"]).unwrap().command,
            Some(Command::Start)
        ));
        assert!(Cli::try_parse_from(["side"]).unwrap().command.is_none());
    }
}
