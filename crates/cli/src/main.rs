//! Colloquy CLI
//!
//! Runs feature tool invocations and multi-character sessions against a
//! Colloquy server, streaming results to the terminal.

mod cmd_invoke;
mod cmd_multi;
mod logging;
mod render;
mod session;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use crate::cmd_invoke::InvokeArgs;
use crate::cmd_multi::MultiArgs;
use crate::session::Overrides;

#[derive(Parser)]
#[command(name = "colloquy", version)]
#[command(about = "Stream AI tool invocations and multi-character sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to <config_dir>/colloquy/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server WebSocket URL, overrides config file and environment
    #[arg(long, global = true)]
    server_url: Option<String>,

    /// Character id to act as
    #[arg(long, global = true)]
    character: Option<String>,

    /// Data directory for logs (defaults to <data_dir>/colloquy)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a feature tool and stream the result
    Invoke(InvokeArgs),

    /// Invoke a tool, then keep the conversation open for follow-ups
    Chat(InvokeArgs),

    /// Run several characters over one prompt
    Multi(MultiArgs),

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "colloquy", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = logging::data_dir(cli.data_dir.as_deref());
    let log_handle = logging::init_logging(&data_dir)?;

    let overrides = Overrides {
        config: cli.config,
        server_url: cli.server_url,
        character: cli.character,
    };
    let session = session::connect(&overrides).await?;

    let result = match cli.command {
        Commands::Invoke(args) => cmd_invoke::run(&session, args, false).await,
        Commands::Chat(args) => cmd_invoke::run(&session, args, true).await,
        Commands::Multi(args) => cmd_multi::run(&session, args).await,
        Commands::Completions { .. } => Ok(()),
    };

    if let Err(e) = &result {
        tracing::error!(
            component = "cli",
            event = "cli.command.failed",
            error = %e,
            log_path = %log_handle.log_path.display(),
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_multi_invocation() {
        let cli = Cli::try_parse_from([
            "colloquy",
            "--server-url",
            "ws://localhost:4000/ws",
            "multi",
            "--characters",
            "analyst,writer",
            "--mode",
            "discussion",
            "Remote or office?",
        ])
        .unwrap();

        assert_eq!(cli.server_url.as_deref(), Some("ws://localhost:4000/ws"));
        match cli.command {
            Commands::Multi(args) => {
                assert_eq!(args.characters, vec!["analyst", "writer"]);
                assert_eq!(args.mode, colloquy_protocol::MultiCharacterMode::Discussion);
                assert_eq!(args.message, "Remote or office?");
            }
            _ => panic!("expected multi"),
        }
    }
}
