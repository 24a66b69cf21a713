//! Stagecraft CLI - generate assets into sessions and assemble scenes

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{assemble, batch, dispatch, generate, session};
use stagecraft_core::StagecraftError;
use stagecraft_session::store::DEFAULT_ROOT;
use stagecraft_session::SessionArtifactStore;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stagecraft")]
#[command(about = "3D asset generation and scene assembly pipeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding session directories
    #[arg(long, global = true, default_value = DEFAULT_ROOT)]
    root: String,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the asset for a single object
    Generate(generate::GenerateArgs),

    /// Generate assets for every object in an objects file
    Batch(batch::BatchArgs),

    /// Session operations
    #[command(subcommand)]
    Session(session::SessionCommands),

    /// Build and save the assembly script for a session
    Assemble {
        /// Session ID
        #[arg(long)]
        session: String,

        /// Reset the scene before importing
        #[arg(long)]
        clear_scene: bool,
    },

    /// Build the assembly script and run it in the authoring tool
    Dispatch(dispatch::DispatchArgs),
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<serde_json::Value> {
    let store = SessionArtifactStore::new(&cli.root);
    match cli.command {
        Commands::Generate(args) => generate::run(&store, args).await,
        Commands::Batch(args) => batch::run(&store, args).await,
        Commands::Session(cmd) => session::run(&store, cmd),
        Commands::Assemble {
            session,
            clear_scene,
        } => assemble::run(&store, &session, clear_scene),
        Commands::Dispatch(args) => dispatch::run(&store, args).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match run(cli).await {
        Ok(output) => {
            println!("{}", output);
            let ok = output
                .get("success")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(true);
            if ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            let kind = e
                .downcast_ref::<StagecraftError>()
                .map(StagecraftError::kind)
                .unwrap_or("error");
            let output = serde_json::json!({
                "success": false,
                "error": format!("{:#}", e),
                "error_kind": kind,
            });
            println!("{}", output);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_defaults_to_store_root() {
        let cli = Cli::try_parse_from(["stagecraft", "session", "list"]).unwrap();
        assert_eq!(cli.root, DEFAULT_ROOT);

        let cli = Cli::try_parse_from(["stagecraft", "--root", "/tmp/s", "session", "list"]).unwrap();
        assert_eq!(cli.root, "/tmp/s");
    }
}
