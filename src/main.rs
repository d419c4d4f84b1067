//! devloop - watch, restart, reflect
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Development-mode process orchestrator for server-side JS/TS apps
#[derive(Parser, Debug)]
#[command(name = "devloop")]
#[command(about = "Watch, restart and reflect a dev server", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the project (defaults to the current directory)
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,

    /// Skip type generation after restarts
    #[arg(long)]
    no_typegen: bool,

    /// Log debug output to stderr
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default .devloop/config.toml
    Init {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },
}

fn project_path(path: Option<PathBuf>) -> PathBuf {
    path.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    devloop_core::logging::init(args.verbose)?;

    match args.command {
        Some(Command::Init { path }) => {
            let config = devloop::init_project(&project_path(path))?;
            eprintln!("Wrote {}", config.display());
        }
        None => {
            let options = devloop::RunOptions {
                no_typegen: args.no_typegen,
            };
            devloop::run_with_project(&project_path(args.path), options).await?;
        }
    }

    Ok(())
}
