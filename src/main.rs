use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use renderforge::config::Settings;

mod cmd;

#[derive(Parser)]
#[command(name = "renderforge")]
#[command(version, about = "Validate, render and repair generated Manim scenes")]
pub struct Cli {
    /// Path to a TOML config file. Defaults to .renderforge/renderforge.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API and render workers
    Serve,
    /// Check a scene file against the safety and structure rules
    Validate {
        file: PathBuf,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Render a scene file through the full pipeline and print the final job
    Render {
        file: PathBuf,
        /// Quality profile (1080p30, 720p30, 480p15). Defaults to render.default_quality.
        #[arg(short, long)]
        quality: Option<String>,
        /// Fail on the first validation or render error instead of repairing
        #[arg(long)]
        no_retry: bool,
    },
    /// Show the effective configuration (secrets redacted)
    Config,
}

fn exit_status(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    let _log_guard = renderforge::logging::init(&settings.logging)?;

    let code = match &cli.command {
        Commands::Serve => {
            cmd::cmd_serve(settings).await?;
            ExitCode::SUCCESS
        }
        Commands::Validate { file, json } => exit_status(cmd::cmd_validate(file, *json)?),
        Commands::Render {
            file,
            quality,
            no_retry,
        } => exit_status(cmd::cmd_render(&settings, file, quality.as_deref(), *no_retry).await?),
        Commands::Config => {
            cmd::cmd_config(&settings, cli.config.as_deref())?;
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}
