//! idbscope CLI
//!
//! An interactive shell over an in-memory, browser-style key-value engine.
//! Every callback the engine fires is printed as it is recorded.
//!
//! # Commands
//!
//! - `shell` - Read session commands from standard input or a script
//! - `version` - Show version information

mod commands;
mod error;

use clap::{Parser, Subcommand};
use commands::render::OutputFormat;
use commands::shell::{SessionArgs, Shell, ShellOptions};
use std::io::{BufRead, BufReader, IsTerminal};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Exercise a browser-style key-value store interactively.
#[derive(Parser)]
#[command(name = "idbscope")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run session commands interactively or from a script
    Shell {
        #[command(flatten)]
        session: SessionArgs,

        /// Read commands from this file instead of standard input
        #[arg(short, long)]
        script: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Keep going after a failed command in a script
        #[arg(long)]
        keep_going: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so shell output stays parseable
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Shell {
            session,
            script,
            format,
            keep_going,
        } => {
            let (input, options): (Box<dyn BufRead>, ShellOptions) = match &script {
                Some(path) => {
                    info!(path = %path.display(), "running script");
                    let file = std::fs::File::open(path)
                        .map_err(|e| format!("cannot open script {}: {e}", path.display()))?;
                    let options = ShellOptions {
                        format,
                        prompt: false,
                        echo: true,
                        fail_fast: !keep_going,
                    };
                    (Box::new(BufReader::new(file)), options)
                }
                None => {
                    let stdin = std::io::stdin();
                    let options = ShellOptions {
                        format,
                        prompt: stdin.is_terminal(),
                        echo: false,
                        fail_fast: false,
                    };
                    (Box::new(stdin.lock()), options)
                }
            };

            let stdout = std::io::stdout();
            let mut shell = Shell::new(session.config(), stdout.lock(), options);
            let summary = shell.run(input)?;
            info!(
                state = %shell.session().state(),
                commands = summary.commands,
                errors = summary.errors,
                "session ended"
            );
        }
        Commands::Version => {
            println!("idbscope CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("idbscope Core v{}", idbscope_core::VERSION);
        }
    }

    Ok(())
}
