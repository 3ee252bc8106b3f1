//! Sotto Command-Line Interface
//!
//! A headless client for the sotto dictation service, enabling scriptable
//! voice-to-text workflows from the terminal.

mod client;
mod colors;
mod commands;
mod exit_codes;

use clap::{Parser, Subcommand};
use exit_codes::ExitCode;

/// Sotto - voice dictation CLI
#[derive(Parser, Debug)]
#[command(name = "sotto")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format for scripting
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start recording dictation
    Start,
    /// Stop recording and print the transcript
    Stop,
    /// Record until interrupted, then print the transcript
    Record {
        /// Auto-stop after duration (seconds)
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Show service status
    Status,
    /// Refine text through the configured language model
    Process {
        /// Text to process (reads stdin when omitted)
        text: Option<String>,
    },
    /// Pause the service
    Pause,
    /// Resume the service from pause
    Resume,
    /// Reload the service's engines
    Restart,
    /// Stop the service
    Shutdown,
    /// Check that the service is alive
    Ping,
    /// Stream state events as they happen
    Watch,
    /// Show version information
    Version,
}

fn main() {
    let cli = Cli::parse();

    // Build the async runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");

    let exit_code = runtime.block_on(run(cli));
    std::process::exit(exit_code.as_i32());
}

async fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Commands::Start => commands::start(cli.json, cli.quiet).await,
        Commands::Stop => commands::stop(cli.json, cli.quiet).await,
        Commands::Record { duration } => {
            commands::record(duration, cli.json, cli.quiet, cli.verbose).await
        }
        Commands::Status => commands::status(cli.json).await,
        Commands::Process { text } => commands::process(text, cli.json, cli.quiet).await,
        Commands::Pause => commands::pause(cli.json, cli.quiet).await,
        Commands::Resume => commands::resume(cli.json, cli.quiet).await,
        Commands::Restart => commands::restart(cli.json, cli.quiet).await,
        Commands::Shutdown => commands::shutdown(cli.json, cli.quiet).await,
        Commands::Ping => commands::ping(cli.json, cli.quiet).await,
        Commands::Watch => commands::watch(cli.json, cli.quiet).await,
        Commands::Version => {
            commands::version(cli.json);
            ExitCode::Success
        }
    }
}
