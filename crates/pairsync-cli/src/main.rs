use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;

/// pairsync: two-peer last-writer-wins replication.
///
/// Run a scripted session between two in-process peers, or decode a
/// captured envelope.
#[derive(Parser)]
#[command(name = "pairsync", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate a value between two in-process peers through an outage.
    Demo {
        /// Retry period while the peer is unreachable, in milliseconds.
        #[arg(long, default_value = "500")]
        retry_ms: u64,

        /// How long the link stays down, in milliseconds.
        #[arg(long, default_value = "1600")]
        outage_ms: u64,

        /// Wire encoding used by both peers.
        #[arg(long, value_enum, default_value_t = CodecChoice::Json)]
        codec: CodecChoice,
    },

    /// Decode a JSON envelope and print its value and timestamp.
    Decode {
        /// Envelope text, e.g. '{"value":5,"modifiedAt":1700000000000}'.
        envelope: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CodecChoice {
    Json,
    Postcard,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pairsync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = match cli.command {
        Commands::Demo {
            retry_ms,
            outage_ms,
            codec,
        } => commands::demo(retry_ms, outage_ms, codec).await,
        Commands::Decode { envelope } => commands::decode(&envelope),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
