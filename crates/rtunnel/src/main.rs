mod rtunnel;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "rtunnel",
    version,
    about = "rtunnel - expose a local service through a relay over a reverse tunnel"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses RTUNNEL_CONFIG; then auto-detects rtunnel.toml > rtunnel.yaml > rtunnel.yml from CWD; then falls back to the OS default path (Linux: /etc/rtunnel/rtunnel.toml; others: user config dir).
    #[arg(long, env = "RTUNNEL_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Establish the tunnel and serve reverse connections (default).
    Run,
    /// Generate an Ed25519 key file and print its public key.
    Keygen {
        #[arg(long)]
        out: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => rtunnel::run(cli.config).await,
        Command::Keygen { out } => rtunnel::keygen(out),
    }
}
