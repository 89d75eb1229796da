use anyhow::Result;
use clap::Parser;
use factorio_replay::cli::{self, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    // Engine output is echoed on stdout; our own diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    cli::run(args).await?;
    Ok(())
}
