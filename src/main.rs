use aiui::cli::{self, Args, Commands};
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over the configured level. Logs go to stderr so streamed
/// output on stdout stays clean.
fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Commands::InitConfig { force } = args.command {
        return cli::init_config(args.config.as_deref(), force);
    }

    let config = cli::load_config(args.config.as_deref())?;
    init_tracing(&config.logging.level);

    cli::run(args.command, config).await
}
