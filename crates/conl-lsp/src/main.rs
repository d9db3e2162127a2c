use clap::Parser;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conl-lsp", version, about = "Language server for CONL configuration files")]
struct Cli {
    /// Communicate over stdin/stdout (the default and only transport).
    #[arg(long)]
    stdio: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _cli = Cli::parse();

    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "conl-lsp starting");
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    conl_lsp::serve(stdin, stdout, conl_lsp::http_fetcher()).await
}
