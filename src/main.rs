use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ilc_revision=info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = ilc_revision::api::Cli::parse();
    let code = ilc_revision::api::run(cli).await;
    if code != 0 {
        std::process::exit(code);
    }
}
