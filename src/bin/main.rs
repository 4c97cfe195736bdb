/// Strand CLI
///
/// Administrative commands for running compiled executables and inspecting
/// persisted sessions.
use tracing_subscriber::EnvFilter;

use strand_core::cli;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
