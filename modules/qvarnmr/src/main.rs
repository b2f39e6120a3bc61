//! `qvarnmr-worker` entry point.
//!
//! Handler topologies are plain Rust values, so a deployment registers its
//! own in a `TopologyRegistry` and wraps `worker::cli_main` in a binary
//! just like this one. The stock binary ships with an empty registry and
//! exists mainly as the template for that wrapper.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use qvarnmr::topology::TopologyRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qvarnmr=info")),
        )
        .init();

    let registry = TopologyRegistry::new();
    let code = qvarnmr::worker::cli_main(&registry).await?;
    std::process::exit(code);
}
