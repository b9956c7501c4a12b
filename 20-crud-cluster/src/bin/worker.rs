use anyhow::Result;
use clap::Parser;

use crud_cluster::config::WorkerConfig;
use crud_cluster::worker;

// stdout belongs to the replication link, so logs go to stderr.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let config = WorkerConfig::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(worker::run(config));
    // A pending stdin read holds a blocking thread until EOF; don't wait on it.
    runtime.shutdown_background();
    result
}
