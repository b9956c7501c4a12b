use anyhow::Result;
use clap::Parser;

use crud_cluster::config::SupervisorConfig;
use crud_cluster::supervisor;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = SupervisorConfig::parse();
    supervisor::run(config).await
}
