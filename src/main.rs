use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use sessiond::bootstrap::Server;
use sessiond::config::Config;
use sessiond::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "sessiond", about = "Protocol-agnostic TCP/UDP session server")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "sessiond.yaml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    if args.validate {
        println!("configuration OK: {}", args.config.display());
        return Ok(());
    }

    init_tracing(&TracingConfig {
        service_name: "sessiond".to_string(),
        log_level: config.settings.log_level.clone(),
        json_logs: config.settings.json_logs,
    })?;

    let mut server = Server::new(config);
    server.run().await
}
