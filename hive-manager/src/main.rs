//! Manager binary: membership registry, fan-out, and board endpoint.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hive_common::config::ManagerConfig;
use hive_manager::service::ManagerService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = parse_args().context("parsing arguments")?;
    let service = ManagerService::start(config).await?;

    tokio::select! {
        result = service.serve() => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

fn parse_args() -> anyhow::Result<ManagerConfig> {
    let mut config = ManagerConfig::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--address" => config.address = required(&mut args, "--address")?,
            "--port" => config.port = required(&mut args, "--port")?.parse()?,
            "--board-port" => config.board_port = required(&mut args, "--board-port")?.parse()?,
            "--poll-interval-ms" => {
                config.host_polling_interval_ms = required(&mut args, "--poll-interval-ms")?.parse()?
            }
            "--dereg-interval-ms" => {
                config.deregistration_interval_ms = required(&mut args, "--dereg-interval-ms")?.parse()?
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(config)
}

fn required(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    args.next().ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
}
