//! Cache host binary: storage engine + wire service + manager link.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hive_common::config::HostConfig;
use hive_common::config::StorageProvider;
use hive_engine::{MemCache, MemCacheConfig};
use hive_host::manager_link::ManagerLink;
use hive_host::perf::spawn_sampler;
use hive_host::service::{HostContext, HostService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = parse_args().context("parsing arguments")?;
    config.validate().context("validating configuration")?;

    let cache = Arc::new(MemCache::new(MemCacheConfig {
        memory_ceiling_bytes: config.memory_ceiling_bytes,
        memory_limit_percent: config.cache_memory_limit_percentage,
        sweep_interval: config.sweep_interval(),
        storage_provider: config.storage_provider,
        ..MemCacheConfig::default()
    }));
    let sweeper = cache.start_sweeper();

    let ctx = HostContext::new(config, Arc::clone(&cache))?;
    ctx.routing.set_rebalance_hook(|| {
        info!("membership changed; key ranges rebalanced");
    });
    let sampler = spawn_sampler(Arc::clone(&ctx.perf), Arc::clone(&cache));
    let link = ManagerLink::start(Arc::clone(&ctx), |event| {
        info!(?event, "manager link transition");
    });

    let service = HostService::bind(Arc::clone(&ctx)).await?;
    tokio::select! {
        result = service.serve() => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    link.stop();
    sampler.abort();
    sweeper.stop();
    Ok(())
}

fn parse_args() -> anyhow::Result<HostConfig> {
    let mut config = HostConfig::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--address" => config.address = required(&mut args, "--address")?,
            "--port" => config.port = required(&mut args, "--port")?.parse()?,
            "--manager-address" => config.manager_address = required(&mut args, "--manager-address")?,
            "--manager-port" => config.manager_port = required(&mut args, "--manager-port")?.parse()?,
            "--memory-limit-percent" => {
                config.cache_memory_limit_percentage = required(&mut args, "--memory-limit-percent")?.parse()?
            }
            "--gzip" => config.storage_provider = StorageProvider::Gzip,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(config)
}

fn required(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    args.next().ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
}
