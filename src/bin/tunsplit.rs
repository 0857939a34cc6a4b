use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunsplit::dns::ipset::LogOnlySet;
use tunsplit::{AccessList, AccessListConfig, Config, DnsForwarder, DnsSettings, Mode, Proxy};

/// Interval for dropping expired DNS cache entries.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Split-tunneling proxy.
///
/// Carries access-listed destinations through an obfuscated tunnel and
/// answers their DNS through a separate upstream; everything else goes
/// out directly.
#[derive(Parser, Debug)]
#[command(name = "tunsplit")]
#[command(version, about)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short = 'c', long, default_value = "/etc/tunsplit/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {:?}", args.config))?;

    let access_config = AccessListConfig::load(&config.access_list)
        .with_context(|| format!("failed to load access list from {:?}", config.access_list))?;
    let access_list = Arc::new(AccessList::new(&access_config)?);
    info!(
        "access list loaded: {} domains, {} subnets",
        access_config.domains.len(),
        access_config.subnets.len()
    );

    if let Err(e) = tunsplit::reload::watch_access_list(config.access_list.clone(), access_list.clone())
    {
        // Reload is best effort; the startup snapshot still works.
        error!("access list watcher unavailable: {}", e);
    }

    let dns = if config.dns.enabled && config.mode == Mode::Transparent {
        let settings = DnsSettings {
            listen: config.dns.listen,
            default_upstream: config.dns.default_server,
            specified_upstream: config.dns.specified_server,
            public_service: config.dns.public_service,
            sentinel: config.dns.sentinel,
        };
        let forwarder = Arc::new(
            DnsForwarder::bind(settings, access_list.clone(), Arc::new(LogOnlySet))
                .await
                .context("failed to start DNS forwarder")?,
        );

        let runner = forwarder.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                error!("DNS forwarder failed: {}", e);
            }
        });
        let purger = forwarder.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                interval.tick().await;
                purger.purge();
            }
        });
        Some(forwarder)
    } else {
        None
    };

    let proxy = Arc::new(
        Proxy::bind(&config, access_list, dns)
            .await
            .context("failed to start proxy")?,
    );

    tokio::select! {
        result = proxy.run() => {
            result.context("proxy terminated")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}
