use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use llmux_core::config::GatewayConfig;
use llmux_core::dispatch::Engine;
use llmux_pool::events::EventHub;
use llmux_pool::pool::PoolManager;
use llmux_pool::refresh::{RefreshEndpoints, TokenRefresher};
use llmux_pool::sweep::spawn_refresh_sweep;
use llmux_upstream::{AdapterRegistry, WreqRefreshHttp};

#[derive(Debug, Parser)]
#[command(name = "llmux", about = "Multi-provider LLM gateway")]
struct Cli {
    /// Bind host (overrides HOST).
    #[arg(long)]
    host: Option<String>,
    /// Bind port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = GatewayConfig::from_env().context("configuration")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let events = EventHub::default();
    let pool = Arc::new(
        PoolManager::load(&config.provider_pools_path, events, config.max_error_count)
            .await
            .context("provider pool")?,
    );
    let refresher = Arc::new(TokenRefresher::new(
        Arc::new(WreqRefreshHttp::new()),
        RefreshEndpoints::default(),
    ));
    let registry = Arc::new(AdapterRegistry::new(
        config.proxy_url.clone(),
        config.proxy_enabled_providers.clone(),
    ));

    let system_prompt = match &config.system_prompt_path {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("system prompt file {}", path.display()))?,
        ),
        None => None,
    };

    spawn_refresh_sweep(
        pool.clone(),
        refresher.clone(),
        config.cron_refresh_period,
        config.cron_near_window,
    );

    let bind = format!("{}:{}", config.host, config.port);
    let engine = Arc::new(Engine::new(
        config,
        pool,
        registry,
        refresher,
        system_prompt,
    ));

    // Scheduled health probes: re-check degraded records each sweep period.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config().cron_refresh_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for provider_type in engine.pool().active_types().await {
                    engine.check_health(provider_type, false).await;
                }
            }
        });
    }

    let app = llmux_router::gateway_router(engine);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(%bind, "listening");
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
