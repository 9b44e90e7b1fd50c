//! Service entrypoint: wire the bus, the orchestrator actor, and the HTTP
//! surface; publish SERVICE_STARTED; shut down cleanly on ctrl-c.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trade_orchestrator::bus::{channels, MemoryBus, MessageBus, WsBus};
use trade_orchestrator::config::{BusMode, Settings};
use trade_orchestrator::events::InboundEvent;
use trade_orchestrator::{http, orchestrator};

fn init_tracing(settings: &Settings) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &settings.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let settings = Settings::from_env();
    let _log_guard = init_tracing(&settings);

    info!("═══════════════════════════════════════════════════");
    info!("  Trade Orchestrator");
    info!("═══════════════════════════════════════════════════");
    info!(
        "📊 bus={} http={} trading_enabled={}",
        settings.bus_url, settings.http_addr, settings.orchestrator.trading_enabled
    );

    let bus: Arc<dyn MessageBus> = match settings.bus_mode {
        BusMode::Ws => {
            let bus_url = url::Url::parse(&settings.bus_url)
                .with_context(|| format!("bad ORCH_BUS_URL '{}'", settings.bus_url))?;
            Arc::new(WsBus::connect(bus_url.to_string()))
        }
        BusMode::Memory => {
            warn!("🚌 BUS_MODE=memory — single-node run, nothing crosses the process");
            Arc::new(MemoryBus::new())
        }
    };

    let handle = orchestrator::spawn(
        settings.orchestrator.clone(),
        settings.sizing.clone(),
        bus.clone(),
    )
    .await
    .context("orchestrator startup failed")?;

    if let Err(err) = bus
        .publish(
            channels::SERVICE_STARTED,
            json!({
                "service": "trade-orchestrator",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        )
        .await
    {
        warn!("🚌 SERVICE_STARTED publish failed: {err}");
    }

    // HTTP surface. A bind failure is fatal.
    let addr: SocketAddr = settings
        .http_addr
        .parse()
        .with_context(|| format!("bad ORCH_HTTP_ADDR '{}'", settings.http_addr))?;
    let (http_shutdown_tx, http_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_task = tokio::spawn(http::serve(
        http::AppState {
            core: handle.state.clone(),
            bus: bus.clone(),
        },
        addr,
        async {
            let _ = http_shutdown_rx.await;
        },
    ));

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("🛑 Shutdown requested");

    // Graceful teardown: flag off → HTTP closed → state flushed →
    // SERVICE_STOPPED → bus dropped.
    {
        let mut core = handle.state.write().await;
        core.trading_enabled = false;
    }
    let _ = http_shutdown_tx.send(());
    let _ = handle.event_tx.send(InboundEvent::Shutdown).await;
    if let Err(err) = handle.task.await {
        warn!("🛑 Orchestrator task ended abnormally: {err}");
    }
    handle.listener.abort();
    match http_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("🌐 HTTP server error: {err:#}"),
        Err(err) => warn!("🌐 HTTP task join error: {err}"),
    }

    if let Err(err) = bus
        .publish(
            channels::SERVICE_STOPPED,
            json!({
                "service": "trade-orchestrator",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        )
        .await
    {
        warn!("🚌 SERVICE_STOPPED publish failed: {err}");
    }

    info!("🛑 Bye");
    Ok(())
}
