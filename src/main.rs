// =============================================================================
// HyperBasis — Main Entry Point
// =============================================================================
//
// Wires up the six background tasks from spec §5: tick loop, account stream
// reader, market stream reader, spot reconciler, operator loop, metrics
// exporter. Every engine is constructed once here and shared via `Arc`.
// =============================================================================

mod account;
mod alerts;
mod config;
mod errors;
mod exchange;
mod execution;
mod market;
mod metrics;
mod persistence;
mod signing;
mod strategy;
mod timescale;
mod types;
mod util;

use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::account::AccountEngine;
use crate::alerts::{AlertChannel, OperatorLoop, TelegramChannel};
use crate::config::{Cli, RuntimeConfig};
use crate::errors::InitError;
use crate::execution::{ExecutionEngine, IdempotencyCache};
use crate::exchange::RestClient;
use crate::market::MarketEngine;
use crate::persistence::{KvStore, SqliteKvStore};
use crate::signing::{HyperliquidSigner, NonceManager};
use crate::strategy::orchestrator::Orchestrator;
use crate::strategy::snapshot::StrategySnapshot;
use crate::strategy::state_machine::State;

/// A no-op alert channel for unattended deployments with no Telegram token;
/// `send` just logs, `get_updates` always returns empty so the operator
/// loop, if spawned at all, never has anything to authorize against.
struct NoopAlertChannel;

#[async_trait::async_trait]
impl AlertChannel for NoopAlertChannel {
    async fn send(&self, msg: &str) -> anyhow::Result<()> {
        info!(msg, "alert (no channel configured)");
        Ok(())
    }

    async fn get_updates(&self, _offset: u64, _timeout_secs: u64) -> anyhow::Result<Vec<crate::alerts::Update>> {
        Ok(Vec::new())
    }
}

fn ws_url_from_base(base_url: &str) -> String {
    let ws = base_url.replacen("https://", "wss://", 1).replacen("http://", "ws://", 1);
    format!("{}/ws", ws.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("HyperBasis starting up");

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %e, "fatal error during startup or run");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // ── 1. Runtime config ────────────────────────────────────────────────
    let mut runtime_config = RuntimeConfig::load(&cli.config).unwrap_or_else(|e| {
        warn!(error = %e, path = %cli.config.display(), "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });
    runtime_config.vault_address = cli.vault_address.clone().or(runtime_config.vault_address);
    runtime_config.telegram_chat_id = cli.telegram_chat_id.or(runtime_config.telegram_chat_id);

    info!(
        base_url = %runtime_config.base_url,
        spot = %runtime_config.spot_symbol,
        perp = %runtime_config.perp_symbol,
        "runtime config ready"
    );

    // ── 2. Persistence ───────────────────────────────────────────────────
    let store: Arc<dyn KvStore> = Arc::new(
        SqliteKvStore::open(cli.db_path.to_string_lossy().as_ref())
            .map_err(|e| InitError::Persistence(e.to_string()))?,
    );

    // ── 3. Signing + REST + nonce + idempotency ─────────────────────────
    let signer: Arc<dyn HyperliquidSigner> = Arc::new(
        cli.private_key
            .parse::<PrivateKeySigner>()
            .map_err(|e| InitError::InvalidConfig(format!("invalid private key: {e}")))?,
    );
    let signer_address = signer.address().to_string();

    // Root cancellation handle (spec §5): ctrl+c cancels it, and every
    // long-running operation downstream (retries, fill waits, the tick
    // loop) observes it and returns promptly.
    let shutdown = CancellationToken::new();

    let rest = RestClient::new(runtime_config.base_url.clone(), runtime_config.rest_timeout_ms);
    let nonce = Arc::new(
        NonceManager::init(
            store.clone(),
            &runtime_config.base_url,
            &signer_address,
            runtime_config.vault_address.as_deref(),
        )
        .await,
    );
    let idempotency = IdempotencyCache::new(store.clone());

    let execution = Arc::new(ExecutionEngine::new(
        rest.clone(),
        signer.clone(),
        nonce,
        idempotency,
        runtime_config.network,
        runtime_config.vault_address.clone(),
        shutdown.clone(),
    ));

    // ── 4. Account + market engines ──────────────────────────────────────
    let account_user = cli.account_address.clone().unwrap_or_else(|| cli.wallet_address.clone());
    let account = Arc::new(AccountEngine::new(rest.clone(), ws_url_from_base(&runtime_config.base_url), account_user));
    account
        .reconcile()
        .await
        .map_err(|e| InitError::InvalidConfig(format!("initial account reconcile failed: {e}")))?;

    let market = MarketEngine::new(
        rest.clone(),
        runtime_config.perp_symbol.clone(),
        runtime_config.spot_symbol.clone(),
        runtime_config.candle_window,
    );
    market.refresh_all().await;

    // ── 5. Alerts + telemetry sink ────────────────────────────────────────
    let alerts: Arc<dyn AlertChannel> = match cli.telegram_token.clone() {
        Some(token) if !token.is_empty() => {
            Arc::new(TelegramChannel::new(token, cli.telegram_chat_id.unwrap_or_default()))
        }
        _ => {
            warn!("no telegram token configured, alerts will only be logged");
            Arc::new(NoopAlertChannel)
        }
    };
    let sink = timescale::build_sink(cli.timescale_dsn.as_deref(), store.clone());

    // ── 6. Resume state from the last persisted snapshot ─────────────────
    let account_state = account.snapshot();
    let is_exposed = match (market.spot_context(), market.perp_context()) {
        (Some(spot_ctx), Some(perp_ctx)) => {
            account_state.spot_balance(&spot_ctx.base_token).abs() > 1e-6
                || account_state.perp_position(&perp_ctx.coin).abs() > 1e-6
        }
        _ => false,
    };
    let initial_state = match StrategySnapshot::load(&store).await {
        Some(snapshot) => snapshot.startup_state(is_exposed),
        None if is_exposed => State::HedgeOk,
        None => State::Idle,
    };
    info!(state = %initial_state, is_exposed, "resuming with initial state");

    let orchestrator = Orchestrator::new(
        runtime_config.clone(),
        account.clone(),
        market.clone(),
        execution.clone(),
        alerts.clone(),
        sink,
        store.clone(),
        initial_state,
        shutdown.clone(),
    );

    // ── 7. Background task 6: metrics exporter ───────────────────────────
    let metrics_addr = cli
        .metrics_addr
        .parse()
        .map_err(|e| InitError::InvalidConfig(format!("invalid metrics bind address: {e}")))?;
    metrics::install(metrics_addr)?;

    // ── 8. Background task 1: tick loop ──────────────────────────────────
    let tick_orchestrator = orchestrator.clone();
    let tick_interval_secs = runtime_config.entry_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(tick_interval_secs));
        loop {
            interval.tick().await;
            tick_orchestrator.tick().await;
        }
    });

    // ── 9. Background task 2: account stream reader ─────────────────────
    let stream_account = account.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = stream_account.start().await {
                error!(error = %e, "account websocket failed to connect, retrying in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
            // `start` returns immediately after spawning its own dispatch
            // loop; watch `last_update` for staleness and reconnect once
            // the socket has gone quiet for too long.
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                let now_ms = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                let age_secs = now_ms.saturating_sub(stream_account.last_update()) / 1000;
                if age_secs > 45 {
                    warn!(age_secs, "account stream looks stale, reconnecting");
                    break;
                }
            }
        }
    });

    // ── 10. Background task 3: market stream reader ─────────────────────
    let stream_market = market.clone();
    let market_ws_url = ws_url_from_base(&runtime_config.base_url);
    tokio::spawn(async move {
        loop {
            if let Err(e) = stream_market.start(&market_ws_url).await {
                error!(error = %e, "market websocket failed to connect, retrying in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
            // Same staleness-driven reconnect shape as the account stream
            // reader (task 2): watch `last_mid_update` and reconnect once
            // the socket has gone quiet for too long.
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                let now_ms = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                let age_secs = now_ms.saturating_sub(stream_market.last_mid_update()) / 1000;
                if age_secs > 45 {
                    warn!(age_secs, "market stream looks stale, reconnecting");
                    break;
                }
            }
        }
    });

    // `allMids`/`candle` cover the live price feed, but contexts and the
    // funding forecast have no WS channel in this API and still need a
    // periodic REST refresh (each internally throttled to 30s).
    let poll_market = market.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            poll_market.refresh_metadata().await;
        }
    });

    // ── 11. Background task 4: spot reconciler ───────────────────────────
    let reconcile_account = account.clone();
    let spot_reconcile_interval_secs = runtime_config.spot_reconcile_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(spot_reconcile_interval_secs));
        loop {
            interval.tick().await;
            match reconcile_account.ws_handle() {
                Some(ws) => {
                    if let Err(e) = reconcile_account.request_spot_refresh(&ws) {
                        warn!(error = %e, "spot reconcile post failed");
                    }
                }
                None => tracing::debug!("spot reconciler skipped tick: account stream not connected"),
            }
        }
    });

    // ── 12. Background task 5: operator loop ─────────────────────────────
    if cli.telegram_token.is_some() {
        let operator_loop = OperatorLoop::new(
            orchestrator.clone(),
            alerts.clone(),
            store.clone(),
            runtime_config.telegram_chat_id,
            runtime_config.operator_allowed_user_ids.clone(),
            30,
        );
        tokio::spawn(async move {
            operator_loop.run().await;
        });
    } else {
        info!("no telegram token configured, operator command loop not started");
    }

    info!("all subsystems running, press ctrl+c to stop");

    // ── 13. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");
    shutdown.cancel();

    if let Err(e) = runtime_config.save(&cli.config) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("HyperBasis shut down complete");
    Ok(())
}
