// =============================================================================
// Orchestrator — tick pipeline, gating, enter/exit/rebalance workflows
// (spec §4.4, §4.5, §4.6)
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::account::engine::AccountEngine;
use crate::account::state::{AccountState, Order as AccountOrder};
use crate::alerts::telegram::AlertChannel;
use crate::config::{RiskLimits, RuntimeConfig};
use crate::errors::OrchestratorError;
use crate::execution::engine::{Cancel, ExecutionEngine, Order as ExecOrder, WaitForFillOutcome};
use crate::market::context::{PerpContext, SpotContext};
use crate::market::engine::MarketEngine;
use crate::metrics;
use crate::persistence::kv::KvStore;
use crate::signing::codec::TimeInForce;
use crate::strategy::signals::{evaluate_carry, funding_guard_defers_exit, ConfirmationCounter, SignalInputs};
use crate::strategy::snapshot::StrategySnapshot;
use crate::strategy::state_machine::{Event, State, StateMachine};
use crate::timescale::MetricsSink;
use crate::types::{compute_market_snapshot, MarketSnapshot};
use crate::util::{normalize_ioc_price, round_down};

/// Tolerance below which a wait-for-fill outcome is treated as "fully filled"
/// relative to the requested size, absorbing float noise from size rounding.
const FILL_TOLERANCE: f64 = 1e-6;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `last_update_ms == 0` means "never updated"; age is reported as an
/// effectively-infinite number of seconds so the kill-switch trips rather
/// than dividing by a timestamp that never happened.
fn age_secs(now_ms: u64, last_update_ms: u64) -> u64 {
    if last_update_ms == 0 {
        return u64::MAX / 1000;
    }
    now_ms.saturating_sub(last_update_ms) / 1000
}

/// Connectivity kill-switch predicate (spec §4.6): engages when either feed
/// has gone stale past its configured ceiling.
fn is_stale(market_age_secs: u64, account_age_secs: u64, risk: &RiskLimits) -> bool {
    market_age_secs > risk.max_market_age_secs || account_age_secs > risk.max_account_age_secs
}

/// A rebalance order is reduce-only exactly when it shrinks the existing
/// perp position rather than growing or flipping it.
fn reduce_only_for_rebalance(is_buy: bool, perp_position: f64) -> bool {
    (is_buy && perp_position < 0.0) || (!is_buy && perp_position > 0.0)
}

/// 128-bit client order id: 8 bytes of wall-clock ms, 8 random bytes, so
/// concurrent legs never collide and idempotency replay still works across
/// a process restart within the same millisecond.
fn mint_cloid() -> String {
    let mut bytes = [0u8; 16];
    bytes[0..8].copy_from_slice(&now_ms().to_be_bytes());
    rand::thread_rng().fill_bytes(&mut bytes[8..16]);
    format!("0x{}", hex::encode(bytes))
}

pub struct Orchestrator {
    cfg: RwLock<RuntimeConfig>,
    account: Arc<AccountEngine>,
    market: Arc<MarketEngine>,
    execution: Arc<ExecutionEngine>,
    alerts: Arc<dyn AlertChannel>,
    sink: Arc<dyn MetricsSink>,
    store: Arc<dyn KvStore>,

    sm: Mutex<StateMachine>,
    counter: Mutex<ConfirmationCounter>,
    entry_cooldown_until_ms: AtomicU64,
    hedge_cooldown_until_ms: AtomicU64,
    kill_switch_active: AtomicBool,
    cancel: CancellationToken,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: RuntimeConfig,
        account: Arc<AccountEngine>,
        market: Arc<MarketEngine>,
        execution: Arc<ExecutionEngine>,
        alerts: Arc<dyn AlertChannel>,
        sink: Arc<dyn MetricsSink>,
        store: Arc<dyn KvStore>,
        initial_state: State,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg: RwLock::new(cfg),
            account,
            market,
            execution,
            alerts,
            sink,
            store,
            sm: Mutex::new(StateMachine::from_state(initial_state)),
            counter: Mutex::new(ConfirmationCounter::default()),
            entry_cooldown_until_ms: AtomicU64::new(0),
            hedge_cooldown_until_ms: AtomicU64::new(0),
            kill_switch_active: AtomicBool::new(false),
            cancel,
        })
    }

    // -------------------------------------------------------------------
    // Per-tick pipeline (spec §4.5)
    // -------------------------------------------------------------------

    /// A cancelled tick returns before touching the state machine (spec §5
    /// cancellation contract: never leave it in an intermediate state).
    pub async fn tick(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.cfg.read().paused {
            return;
        }

        let (perp_ctx, spot_ctx) = match (self.market.perp_context(), self.market.spot_context()) {
            (Some(p), Some(s)) => (p, s),
            _ => {
                warn!("market contexts not yet available, skipping tick");
                return;
            }
        };

        let account_state = self.account.snapshot();
        let perp_mid = self.market.mid(&perp_ctx.coin).unwrap_or(0.0);
        let spot_mid = self.market.mid(&spot_ctx.mid_lookup_key).unwrap_or(0.0);
        let spot_balance = account_state.spot_balance(&spot_ctx.base_token);
        let perp_position = account_state.perp_position(&perp_ctx.coin);
        let open_order_count = account_state.open_order_count();

        let now = now_ms();
        let market_age_secs = age_secs(now, self.market.last_mid_update());
        let account_age_secs = age_secs(now, self.account.last_update());

        let cfg = self.cfg.read().clone();
        let snapshot = compute_market_snapshot(
            perp_ctx,
            spot_ctx,
            perp_mid,
            spot_mid,
            spot_balance,
            perp_position,
            open_order_count,
            cfg.min_exposure_usd,
            market_age_secs,
            account_age_secs,
        );

        self.normalize_state(&snapshot);

        if let Err(e) = self.run_gates_and_decide(&snapshot, &cfg, &account_state).await {
            warn!(error = %e, "tick aborted");
        }

        self.persist_tick(&snapshot, &account_state).await;
    }

    /// Forces the state machine back to a consistent resting state when a
    /// workflow's orders have all resolved but the event that would normally
    /// drive the transition was never applied (e.g. process restart mid-exit).
    fn normalize_state(&self, snapshot: &MarketSnapshot) {
        let mut sm = self.sm.lock();
        match sm.state() {
            State::Enter | State::Exit if snapshot.open_order_count == 0 => {
                if snapshot.flat_strict {
                    sm.force(State::Idle);
                } else {
                    sm.force(State::HedgeOk);
                }
            }
            State::HedgeOk
                if snapshot.flat_strict && now_ms() >= self.entry_cooldown_until_ms.load(Ordering::SeqCst) =>
            {
                sm.force(State::Idle);
            }
            _ => {}
        }
    }

    async fn run_gates_and_decide(
        &self,
        snapshot: &MarketSnapshot,
        cfg: &RuntimeConfig,
        account_state: &AccountState,
    ) -> Result<(), OrchestratorError> {
        metrics::set_delta_usd(snapshot.delta_usd);
        metrics::set_funding_rate(snapshot.perp_ctx.funding_rate);
        metrics::set_market_age_secs(snapshot.market_age_secs as f64);
        metrics::set_account_age_secs(snapshot.account_age_secs as f64);

        self.handle_kill_switch(snapshot, &cfg.risk, account_state).await;
        if self.kill_switch_active.load(Ordering::SeqCst) {
            return Err(OrchestratorError::KillSwitchEngaged(format!(
                "market_age={}s account_age={}s",
                snapshot.market_age_secs, snapshot.account_age_secs
            )));
        }

        let state = self.sm.lock().state();
        if state == State::Idle && !(snapshot.flat && snapshot.open_order_count == 0) {
            return Ok(());
        }

        self.check_risk(snapshot, &cfg.risk, account_state)?;

        let inputs = SignalInputs {
            perp_position: snapshot.perp_position,
            spot_balance: snapshot.spot_balance,
            price_ref: snapshot.price_ref,
            funding_rate: snapshot.perp_ctx.funding_rate,
            notional_usd: cfg.notional_usd,
            min_funding_rate: cfg.min_funding_rate,
            carry_buffer_usd: cfg.carry_buffer_usd,
            fee_bps: cfg.fee_bps,
            slippage_bps: cfg.slippage_bps,
        };
        let carry = evaluate_carry(&inputs);
        let (entry_confirmed, exit_confirmed) = {
            let mut counter = self.counter.lock();
            counter.record(carry.funding_ok);
            (
                counter.entry_confirmed(cfg.funding_confirmations),
                counter.exit_confirmed(cfg.funding_dip_confirmations),
            )
        };

        let now = now_ms();
        match self.sm.lock().state() {
            State::Idle => {
                if entry_confirmed
                    && self.market.volatility() <= cfg.max_volatility
                    && now >= self.entry_cooldown_until_ms.load(Ordering::SeqCst)
                {
                    self.enter_position(snapshot, cfg, account_state).await;
                }
            }
            State::HedgeOk => {
                let forecast = self.market.forecast();
                let defer = funding_guard_defers_exit(
                    cfg.exit_funding_guard_enabled,
                    forecast.as_ref().map(|f| f.next_funding_ms),
                    forecast.as_ref().map(|f| f.rate),
                    snapshot.perp_ctx.funding_rate,
                    now,
                    cfg.exit_funding_guard_secs,
                );
                if cfg.exit_on_funding_dip && exit_confirmed && !defer {
                    self.exit_position(snapshot, cfg).await;
                } else if now >= self.hedge_cooldown_until_ms.load(Ordering::SeqCst) {
                    self.rebalance_delta(snapshot, cfg).await;
                }
            }
            State::Enter | State::Exit => {}
        }

        Ok(())
    }

    fn check_risk(
        &self,
        snapshot: &MarketSnapshot,
        risk: &RiskLimits,
        account_state: &AccountState,
    ) -> Result<(), OrchestratorError> {
        let exposure_usd = snapshot.spot_balance.abs().max(snapshot.perp_position.abs()) * snapshot.price_ref;
        if exposure_usd > risk.max_notional_usd {
            return Err(OrchestratorError::RiskViolation(format!(
                "exposure {exposure_usd:.2} exceeds max_notional_usd {}",
                risk.max_notional_usd
            )));
        }
        if snapshot.open_order_count as u32 > risk.max_open_orders {
            return Err(OrchestratorError::RiskViolation(format!(
                "open_order_count {} exceeds max_open_orders {}",
                snapshot.open_order_count, risk.max_open_orders
            )));
        }
        if let Some(margin) = &account_state.margin_summary {
            if let Some(ratio) = margin.margin_ratio {
                if ratio < risk.min_margin_ratio {
                    return Err(OrchestratorError::RiskViolation(format!(
                        "margin_ratio {ratio:.4} below min_margin_ratio {}",
                        risk.min_margin_ratio
                    )));
                }
            }
            if let Some(ratio) = margin.health_ratio {
                if ratio < risk.min_health_ratio {
                    return Err(OrchestratorError::RiskViolation(format!(
                        "health_ratio {ratio:.4} below min_health_ratio {}",
                        risk.min_health_ratio
                    )));
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Connectivity kill-switch (spec §4.6)
    // -------------------------------------------------------------------

    async fn handle_kill_switch(&self, snapshot: &MarketSnapshot, risk: &RiskLimits, account_state: &AccountState) {
        let stale = is_stale(snapshot.market_age_secs, snapshot.account_age_secs, risk);
        let was_active = self.kill_switch_active.swap(stale, Ordering::SeqCst);

        if stale && !was_active {
            metrics::kill_switch_engaged();
            warn!(
                market_age = snapshot.market_age_secs,
                account_age = snapshot.account_age_secs,
                "kill switch engaged"
            );
            self.alert(&format!(
                "kill switch engaged: market_age={}s account_age={}s",
                snapshot.market_age_secs, snapshot.account_age_secs
            ))
            .await;
        } else if !stale && was_active {
            metrics::kill_switch_restored();
            info!("kill switch restored");
            self.alert("kill switch restored, connectivity fresh").await;
        }

        if stale {
            self.cancel_all_open_orders(snapshot, account_state).await;
        }
    }

    async fn cancel_all_open_orders(&self, snapshot: &MarketSnapshot, account_state: &AccountState) {
        for order in account_state.open_orders.values() {
            let Some(asset_id) = resolve_asset_id(order, &snapshot.perp_ctx, &snapshot.spot_ctx) else {
                warn!(order_id = %order.id, "cannot resolve asset for kill-switch cancel, skipping");
                continue;
            };
            match self
                .execution
                .cancel_order(Cancel {
                    asset: asset_id,
                    order_id: order.id.clone(),
                })
                .await
            {
                Ok(()) => metrics::orders_cancelled(),
                Err(e) => warn!(order_id = %order.id, error = %e, "kill-switch cancel failed"),
            }
        }
    }

    // -------------------------------------------------------------------
    // Entry workflow (spec §4.5 steps 1-11)
    // -------------------------------------------------------------------

    async fn enter_position(&self, snapshot: &MarketSnapshot, cfg: &RuntimeConfig, account_state: &AccountState) {
        self.sm.lock().apply(Event::EnterReq);

        if let Err(e) = self.ensure_entry_usdc(cfg.notional_usd, account_state).await {
            warn!(error = %e, "usdc transfer ahead of entry failed");
            self.abort_entry(&format!("entry aborted: {e}")).await;
            return;
        }

        let spot_size = round_down(
            cfg.notional_usd / snapshot.price_ref.max(f64::MIN_POSITIVE),
            snapshot.spot_ctx.base_decimals,
        );
        if spot_size <= 0.0 {
            self.abort_entry("entry aborted: computed spot size rounds to zero").await;
            return;
        }
        let spot_limit_px =
            normalize_ioc_price(snapshot.spot_mid, cfg.ioc_price_bps, true, true, snapshot.spot_ctx.base_decimals);

        let spot_order_id = match self
            .execution
            .place_order(ExecOrder {
                asset: snapshot.spot_ctx.asset_id(),
                is_buy: true,
                size: spot_size,
                limit_px: spot_limit_px,
                reduce_only: false,
                client_order_id: mint_cloid(),
                tif: TimeInForce::Ioc,
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.abort_entry(&format!("entry failed: spot order placement error: {e}")).await;
                return;
            }
        };

        let spot_filled = self
            .fill_and_cleanup(snapshot.spot_ctx.asset_id(), &spot_order_id, now_ms(), cfg)
            .await;
        if spot_filled <= 0.0 {
            self.abort_entry("entry failed: spot leg did not fill").await;
            return;
        }

        let perp_size = round_down(spot_filled, snapshot.perp_ctx.size_decimals);
        if perp_size <= 0.0 {
            self.rollback_spot(snapshot, cfg, spot_filled, false).await;
            self.abort_entry("entry failed: hedge size rounds to zero, rolled back spot leg").await;
            return;
        }
        let perp_limit_px = normalize_ioc_price(
            snapshot.perp_mid,
            cfg.ioc_price_bps,
            false,
            false,
            snapshot.perp_ctx.size_decimals,
        );

        let perp_order_id = match self
            .execution
            .place_order(ExecOrder {
                asset: snapshot.perp_ctx.index,
                is_buy: false,
                size: perp_size,
                limit_px: perp_limit_px,
                reduce_only: false,
                client_order_id: mint_cloid(),
                tif: TimeInForce::Ioc,
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.rollback_spot(snapshot, cfg, spot_filled, false).await;
                self.abort_entry(&format!("entry failed: perp order placement error: {e}, spot leg rolled back"))
                    .await;
                return;
            }
        };

        let perp_filled = self
            .fill_and_cleanup(snapshot.perp_ctx.index, &perp_order_id, now_ms(), cfg)
            .await;
        if perp_filled <= 0.0 {
            self.rollback_spot(snapshot, cfg, spot_filled, false).await;
            self.abort_entry("entry failed: perp hedge did not fill, spot leg rolled back").await;
            return;
        }

        if spot_filled > perp_filled {
            let residual = round_down(spot_filled - perp_filled, snapshot.spot_ctx.base_decimals);
            if residual > 0.0 {
                info!(residual, "rolling back unhedged residual spot quantity");
                self.rollback_spot(snapshot, cfg, residual, false).await;
            }
        }

        self.sm.lock().apply(Event::HedgeOk);
        self.entry_cooldown_until_ms
            .store(now_ms() + cfg.entry_interval_secs * 1000, Ordering::SeqCst);
        metrics::orders_placed();
        if let Err(e) = self.account.reconcile().await {
            warn!(error = %e, "post-entry reconcile failed");
        }
        self.alert(&format!(
            "entered position: spot {spot_filled:.6} {}, perp {perp_filled:.6} {}",
            snapshot.spot_ctx.base_token, snapshot.perp_ctx.coin
        ))
        .await;
    }

    async fn abort_entry(&self, message: &str) {
        warn!(message);
        self.sm.lock().force(State::Idle);
        metrics::entry_failed();
        self.alert(message).await;
    }

    async fn ensure_entry_usdc(&self, notional_usd: f64, account_state: &AccountState) -> Result<(), OrchestratorError> {
        let spot_usdc = account_state.spot_balance("USDC");
        if spot_usdc >= notional_usd {
            return Ok(());
        }
        let shortfall = notional_usd - spot_usdc;
        let perp_usdc = account_state
            .margin_summary
            .as_ref()
            .and_then(|m| m.account_value)
            .unwrap_or(0.0);
        if perp_usdc < shortfall {
            return Err(OrchestratorError::UsdcShortfall {
                needed: shortfall,
                available: perp_usdc,
            });
        }
        self.execution.usd_class_transfer(shortfall, false).await?;
        Ok(())
    }

    /// Waits for an order to resolve, cancelling it if it's still resting
    /// once the timeout elapses (or the wait was cancelled), and returns the
    /// filled size.
    async fn fill_and_cleanup(&self, asset: u32, order_id: &str, start_ms: u64, cfg: &RuntimeConfig) -> f64 {
        let outcome = match self
            .execution
            .wait_for_fill(&self.account, order_id, start_ms, cfg.entry_timeout_ms, cfg.entry_poll_interval_ms)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, order_id, "wait for fill aborted, cancelling resting order");
                WaitForFillOutcome { filled: 0.0, open: true }
            }
        };
        if outcome.open {
            if let Err(e) = self
                .execution
                .cancel_order(Cancel {
                    asset,
                    order_id: order_id.to_string(),
                })
                .await
            {
                warn!(error = %e, order_id, "cancel of unfilled order failed");
            }
        }
        outcome.filled
    }

    /// Places an IOC spot order to unwind `amount` of the entry's spot leg
    /// (residual rollback, or a failure rollback). `is_buy` names the
    /// rollback's own direction, not the leg it reverses.
    async fn rollback_spot(&self, snapshot: &MarketSnapshot, cfg: &RuntimeConfig, amount: f64, is_buy: bool) {
        let limit_px = normalize_ioc_price(snapshot.spot_mid, cfg.ioc_price_bps, is_buy, true, snapshot.spot_ctx.base_decimals);
        match self
            .execution
            .place_order(ExecOrder {
                asset: snapshot.spot_ctx.asset_id(),
                is_buy,
                size: amount,
                limit_px,
                reduce_only: false,
                client_order_id: mint_cloid(),
                tif: TimeInForce::Ioc,
            })
            .await
        {
            Ok(order_id) => {
                self.fill_and_cleanup(snapshot.spot_ctx.asset_id(), &order_id, now_ms(), cfg).await;
            }
            Err(e) => warn!(error = %e, "rollback spot order placement failed"),
        }
    }

    // -------------------------------------------------------------------
    // Exit workflow (spec §4.5 scenario 4)
    // -------------------------------------------------------------------

    async fn exit_position(&self, snapshot: &MarketSnapshot, cfg: &RuntimeConfig) {
        self.sm.lock().apply(Event::ExitReq);

        let spot_balance = snapshot.spot_balance;
        let perp_position = snapshot.perp_position;
        let spot_exposure_usd = spot_balance.abs() * snapshot.price_ref;
        let perp_exposure_usd = perp_position.abs() * snapshot.price_ref;

        let mut spot_ok = spot_exposure_usd < cfg.min_exposure_usd;
        let mut perp_ok = perp_exposure_usd < cfg.min_exposure_usd;

        if !spot_ok {
            let is_buy = spot_balance < 0.0;
            let size = round_down(spot_balance.abs(), snapshot.spot_ctx.base_decimals);
            let limit_px =
                normalize_ioc_price(snapshot.spot_mid, cfg.ioc_price_bps, is_buy, true, snapshot.spot_ctx.base_decimals);
            spot_ok = match self
                .execution
                .place_order(ExecOrder {
                    asset: snapshot.spot_ctx.asset_id(),
                    is_buy,
                    size,
                    limit_px,
                    reduce_only: false,
                    client_order_id: mint_cloid(),
                    tif: TimeInForce::Ioc,
                })
                .await
            {
                Ok(order_id) => {
                    let filled = self.fill_and_cleanup(snapshot.spot_ctx.asset_id(), &order_id, now_ms(), cfg).await;
                    filled >= size - FILL_TOLERANCE
                }
                Err(e) => {
                    warn!(error = %e, "spot exit order placement failed");
                    false
                }
            };
        }

        if !spot_ok {
            self.sm.lock().force(State::HedgeOk);
            metrics::exit_failed();
            self.alert("exit failed: spot leg did not fully close").await;
            return;
        }

        if !perp_ok {
            let is_buy = perp_position < 0.0;
            let size = round_down(perp_position.abs(), snapshot.perp_ctx.size_decimals);
            let limit_px =
                normalize_ioc_price(snapshot.perp_mid, cfg.ioc_price_bps, is_buy, false, snapshot.perp_ctx.size_decimals);
            perp_ok = match self
                .execution
                .place_order(ExecOrder {
                    asset: snapshot.perp_ctx.index,
                    is_buy,
                    size,
                    limit_px,
                    reduce_only: true,
                    client_order_id: mint_cloid(),
                    tif: TimeInForce::Ioc,
                })
                .await
            {
                Ok(order_id) => {
                    let filled = self.fill_and_cleanup(snapshot.perp_ctx.index, &order_id, now_ms(), cfg).await;
                    filled >= size - FILL_TOLERANCE
                }
                Err(e) => {
                    warn!(error = %e, "perp exit order placement failed");
                    false
                }
            };
        }

        if !perp_ok {
            warn!("perp exit leg failed, rolling back spot leg to original exposure");
            let rollback_size = round_down(spot_balance.abs(), snapshot.spot_ctx.base_decimals);
            if rollback_size > 0.0 {
                // Reverses the exit's own spot direction, not the original entry.
                self.rollback_spot(snapshot, cfg, rollback_size, spot_balance >= 0.0).await;
            }
            self.sm.lock().force(State::HedgeOk);
            metrics::exit_failed();
            self.alert("exit failed: perp leg did not close, spot leg rolled back").await;
            return;
        }

        self.sm.lock().apply(Event::Done);
        if let Err(e) = self.account.reconcile().await {
            warn!(error = %e, "post-exit reconcile failed");
        }
        self.alert("position closed").await;
    }

    // -------------------------------------------------------------------
    // Delta rebalance (spec §4.5)
    // -------------------------------------------------------------------

    async fn rebalance_delta(&self, snapshot: &MarketSnapshot, cfg: &RuntimeConfig) {
        if snapshot.open_order_count > 0 {
            return;
        }
        let delta_abs_usd = snapshot.delta_usd.abs();
        if delta_abs_usd <= cfg.delta_band_usd || delta_abs_usd < cfg.min_exposure_usd {
            return;
        }

        let size = round_down(
            delta_abs_usd / snapshot.price_ref.max(f64::MIN_POSITIVE),
            snapshot.perp_ctx.size_decimals,
        );
        if size > 0.0 {
            let is_buy = snapshot.delta_usd < 0.0;
            let reduce_only = reduce_only_for_rebalance(is_buy, snapshot.perp_position);
            let limit_px = normalize_ioc_price(
                snapshot.perp_mid,
                cfg.ioc_price_bps,
                is_buy,
                false,
                snapshot.perp_ctx.size_decimals,
            );

            match self
                .execution
                .place_order(ExecOrder {
                    asset: snapshot.perp_ctx.index,
                    is_buy,
                    size,
                    limit_px,
                    reduce_only,
                    client_order_id: mint_cloid(),
                    tif: TimeInForce::Ioc,
                })
                .await
            {
                Ok(order_id) => {
                    self.fill_and_cleanup(snapshot.perp_ctx.index, &order_id, now_ms(), cfg).await;
                    metrics::rebalances();
                }
                Err(e) => warn!(error = %e, "rebalance order placement failed"),
            }
        }

        self.hedge_cooldown_until_ms
            .store(now_ms() + cfg.entry_interval_secs * 1000, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------
    // Persistence + alerting glue
    // -------------------------------------------------------------------

    async fn persist_tick(&self, snapshot: &MarketSnapshot, account_state: &AccountState) {
        let state = self.sm.lock().state();
        metrics::set_state_machine_state(state as i64);

        let strategy_snapshot = StrategySnapshot {
            action: state,
            spot_asset: snapshot.spot_ctx.symbol.clone(),
            perp_asset: snapshot.perp_ctx.coin.clone(),
            spot_mid: snapshot.spot_mid,
            perp_mid: snapshot.perp_mid,
            spot_balance: snapshot.spot_balance,
            perp_position: snapshot.perp_position,
            open_orders: account_state.open_orders.keys().cloned().collect(),
            updated_at_ms: now_ms(),
        };
        strategy_snapshot.save(self.store.as_ref()).await;
        self.sink.record_tick(&strategy_snapshot).await;
    }

    async fn alert(&self, msg: &str) {
        if let Err(e) = self.alerts.send(msg).await {
            warn!(error = %e, "failed to send alert");
        }
    }

    // -------------------------------------------------------------------
    // Operator surface (spec §6)
    // -------------------------------------------------------------------

    pub fn pause(&self) {
        self.cfg.write().paused = true;
    }

    pub fn resume(&self) {
        self.cfg.write().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.cfg.read().paused
    }

    pub fn risk_snapshot(&self) -> RiskLimits {
        self.cfg.read().risk.clone()
    }

    pub fn risk_set(&self, pairs: &[(String, String)]) -> Vec<String> {
        self.cfg.write().risk.apply_overrides(pairs)
    }

    pub fn risk_reset(&self) {
        self.cfg.write().risk = RiskLimits::default();
    }

    pub fn state(&self) -> State {
        self.sm.lock().state()
    }

    pub fn status_text(&self) -> String {
        let cfg = self.cfg.read();
        let state = self.sm.lock().state();
        format!(
            "state={state} paused={} entry_interval_secs={} risk={{max_notional_usd={}, max_open_orders={}, min_margin_ratio={}, min_health_ratio={}}}",
            cfg.paused, cfg.entry_interval_secs, cfg.risk.max_notional_usd, cfg.risk.max_open_orders,
            cfg.risk.min_margin_ratio, cfg.risk.min_health_ratio,
        )
    }
}

fn resolve_asset_id(order: &AccountOrder, perp_ctx: &PerpContext, spot_ctx: &SpotContext) -> Option<u32> {
    let asset = order.asset.as_deref()?;
    if asset == perp_ctx.coin {
        Some(perp_ctx.index)
    } else if asset == spot_ctx.raw_name || asset == spot_ctx.symbol {
        Some(spot_ctx.asset_id())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk() -> RiskLimits {
        RiskLimits {
            max_notional_usd: 5000.0,
            max_open_orders: 10,
            min_margin_ratio: 0.15,
            min_health_ratio: 0.2,
            max_market_age_secs: 60,
            max_account_age_secs: 60,
        }
    }

    #[test]
    fn is_stale_trips_on_either_feed() {
        assert!(!is_stale(30, 30, &risk()));
        assert!(is_stale(61, 0, &risk()));
        assert!(is_stale(0, 61, &risk()));
    }

    #[test]
    fn age_secs_treats_zero_as_never_updated() {
        assert!(age_secs(1_000_000, 0) > 1_000_000);
        assert_eq!(age_secs(10_000, 4_000), 6);
    }

    #[test]
    fn reduce_only_set_only_when_shrinking_existing_position() {
        assert!(reduce_only_for_rebalance(true, -5.0));
        assert!(!reduce_only_for_rebalance(true, 5.0));
        assert!(reduce_only_for_rebalance(false, 5.0));
        assert!(!reduce_only_for_rebalance(false, -5.0));
        assert!(!reduce_only_for_rebalance(true, 0.0));
    }

    #[test]
    fn resolve_asset_id_matches_perp_or_spot_by_name() {
        let perp_ctx = PerpContext {
            index: 0,
            coin: "PURR".into(),
            funding_rate: 0.0,
            oracle_price: 1.0,
            mark_price: 1.0,
            size_decimals: 2,
        };
        let spot_ctx = SpotContext {
            symbol: "PURR/USDC".into(),
            raw_name: "PURR".into(),
            mid_lookup_key: "@1".into(),
            base_token: "PURR".into(),
            base_decimals: 5,
            quote_token: "USDC".into(),
            quote_decimals: 8,
            index: 1,
        };

        let perp_order = AccountOrder {
            id: "1".into(),
            asset: Some("PURR".into()),
            status: "open".into(),
            remaining_sz: None,
            payload: serde_json::Value::Null,
        };
        assert_eq!(resolve_asset_id(&perp_order, &perp_ctx, &spot_ctx), Some(0));

        let spot_order = AccountOrder {
            asset: Some("PURR/USDC".into()),
            ..perp_order.clone()
        };
        assert_eq!(resolve_asset_id(&spot_order, &perp_ctx, &spot_ctx), Some(10_001));

        let unknown_order = AccountOrder {
            asset: Some("ETH".into()),
            ..perp_order
        };
        assert_eq!(resolve_asset_id(&unknown_order, &perp_ctx, &spot_ctx), None);
    }
}
