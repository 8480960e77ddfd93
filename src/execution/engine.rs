// =============================================================================
// ExecutionEngine — idempotent place/cancel, retry, wait-for-fill (spec §4.4)
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::account::engine::AccountEngine;
use crate::config::Network;
use crate::errors::ExecutionError;
use crate::exchange::rest::RestClient;
use crate::execution::idempotency::IdempotencyCache;
use crate::signing::codec::{
    self, CancelAction, CancelWire, OrderAction, OrderWire, TimeInForce, UsdClassTransferAction,
};
use crate::signing::eip712::Agent;
use crate::signing::nonce::NonceManager;
use crate::signing::signer::HyperliquidSigner;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct Order {
    pub asset: u32,
    pub is_buy: bool,
    pub size: f64,
    pub limit_px: f64,
    pub reduce_only: bool,
    pub client_order_id: String,
    pub tif: TimeInForce,
}

#[derive(Debug, Clone)]
pub struct Cancel {
    pub asset: u32,
    pub order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitForFillOutcome {
    pub filled: f64,
    pub open: bool,
}

pub struct ExecutionEngine {
    rest: RestClient,
    signer: Arc<dyn HyperliquidSigner>,
    nonce: Arc<NonceManager>,
    idempotency: IdempotencyCache,
    network: Network,
    vault_address: Option<String>,
    cancel: CancellationToken,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rest: RestClient,
        signer: Arc<dyn HyperliquidSigner>,
        nonce: Arc<NonceManager>,
        idempotency: IdempotencyCache,
        network: Network,
        vault_address: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rest,
            signer,
            nonce,
            idempotency,
            network,
            vault_address,
            cancel,
        }
    }

    pub async fn place_order(&self, order: Order) -> Result<String, ExecutionError> {
        if !order.client_order_id.is_empty() {
            if let Some(existing) = self.idempotency.lookup(&order.client_order_id).await {
                info!(cloid = %order.client_order_id, server_id = %existing, "idempotent replay, skipping network call");
                return Ok(existing);
            }
        }

        let cloid = if order.client_order_id.is_empty() {
            None
        } else {
            Some(order.client_order_id.clone())
        };
        let wire = OrderWire::new(
            order.asset,
            order.is_buy,
            order.limit_px,
            order.size,
            order.reduce_only,
            order.tif,
            cloid,
        )?;
        let action = OrderAction::new(vec![wire])?;

        let response = self
            .retry_with_backoff(|| self.submit_action(&action))
            .await?;

        let server_id = extract_order_id(&response).unwrap_or_default();
        if !order.client_order_id.is_empty() {
            self.idempotency.record(&order.client_order_id, &server_id).await;
        }
        Ok(server_id)
    }

    pub async fn cancel_order(&self, cancel: Cancel) -> Result<(), ExecutionError> {
        let order_id: u64 = cancel.order_id.parse().unwrap_or(0);
        let action = CancelAction::new(vec![CancelWire {
            a: cancel.asset,
            o: order_id,
        }])?;
        self.retry_with_backoff(|| self.submit_action(&action)).await?;
        Ok(())
    }

    /// Moves USDC between the spot and perp wallets ahead of an entry whose
    /// legs would otherwise be margin-short on one side (spec §4.4 step 3).
    /// Unlike order/cancel actions, `usdClassTransfer` carries its own
    /// `nonce` field, so each retry attempt mints a fresh nonce and rebuilds
    /// the action around it rather than reusing a stale one.
    pub async fn usd_class_transfer(&self, amount: f64, to_perp: bool) -> Result<(), ExecutionError> {
        self.retry_with_backoff(|| async {
            let nonce = self.nonce.next_nonce().await;
            let action = UsdClassTransferAction::new(
                self.network.hyperliquid_chain().to_string(),
                amount,
                to_perp,
                nonce,
            )
            .map_err(ExecutionError::Codec)?;
            self.submit_action_with_nonce(&action, nonce).await
        })
        .await?;
        Ok(())
    }

    async fn submit_action<T: serde::Serialize>(&self, action: &T) -> Result<Value, ExecutionError> {
        let nonce = self.nonce.next_nonce().await;
        self.submit_action_with_nonce(action, nonce).await
    }

    async fn submit_action_with_nonce<T: serde::Serialize>(
        &self,
        action: &T,
        nonce: u64,
    ) -> Result<Value, ExecutionError> {
        let vault_address: Option<alloy::primitives::Address> = self
            .vault_address
            .as_deref()
            .and_then(|a| a.parse().ok());
        let action_hash = codec::action_hash(action, nonce, vault_address, None)
            .map_err(ExecutionError::Codec)?;

        let agent = Agent::new(self.network.agent_source(), action_hash);
        let signature = self
            .signer
            .sign_hash(agent.signing_hash())
            .await
            .map_err(|e| ExecutionError::Rest(e.to_string()))?;

        let action_json = serde_json::to_value(action).map_err(|e| ExecutionError::Rest(e.to_string()))?;
        self.rest
            .post_action(
                action_json,
                nonce,
                &signature,
                self.vault_address.as_deref(),
                None,
            )
            .await
            .map_err(|e| ExecutionError::Rest(e.to_string()))
    }

    /// Retries `f` with exponential backoff, aborting promptly if `cancel`
    /// fires mid-attempt or mid-sleep (spec §5 cancellation contract).
    async fn retry_with_backoff<F, Fut>(&self, mut f: F) -> Result<Value, ExecutionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, ExecutionError>>,
    {
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut last_err = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ExecutionError::Cancelled),
                outcome = f() => outcome,
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_err = e.to_string();
                    warn!(attempt, error = %last_err, "action submission failed, retrying");
                    if attempt < MAX_ATTEMPTS {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Err(ExecutionError::Cancelled),
                            _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        }
                        backoff_ms *= 2;
                    }
                }
            }
        }
        Err(ExecutionError::RetryExhausted {
            attempts: MAX_ATTEMPTS,
            last: last_err,
        })
    }

    /// Dual-signal wait for fill: stream aggregator first, REST fallback
    /// once the order leaves the open set (spec §4.4). Returns promptly with
    /// `ExecutionError::Cancelled` if `cancel` fires, leaving the order's
    /// on-exchange state untouched for the caller to clean up.
    pub async fn wait_for_fill(
        &self,
        account: &AccountEngine,
        order_id: &str,
        start_ms: u64,
        timeout_ms: u64,
        poll_interval_ms: u64,
    ) -> Result<WaitForFillOutcome, ExecutionError> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let mut rest_fill_checked = false;
        let mut last_open = true;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            let stream_live = account.fills_enabled();
            let mut filled = if stream_live {
                account.fill_size(order_id)
            } else {
                self.rest_fill_size(account, order_id, start_ms).await
            };

            let open_orders = account.open_orders().await.unwrap_or_default();
            let is_open = open_orders.iter().any(|o| o.id == order_id);
            last_open = is_open;

            if !is_open {
                if stream_live && !rest_fill_checked {
                    rest_fill_checked = true;
                    let rest_filled = self.rest_fill_size(account, order_id, start_ms).await;
                    filled = filled.max(rest_filled);
                }
                return Ok(WaitForFillOutcome { filled, open: false });
            }

            if tokio::time::Instant::now() >= deadline {
                if !rest_fill_checked {
                    filled = filled.max(self.rest_fill_size(account, order_id, start_ms).await);
                }
                return Ok(WaitForFillOutcome {
                    filled,
                    open: last_open,
                });
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ExecutionError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(poll_interval_ms)) => {}
            }
        }
    }

    async fn rest_fill_size(&self, account: &AccountEngine, order_id: &str, start_ms: u64) -> f64 {
        match account.user_fills_by_time(start_ms, None).await {
            Ok(fills) => fills
                .iter()
                .filter(|f| f.order_id == order_id)
                .map(|f| f.size.abs())
                .sum(),
            Err(_) => 0.0,
        }
    }
}

fn oid_as_string(entry: &Value) -> Option<String> {
    match entry.get("oid")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_order_id(response: &Value) -> Option<String> {
    let statuses = response
        .get("response")
        .and_then(|r| r.get("data"))
        .and_then(|d| d.get("statuses"))
        .and_then(Value::as_array)?;
    let first = statuses.first()?;
    if let Some(resting) = first.get("resting") {
        return oid_as_string(resting);
    }
    if let Some(filled) = first.get("filled") {
        return oid_as_string(filled);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_order_id_from_resting_status() {
        let body = json!({
            "response": { "data": { "statuses": [{ "resting": { "oid": 12345 } }] } }
        });
        assert_eq!(extract_order_id(&body), Some("12345".to_string()));
    }

    #[test]
    fn extract_order_id_from_filled_status() {
        let body = json!({
            "response": { "data": { "statuses": [{ "filled": { "oid": 99 } }] } }
        });
        assert_eq!(extract_order_id(&body), Some("99".to_string()));
    }

    #[test]
    fn extract_order_id_returns_none_for_error_status() {
        let body = json!({
            "response": { "data": { "statuses": [{ "error": "insufficient margin" }] } }
        });
        assert_eq!(extract_order_id(&body), None);
    }
}
