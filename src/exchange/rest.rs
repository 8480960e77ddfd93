// =============================================================================
// Exchange REST client — single POST endpoint for info queries and signed
// actions (spec §6)
// =============================================================================

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::signing::signer::HyperliquidSignature;

#[derive(Clone)]
pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    async fn post_info(&self, body: Value) -> Result<Value> {
        let url = format!("{}/info", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        let status = resp.status();
        let parsed: Value = resp
            .json()
            .await
            .context("failed to parse info response body")?;
        if !status.is_success() {
            anyhow::bail!("info request {} returned {}: {}", body["type"], status, parsed);
        }
        Ok(parsed)
    }

    #[instrument(skip(self))]
    pub async fn spot_clearinghouse_state(&self, user: &str) -> Result<Value> {
        self.post_info(json!({ "type": "spotClearinghouseState", "user": user }))
            .await
    }

    #[instrument(skip(self))]
    pub async fn clearinghouse_state(&self, user: &str) -> Result<Value> {
        self.post_info(json!({ "type": "clearinghouseState", "user": user }))
            .await
    }

    #[instrument(skip(self))]
    pub async fn open_orders(&self, user: &str) -> Result<Value> {
        self.post_info(json!({ "type": "openOrders", "user": user }))
            .await
    }

    #[instrument(skip(self))]
    pub async fn user_fills_by_time(&self, user: &str, start_ms: u64, end_ms: Option<u64>) -> Result<Value> {
        let mut body = json!({ "type": "userFillsByTime", "user": user, "startTime": start_ms });
        if let Some(end) = end_ms {
            body["endTime"] = json!(end);
        }
        self.post_info(body).await
    }

    #[instrument(skip(self))]
    pub async fn user_funding(&self, user: &str, start_ms: u64) -> Result<Value> {
        self.post_info(json!({ "type": "userFunding", "user": user, "startTime": start_ms }))
            .await
    }

    #[instrument(skip(self))]
    pub async fn meta_and_asset_ctxs(&self) -> Result<Value> {
        self.post_info(json!({ "type": "metaAndAssetCtxs" })).await
    }

    #[instrument(skip(self))]
    pub async fn spot_meta_and_asset_ctxs(&self) -> Result<Value> {
        self.post_info(json!({ "type": "spotMetaAndAssetCtxs" })).await
    }

    #[instrument(skip(self))]
    pub async fn spot_meta(&self) -> Result<Value> {
        self.post_info(json!({ "type": "spotMeta" })).await
    }

    #[instrument(skip(self))]
    pub async fn all_mids(&self) -> Result<Value> {
        self.post_info(json!({ "type": "allMids" })).await
    }

    #[instrument(skip(self))]
    pub async fn predicted_fundings(&self) -> Result<Value> {
        self.post_info(json!({ "type": "predictedFundings" })).await
    }

    /// Sign and submit an exchange action: `{action, nonce, signature, vaultAddress?, expiresAfter?}`.
    #[instrument(skip(self, action, signature))]
    pub async fn post_action(
        &self,
        action: Value,
        nonce: u64,
        signature: &HyperliquidSignature,
        vault_address: Option<&str>,
        expires_after: Option<u64>,
    ) -> Result<Value> {
        let mut body = json!({
            "action": action,
            "nonce": nonce,
            "signature": {
                "r": signature.r_hex(),
                "s": signature.s_hex(),
                "v": signature.v,
            },
        });
        if let Some(vault) = vault_address {
            body["vaultAddress"] = json!(vault);
        }
        if let Some(expires) = expires_after {
            body["expiresAfter"] = json!(expires);
        }

        let url = format!("{}/exchange", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        let status = resp.status();
        let parsed: Value = resp
            .json()
            .await
            .context("failed to parse exchange action response")?;
        if !status.is_success() {
            warn!(status = %status, body = %parsed, "exchange action rejected");
            anyhow::bail!("exchange action returned {}: {}", status, parsed);
        }
        debug!(nonce, "exchange action submitted");
        Ok(parsed)
    }
}
