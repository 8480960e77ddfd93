// =============================================================================
// ECDSA secp256k1 signer (spec §4.1)
// =============================================================================

use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer as AlloySignerTrait;
use async_trait::async_trait;

use crate::errors::SignerError;

#[derive(Debug, Clone)]
pub struct HyperliquidSignature {
    pub r: U256,
    pub s: U256,
    pub v: u64,
}

impl HyperliquidSignature {
    pub fn r_hex(&self) -> String {
        format!("0x{:064x}", self.r)
    }

    pub fn s_hex(&self) -> String {
        format!("0x{:064x}", self.s)
    }
}

#[async_trait]
pub trait HyperliquidSigner: Send + Sync {
    async fn sign_hash(&self, hash: B256) -> Result<HyperliquidSignature, SignerError>;
    fn address(&self) -> Address;
}

/// Thin wrapper so any `alloy::signers::Signer` impl (hardware wallet,
/// KMS-backed signer, local key) can be used interchangeably.
pub struct AlloySigner<S: AlloySignerTrait> {
    pub inner: S,
}

#[async_trait]
impl HyperliquidSigner for PrivateKeySigner {
    async fn sign_hash(&self, hash: B256) -> Result<HyperliquidSignature, SignerError> {
        let sig = AlloySignerTrait::sign_hash(self, &hash)
            .await
            .map_err(|e| SignerError::SigningFailed(e.to_string()))?;
        let v = if sig.v() { 28 } else { 27 };
        Ok(HyperliquidSignature {
            r: sig.r(),
            s: sig.s(),
            v,
        })
    }

    fn address(&self) -> Address {
        AlloySignerTrait::address(self)
    }
}

#[async_trait]
impl<S> HyperliquidSigner for AlloySigner<S>
where
    S: AlloySignerTrait + Send + Sync,
{
    async fn sign_hash(&self, hash: B256) -> Result<HyperliquidSignature, SignerError> {
        let sig = self
            .inner
            .sign_hash(&hash)
            .await
            .map_err(|e| SignerError::SigningFailed(e.to_string()))?;
        let v = if sig.v() { 28 } else { 27 };
        Ok(HyperliquidSignature {
            r: sig.r(),
            s: sig.s(),
            v,
        })
    }

    fn address(&self) -> Address {
        self.inner.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::eip712::Agent;
    use alloy::primitives::b256;

    fn test_signer() -> PrivateKeySigner {
        let private_key = "e908f86dbb4d55ac876378565aafeabc187f6690f046459397b17d9b9a19688e";
        private_key.parse::<PrivateKeySigner>().unwrap()
    }

    #[tokio::test]
    async fn signs_agent_digest_deterministically() {
        let signer = test_signer();
        let connection_id =
            b256!("de6c4037798a4434ca03cd05f00e3b803126221375cd1e7eaaaf041768be06eb");
        let agent = Agent::new("a", connection_id);
        let sig = HyperliquidSigner::sign_hash(&signer, agent.signing_hash())
            .await
            .unwrap();

        let expected = "fa8a41f6a3fa728206df80801a83bcbfbab08649cd34d9c0bfba7c7b2f99340f53a00226604567b98a1492803190d65a201d6805e5831b7044f17fd530aec7841c";
        let actual = format!("{:064x}{:064x}{:02x}", sig.r, sig.s, sig.v);
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn mainnet_and_testnet_signatures_differ() {
        let signer = test_signer();
        let connection_id =
            b256!("de6c4037798a4434ca03cd05f00e3b803126221375cd1e7eaaaf041768be06eb");
        let mainnet_sig =
            HyperliquidSigner::sign_hash(&signer, Agent::new("a", connection_id).signing_hash())
                .await
                .unwrap();
        let testnet_sig =
            HyperliquidSigner::sign_hash(&signer, Agent::new("b", connection_id).signing_hash())
                .await
                .unwrap();
        assert_ne!(mainnet_sig.r, testnet_sig.r);
    }
}
