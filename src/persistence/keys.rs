// =============================================================================
// Key-naming helpers for the five key families (spec §4.7)
// =============================================================================

pub const LAST_SNAPSHOT_KEY: &str = "strategy:last_snapshot";
pub const OPERATOR_LAST_UPDATE_ID_KEY: &str = "telegram:operator:last_update_id";

pub fn nonce_key(base_url: &str, signer_address: &str, vault: Option<&str>) -> String {
    format!(
        "exchange:nonce:{}:{}:{}",
        base_url,
        signer_address,
        vault.unwrap_or("")
    )
}

pub fn cloid_key(client_order_id: &str) -> String {
    format!("cloid:{}", client_order_id)
}

pub fn audit_key(ns_ts: u128, update_id: u64) -> String {
    format!("ops:audit:{}:{}", ns_ts, update_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_key_includes_all_segments() {
        let key = nonce_key("https://api.hyperliquid.xyz", "0xabc", Some("0xvault"));
        assert_eq!(key, "exchange:nonce:https://api.hyperliquid.xyz:0xabc:0xvault");
    }

    #[test]
    fn nonce_key_with_no_vault_has_trailing_colon() {
        let key = nonce_key("url", "signer", None);
        assert_eq!(key, "exchange:nonce:url:signer:");
    }

    #[test]
    fn cloid_key_format() {
        assert_eq!(cloid_key("abc123"), "cloid:abc123");
    }

    #[test]
    fn audit_key_format() {
        assert_eq!(audit_key(1000, 5), "ops:audit:1000:5");
    }
}
