// =============================================================================
// Wire codec — deterministic map-based encoding of order/cancel/transfer
// actions (spec §4.1)
// =============================================================================

use alloy::primitives::{keccak256, Address, B256};
use serde::Serialize;

use crate::errors::CodecError;

/// `formatFloat(x, precision=8)`: fixed-decimal string, trailing zeros and
/// a trailing `.` stripped, `-0` normalized to `0`. Fails with
/// `CodecError::Rounding` if the round-trip through this representation
/// drifts from the input by `>= 1e-12` — the exchange never forgives a
/// silently truncated price or size.
pub fn float_to_wire(x: f64, precision: u32) -> Result<String, CodecError> {
    let formatted = format!("{:.*}", precision as usize, x);
    let parsed: f64 = formatted.parse().unwrap_or(x);
    if (parsed - x).abs() >= 1e-12 {
        return Err(CodecError::Rounding {
            value: x,
            precision,
        });
    }

    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    let trimmed = if trimmed.is_empty() || trimmed == "-0" {
        "0"
    } else {
        trimmed
    };
    Ok(trimmed.to_string())
}

/// Time-in-force for a resting or IOC order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum TimeInForce {
    Ioc,
    Gtc,
    Alo,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimitOrderType {
    pub tif: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderTypeWire {
    pub limit: LimitOrderType,
}

/// `{a:int, b:bool, p:string, s:string, r:bool, t:{limit:{tif:string}}, c?:string}`
#[derive(Debug, Clone, Serialize)]
pub struct OrderWire {
    pub a: u32,
    pub b: bool,
    pub p: String,
    pub s: String,
    pub r: bool,
    pub t: OrderTypeWire,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
}

impl OrderWire {
    pub fn new(
        asset: u32,
        is_buy: bool,
        limit_px: f64,
        size: f64,
        reduce_only: bool,
        tif: TimeInForce,
        cloid: Option<String>,
    ) -> Result<Self, CodecError> {
        let tif_str = match tif {
            TimeInForce::Ioc => "Ioc",
            TimeInForce::Gtc => "Gtc",
            TimeInForce::Alo => "Alo",
        };
        Ok(Self {
            a: asset,
            b: is_buy,
            p: float_to_wire(limit_px, 8)?,
            s: float_to_wire(size, 8)?,
            r: reduce_only,
            t: OrderTypeWire {
                limit: LimitOrderType {
                    tif: tif_str.to_string(),
                },
            },
            c: cloid,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderAction {
    #[serde(rename = "type")]
    pub action_type: &'static str,
    pub orders: Vec<OrderWire>,
    pub grouping: &'static str,
}

impl OrderAction {
    pub fn new(orders: Vec<OrderWire>) -> Result<Self, CodecError> {
        if orders.is_empty() {
            return Err(CodecError::MissingOrders);
        }
        Ok(Self {
            action_type: "order",
            orders,
            grouping: "na",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelWire {
    pub a: u32,
    pub o: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelAction {
    #[serde(rename = "type")]
    pub action_type: &'static str,
    pub cancels: Vec<CancelWire>,
}

impl CancelAction {
    pub fn new(cancels: Vec<CancelWire>) -> Result<Self, CodecError> {
        if cancels.is_empty() {
            return Err(CodecError::MissingCancels);
        }
        Ok(Self {
            action_type: "cancel",
            cancels,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsdClassTransferAction {
    #[serde(rename = "type")]
    pub action_type: &'static str,
    pub hyperliquid_chain: String,
    pub signature_chain_id: String,
    pub amount: String,
    pub to_perp: bool,
    pub nonce: u64,
}

impl UsdClassTransferAction {
    pub fn new(hyperliquid_chain: String, amount: f64, to_perp: bool, nonce: u64) -> Result<Self, CodecError> {
        Ok(Self {
            action_type: "usdClassTransfer",
            hyperliquid_chain,
            signature_chain_id: "0x66eee".to_string(),
            amount: float_to_wire(amount, 8)?,
            to_perp,
            nonce,
        })
    }
}

/// `keccak256(encoded_action || nonce_be_u64 || vault_tag [|| 0x00 || expires_be_u64])`
pub fn action_hash<T: Serialize>(
    action: &T,
    nonce: u64,
    vault_address: Option<Address>,
    expires_after: Option<u64>,
) -> Result<B256, CodecError> {
    let mut encoded =
        rmp_serde::to_vec_named(action).map_err(|e| CodecError::Signer(crate::errors::SignerError::SigningFailed(e.to_string())))?;
    encoded.extend_from_slice(&nonce.to_be_bytes());
    match vault_address {
        None => encoded.push(0x00),
        Some(addr) => {
            encoded.push(0x01);
            encoded.extend_from_slice(addr.as_slice());
        }
    }
    if let Some(expires) = expires_after {
        encoded.push(0x00);
        encoded.extend_from_slice(&expires.to_be_bytes());
    }
    Ok(keccak256(&encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_to_wire_rounds_cleanly() {
        assert_eq!(float_to_wire(1.23, 8).unwrap(), "1.23");
        assert_eq!(float_to_wire(1.0, 8).unwrap(), "1");
        assert_eq!(float_to_wire(-0.0, 8).unwrap(), "0");
        assert_eq!(float_to_wire(0.0, 8).unwrap(), "0");
    }

    #[test]
    fn float_to_wire_rejects_precision_loss() {
        let err = float_to_wire(1.234_567_891, 8).unwrap_err();
        assert!(matches!(err, CodecError::Rounding { .. }));
    }

    #[test]
    fn order_action_rejects_empty_orders() {
        let err = OrderAction::new(vec![]).unwrap_err();
        assert!(matches!(err, CodecError::MissingOrders));
    }

    #[test]
    fn cancel_action_rejects_empty_cancels() {
        let err = CancelAction::new(vec![]).unwrap_err();
        assert!(matches!(err, CodecError::MissingCancels));
    }

    #[test]
    fn order_wire_skips_absent_cloid() {
        let order =
            OrderWire::new(1, true, 100.0, 1.5, false, TimeInForce::Ioc, None).unwrap();
        let json = serde_json::to_string(&order).unwrap();
        assert!(!json.contains("\"c\""));
    }

    #[test]
    fn action_hash_changes_with_vault_tag() {
        let order = OrderWire::new(1, true, 100.0, 1.5, false, TimeInForce::Ioc, None).unwrap();
        let action = OrderAction::new(vec![order]).unwrap();
        let without_vault = action_hash(&action, 1, None, None).unwrap();
        let with_vault = action_hash(&action, 1, Some(Address::ZERO), None).unwrap();
        assert_ne!(without_vault, with_vault);
    }
}
