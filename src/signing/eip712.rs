// =============================================================================
// EIP-712 typed-data digest (spec §4.1)
// =============================================================================
//
// Fixed domain `Exchange v1 chainId=1337 contract=0x0`; primary type
// `Agent(source:string, connectionId:bytes32)`. Unlike a general-purpose
// EIP-712 signer, this exchange uses exactly one domain for every L1
// action, so the domain is a constant rather than a per-action method.
// =============================================================================

use alloy::primitives::{address, keccak256, Address, B256};
use alloy::sol_types::{eip712_domain, Eip712Domain};
use serde::Serialize;

/// `Agent(string source,bytes32 connectionId)`
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub source: String,
    pub connection_id: B256,
}

fn exchange_domain() -> Eip712Domain {
    eip712_domain! {
        name: "Exchange",
        version: "1",
        chain_id: 1337u64,
        verifying_contract: address!("0000000000000000000000000000000000000000"),
    }
}

const AGENT_TYPE_STRING: &str = "Agent(string source,bytes32 connectionId)";

impl Agent {
    pub fn new(source: &'static str, connection_id: B256) -> Self {
        Self {
            source: source.to_string(),
            connection_id,
        }
    }

    fn type_hash() -> B256 {
        keccak256(AGENT_TYPE_STRING.as_bytes())
    }

    fn struct_hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(Self::type_hash().as_slice());
        buf.extend_from_slice(keccak256(self.source.as_bytes()).as_slice());
        buf.extend_from_slice(self.connection_id.as_slice());
        keccak256(&buf)
    }

    /// `keccak256(0x1901 || domainHash || messageHash)`.
    pub fn signing_hash(&self) -> B256 {
        let domain_separator = exchange_domain().separator();
        let struct_hash = self.struct_hash();

        let mut buf = Vec::with_capacity(66);
        buf.push(0x19);
        buf.push(0x01);
        buf.extend_from_slice(domain_separator.as_slice());
        buf.extend_from_slice(struct_hash.as_slice());
        keccak256(&buf)
    }
}

/// `source = "a"` on mainnet, `"b"` on testnet (spec §4.1).
pub fn agent_source_for_network(network: crate::config::Network) -> &'static str {
    network.agent_source()
}

/// Builds the connection-id operand from an action hash: the hash itself is
/// the `connectionId` bytes32 the exchange expects.
pub fn connection_id_from_action_hash(action_hash: B256) -> B256 {
    action_hash
}

#[allow(dead_code)]
fn verifying_contract() -> Address {
    address!("0000000000000000000000000000000000000000")
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::b256;

    #[test]
    fn domain_matches_fixed_exchange_v1() {
        let domain = exchange_domain();
        assert_eq!(domain.chain_id, Some(alloy::primitives::U256::from(1337u64)));
        assert_eq!(domain.name.as_deref(), Some("Exchange"));
        assert_eq!(domain.version.as_deref(), Some("1"));
    }

    #[test]
    fn mainnet_and_testnet_sources_differ() {
        let connection_id =
            b256!("de6c4037798a4434ca03cd05f00e3b803126221375cd1e7eaaaf041768be06eb");
        let mainnet = Agent::new("a", connection_id);
        let testnet = Agent::new("b", connection_id);
        assert_ne!(mainnet.signing_hash(), testnet.signing_hash());
    }
}
