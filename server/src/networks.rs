use std::fmt;
use std::str::FromStr;

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

/// The closed set of networks deals can settle on. The first seven are EVM
/// chains; `solana` and `bitcoin` are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Ethereum,
    Polygon,
    Bsc,
    Arbitrum,
    Optimism,
    Avalanche,
    Fantom,
    Solana,
    Bitcoin,
}

pub const SUPPORTED_NETWORKS: [Network; 9] = [
    Network::Ethereum,
    Network::Polygon,
    Network::Bsc,
    Network::Arbitrum,
    Network::Optimism,
    Network::Avalanche,
    Network::Fantom,
    Network::Solana,
    Network::Bitcoin,
];

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Ethereum => "ethereum",
            Network::Polygon => "polygon",
            Network::Bsc => "bsc",
            Network::Arbitrum => "arbitrum",
            Network::Optimism => "optimism",
            Network::Avalanche => "avalanche",
            Network::Fantom => "fantom",
            Network::Solana => "solana",
            Network::Bitcoin => "bitcoin",
        }
    }

    pub fn is_evm(&self) -> bool {
        !matches!(self, Network::Solana | Network::Bitcoin)
    }

    pub fn chain_id(&self) -> Option<u64> {
        match self {
            Network::Ethereum => Some(1),
            Network::Polygon => Some(137),
            Network::Bsc => Some(56),
            Network::Arbitrum => Some(42161),
            Network::Optimism => Some(10),
            Network::Avalanche => Some(43114),
            Network::Fantom => Some(250),
            Network::Solana | Network::Bitcoin => None,
        }
    }

    pub fn native_token(&self) -> &'static str {
        match self {
            Network::Ethereum | Network::Arbitrum | Network::Optimism => "ETH",
            Network::Polygon => "MATIC",
            Network::Bsc => "BNB",
            Network::Avalanche => "AVAX",
            Network::Fantom => "FTM",
            Network::Solana => "SOL",
            Network::Bitcoin => "BTC",
        }
    }

    /// Wrapped-native token address used for bridge route discovery when the
    /// transfer is in the chain's native asset.
    pub fn wrapped_native_address(&self) -> Option<&'static str> {
        match self {
            Network::Ethereum => Some("0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"),
            Network::Polygon => Some("0x0d500b1d8e8ef31e21c99d1db9a6444d3adf1270"),
            Network::Bsc => Some("0xbb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c"),
            Network::Arbitrum => Some("0x82af49447d8a07e3bd95bd0d56f35241523fbab1"),
            Network::Optimism => Some("0x4200000000000000000000000000000000000006"),
            Network::Avalanche => Some("0xb31f66aa3c1e785363f0875a1b74e27b85fd66c7"),
            Network::Fantom => Some("0x21be370d5312f44cb42ce377bc9b8a0cef1a4c83"),
            Network::Solana | Network::Bitcoin => None,
        }
    }

    /// Token symbols the router will accept on this network. Native symbols
    /// are substituted with the wrapped-native address before discovery.
    pub fn known_tokens(&self) -> &'static [&'static str] {
        match self {
            Network::Ethereum => &["ETH", "WETH", "USDC", "USDT", "DAI"],
            Network::Polygon => &["MATIC", "WMATIC", "USDC", "USDT", "DAI"],
            Network::Bsc => &["BNB", "WBNB", "USDC", "USDT", "BUSD"],
            Network::Arbitrum => &["ETH", "WETH", "USDC", "USDT"],
            Network::Optimism => &["ETH", "WETH", "USDC", "USDT"],
            Network::Avalanche => &["AVAX", "WAVAX", "USDC", "USDT"],
            Network::Fantom => &["FTM", "WFTM", "USDC"],
            Network::Solana => &["SOL", "USDC", "USDT"],
            Network::Bitcoin => &["BTC"],
        }
    }

    /// Checks that a wallet address is well-formed for this network.
    pub fn validate_address(&self, address: &str) -> bool {
        if self.is_evm() {
            return Address::from_str(address).is_ok();
        }
        match self {
            Network::Solana => is_solana_address(address),
            Network::Bitcoin => is_bitcoin_address(address),
            _ => unreachable!("EVM networks handled above"),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" => Ok(Network::Ethereum),
            "polygon" => Ok(Network::Polygon),
            "bsc" => Ok(Network::Bsc),
            "arbitrum" => Ok(Network::Arbitrum),
            "optimism" => Ok(Network::Optimism),
            "avalanche" => Ok(Network::Avalanche),
            "fantom" => Ok(Network::Fantom),
            "solana" => Ok(Network::Solana),
            "bitcoin" => Ok(Network::Bitcoin),
            other => Err(anyhow::anyhow!("unsupported network: {other}")),
        }
    }
}

/// Infers the network of a wallet address from its shape. EVM addresses
/// default to `ethereum`; callers with more context override afterwards.
pub fn infer_network(address: &str) -> Option<Network> {
    if Address::from_str(address).is_ok() {
        return Some(Network::Ethereum);
    }
    if is_bitcoin_address(address) {
        return Some(Network::Bitcoin);
    }
    if is_solana_address(address) {
        return Some(Network::Solana);
    }
    None
}

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

fn is_base58(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| BASE58_ALPHABET.contains(c))
}

fn is_solana_address(address: &str) -> bool {
    (32..=44).contains(&address.len()) && is_base58(address)
}

fn is_bitcoin_address(address: &str) -> bool {
    if let Some(data) = address.strip_prefix("bc1") {
        let bech32 = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";
        return (11..=87).contains(&data.len())
            && data.chars().all(|c| bech32.contains(c.to_ascii_lowercase()));
    }
    (address.starts_with('1') || address.starts_with('3'))
        && (26..=35).contains(&address.len())
        && is_base58(address)
}
