//! Consensus parameter definitions.

use crate::constants::{COINBASE_MATURITY, DEFAULT_MAX_BLOCK_SIZE, MAX_FUTURE_BLOCK_TIME};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Prod,
    Dev,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Prod => "prod",
            Network::Dev => "dev",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "prod" | "main" | "mainnet" => Some(Network::Prod),
            "dev" | "regtest" => Some(Network::Dev),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub network_id: u32,
    pub coinbase_maturity: i32,
    pub default_max_block_size: u32,
    pub max_future_block_time: i64,
    /// Dev chains accept standardness violations by default.
    pub require_standard: bool,
}

impl ConsensusParams {
    /// Network magic derived from the network id, as the federation tooling does.
    pub fn message_start(&self) -> [u8; 4] {
        let magic = self.network_id.wrapping_add(33_550_335);
        magic.to_be_bytes()
    }
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Prod => ConsensusParams {
            network,
            network_id: 1,
            coinbase_maturity: COINBASE_MATURITY,
            default_max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            max_future_block_time: MAX_FUTURE_BLOCK_TIME,
            require_standard: true,
        },
        Network::Dev => ConsensusParams {
            network,
            network_id: 1_905_960_821,
            coinbase_maturity: COINBASE_MATURITY,
            default_max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            max_future_block_time: MAX_FUTURE_BLOCK_TIME,
            require_standard: false,
        },
    }
}
