use std::{io::Read, str::FromStr};

use anyhow::Context;
use bitcoin::Network;
use serde::{Deserialize, Serialize};

/// Addresses probed per branch (receive and change) when an input carries no
/// usable derivation metadata.
pub const DEFAULT_GAP_LIMIT: u32 = 2000;
pub const MAX_GAP_LIMIT: u32 = 100_000;
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(with = "network_serde")]
    pub network: Network,
    pub gap_limit: u32,
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            gap_limit: DEFAULT_GAP_LIMIT,
            log_filter: DEFAULT_LOG_FILTER.to_owned(),
        }
    }
}

impl EngineConfig {
    pub fn new(network: Network, gap_limit: Option<u32>) -> anyhow::Result<Self> {
        let config = Self {
            network,
            gap_limit: gap_limit.unwrap_or(DEFAULT_GAP_LIMIT),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.gap_limit > 0, "Gap limit must be greater than zero");
        anyhow::ensure!(
            self.gap_limit <= MAX_GAP_LIMIT,
            "Gap limit {} is greater than {MAX_GAP_LIMIT}",
            self.gap_limit
        );
        Ok(())
    }

    pub fn is_testnet(&self) -> bool {
        self.network != Network::Bitcoin
    }

    pub fn from_reader(r: impl Read) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_reader(r).context("failure parsing config json")?;
        config.validate()?;
        Ok(config)
    }
}

pub fn parse_network(s: &str) -> anyhow::Result<Network> {
    match s.to_lowercase().as_str() {
        "mainnet" | "main" => Ok(Network::Bitcoin),
        other => Network::from_str(other).with_context(|| format!("Invalid network: {s}")),
    }
}

mod network_serde {
    use bitcoin::Network;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(n: &Network, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&n.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Network, D::Error> {
        let s = String::deserialize(d)?;
        super::parse_network(&s).map_err(serde::de::Error::custom)
    }
}
