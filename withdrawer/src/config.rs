use crate::inventory::EscrowFilter;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Marketplace endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointsConfig {
    /// Paginated inventory listing, queried by owner.
    pub listing_url: Url,
    /// Authoritative lookup used to re-verify which items are still escrowed.
    pub lookup_url: Url,
    /// Relay that exchanges a client signature for a contract confirmation.
    pub relay_url: Url,
    /// Per-request timeout.
    pub request_timeout_sec: u64,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        EndpointsConfig {
            listing_url: parse_default_url("https://api.ordex.io/v0.1/items/byOwner"),
            lookup_url: parse_default_url("https://api.ethscriptions.com/api/ethscriptions/filtered"),
            relay_url: parse_default_url("https://api-next.ordex.io/signer/s/wc"),
            request_timeout_sec: 30,
        }
    }
}

impl EndpointsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscrowContractConfig {
    /// Address of the escrow contract that custodies the items and exposes
    /// `bulkWithdrawItems`.
    pub address: String,
    /// ABI definition of the escrow contract, forwarded to whoever broadcasts
    /// the call.
    pub abi_file: Option<PathBuf>,
}

impl Default for EscrowContractConfig {
    fn default() -> Self {
        EscrowContractConfig {
            address: "0xC33F8610941bE56fB0d84E25894C0d928CC97ddE".to_string(),
            abi_file: None,
        }
    }
}

impl EscrowContractConfig {
    /// The lookup endpoint matches owners on the lowercase address.
    pub fn lookup_owner(&self) -> String {
        self.address.to_lowercase()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// A listing page of exactly this many items may be followed by another.
    pub page_size: usize,
    /// Upper bound on the continuation chain.
    pub max_pages: usize,
    /// Number of identifiers sent in one re-verification request.
    pub lookup_batch_size: usize,
    pub escrow_filter: EscrowFilter,
    pub timeout_sec: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            page_size: 50,
            max_pages: 200,
            lookup_batch_size: 100,
            escrow_filter: EscrowFilter::NotEmpty,
            timeout_sec: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WithdrawalConfig {
    pub timeout_sec: u64,
    /// Where prepared contract calls are written for broadcasting.
    pub output_dir: PathBuf,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        WithdrawalConfig {
            timeout_sec: 300,
            output_dir: PathBuf::from("withdrawals"),
        }
    }
}

/// Config for the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebUIConfig {
    pub host: String,
    pub port: u16,
}

/// The contents of the config.yaml file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigFile {
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub escrow_contract: EscrowContractConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub withdrawal: WithdrawalConfig,
    #[serde(default)]
    pub web_ui: Option<WebUIConfig>,
}

impl ConfigFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.discovery.page_size > 0, "discovery.page_size must be positive");
        anyhow::ensure!(self.discovery.max_pages > 0, "discovery.max_pages must be positive");
        anyhow::ensure!(
            self.discovery.lookup_batch_size > 0,
            "discovery.lookup_batch_size must be positive"
        );
        anyhow::ensure!(
            self.escrow_contract.address.starts_with("0x") && self.escrow_contract.address.len() == 42,
            "escrow_contract.address must be a 0x-prefixed 20 byte address"
        );
        anyhow::ensure!(
            self.endpoints.request_timeout_sec > 0,
            "endpoints.request_timeout_sec must be positive"
        );
        anyhow::ensure!(self.discovery.timeout_sec > 0, "discovery.timeout_sec must be positive");
        anyhow::ensure!(self.withdrawal.timeout_sec > 0, "withdrawal.timeout_sec must be positive");
        Ok(())
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.timeout_sec)
    }

    pub fn withdrawal_timeout(&self) -> Duration {
        Duration::from_secs(self.withdrawal.timeout_sec)
    }
}

pub fn load_config_file(path: &Path) -> anyhow::Result<ConfigFile> {
    ConfigFile::from_file(path).with_context(|| format!("Load {}", path.display()))
}

fn parse_default_url(url: &str) -> Url {
    Url::parse(url).expect("hard-coded endpoint URL is valid")
}
