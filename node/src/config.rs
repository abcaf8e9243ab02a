//! # Node Configuration
//!
//! `pod-node` reads one JSON file, `<data_dir>/config.json` unless `--config`
//! points elsewhere. Every field has a default, so a partial file is fine.
//! CLI flags and environment variables override file values in `main`.
//!
//! ```json
//! {
//!   "listen_addr": "0.0.0.0:9840",
//!   "api_port": 9841,
//!   "chain": { "rpc_url": "http://127.0.0.1:8545", "contract_address": "0x…", "chain_id": 31337 },
//!   "poll": { "max_attempts": 20, "interval": 30, "backoff": 1.0 },
//!   "bulletins": [
//!     { "path": "data/table.csv", "mode": "table", "sub_modes": ["vrf"], "unit_price": 10 }
//!   ]
//! }
//! ```
//!
//! Without `rpc_url` and `contract_address` the node settles on an
//! in-process devnet, which is only useful for single-process demos.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ethers::signers::LocalWallet;
use serde::{Deserialize, Serialize};

use pod_protocol::bulletin::{BulletinCatalog, PublishedBulletin};
use pod_protocol::config::{RetryPolicy, DEFAULT_API_PORT, DEFAULT_METRICS_PORT, DEFAULT_P2P_PORT};
use pod_protocol::crypto::keys::{load_wallet, wallet_from_hex};
use pod_protocol::engine::KeystreamEngine;
use pod_protocol::{SubMode, TopMode};

pub const CONFIG_FILE: &str = "config.json";
pub const KEY_FILE: &str = "node.key";

/// Plain chunk size used when a listing does not set one.
const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the seller accepts PoD sessions on.
    pub listen_addr: String,
    pub api_port: u16,
    pub metrics_port: u16,
    pub data_dir: PathBuf,
    /// Key file; `<data_dir>/node.key` when unset.
    pub key_file: Option<PathBuf>,
    /// Hex private key. Takes precedence over `key_file`.
    pub key_hex: Option<String>,
    pub chain: ChainConfig,
    /// Secret polling policy for purchases.
    pub poll: RetryPolicy,
    /// `pretty` or `json`.
    pub log_format: String,
    /// Datasets this node sells.
    pub bulletins: Vec<ListingConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{DEFAULT_P2P_PORT}"),
            api_port: DEFAULT_API_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            data_dir: PathBuf::from(".pod"),
            key_file: None,
            key_hex: None,
            chain: ChainConfig::default(),
            poll: RetryPolicy::default(),
            log_format: "pretty".into(),
            bulletins: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub rpc_url: Option<String>,
    pub contract_address: Option<String>,
    pub chain_id: u64,
}

/// One dataset on sale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingConfig {
    pub path: PathBuf,
    pub mode: TopMode,
    /// Offered flows, default first.
    pub sub_modes: Vec<SubMode>,
    /// Wei per delivered item.
    pub unit_price: u64,
    /// Plain-mode chunk size in bytes. Ignored for tables.
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

impl ListingConfig {
    /// Read the dataset and derive its bulletin.
    pub fn load(&self) -> Result<PublishedBulletin> {
        if self.sub_modes.is_empty() {
            bail!("listing {} offers no sub-mode", self.path.display());
        }
        let data = std::fs::read(&self.path)
            .with_context(|| format!("failed to read dataset {}", self.path.display()))?;
        let chunk = self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        let bulletin = KeystreamEngine::bulletin(&data, self.mode, chunk)
            .with_context(|| format!("failed to build bulletin for {}", self.path.display()))?;
        Ok(PublishedBulletin {
            bulletin,
            mode: self.mode,
            sub_modes: self.sub_modes.clone(),
            price: self.unit_price,
            data_path: self.path.clone(),
        })
    }
}

impl NodeConfig {
    /// Load `path`, or the defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write config {}", path.display()))
    }

    pub fn key_path(&self) -> PathBuf {
        self.key_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(KEY_FILE))
    }

    pub fn wallet(&self) -> Result<LocalWallet> {
        if let Some(hex) = &self.key_hex {
            return Ok(wallet_from_hex(hex)?);
        }
        let path = self.key_path();
        load_wallet(&path).with_context(|| format!("no usable key at {}", path.display()))
    }

    /// Catalog of every configured listing.
    pub fn catalog(&self) -> Result<BulletinCatalog> {
        let catalog = BulletinCatalog::new();
        for listing in &self.bulletins {
            catalog.insert(listing.load()?);
        }
        Ok(catalog)
    }
}
