//! # CLI Interface
//!
//! Command-line structure for `pod-node` using `clap` derive. Global flags
//! override the JSON config file, and every flag can also come from a
//! `POD_*` environment variable.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use pod_protocol::TopMode;

/// Pay-on-Delivery data exchange node.
///
/// Sells datasets over PoD sessions (`seller`), buys from other sellers
/// (`buy`), and manages bulletins and deposits on the escrow contract.
#[derive(Parser, Debug)]
#[command(
    name = "pod-node",
    about = "Pay-on-Delivery data exchange node",
    version,
    propagate_version = true
)]
pub struct PodNodeCli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Config file. Defaults to `<data-dir>/config.json`.
    #[arg(long, short = 'c', global = true, env = "POD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory for keys, records and session artefacts.
    #[arg(long, short = 'd', global = true, env = "POD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Hex private key. Overrides the key file.
    #[arg(long, global = true, env = "POD_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Ethereum JSON-RPC endpoint of the escrow chain.
    #[arg(long, global = true, env = "POD_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Escrow contract address.
    #[arg(long, global = true, env = "POD_CONTRACT")]
    pub contract: Option<String>,

    #[arg(long, global = true, env = "POD_CHAIN_ID")]
    pub chain_id: Option<u64>,

    /// Log format: `pretty` or `json`.
    #[arg(long, global = true, env = "POD_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Debug-level logging for the node's crates.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the data directory, a fresh key and a default config.
    Init(InitArgs),
    /// Serve the configured bulletins, the HTTP API and metrics.
    Seller(SellerArgs),
    /// Buy from a seller, or resume an earlier purchase.
    Buy(BuyArgs),
    /// Publish the configured bulletins on the escrow contract.
    Publish(PublishArgs),
    /// Request un-publishing of a bulletin, or withdraw its stake.
    Unpublish(UnpublishArgs),
    /// Print a dataset's bulletin and its escrow key.
    BulletinKey(BulletinKeyArgs),
    /// Manage the buyer deposit held for a seller.
    Deposit(DepositArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Replace an existing key and config.
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct SellerArgs {
    /// Address to accept PoD sessions on.
    #[arg(long, env = "POD_LISTEN")]
    pub listen: Option<SocketAddr>,

    #[arg(long, env = "POD_API_PORT")]
    pub api_port: Option<u16>,

    #[arg(long, env = "POD_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Seconds between passes that close paid sessions.
    #[arg(long, default_value_t = 60)]
    pub reconcile_interval: u64,
}

#[derive(Args, Debug)]
pub struct BuyArgs {
    /// Seller's session endpoint (`host:port`).
    #[arg(long)]
    pub connect: Option<String>,

    /// JSON file holding the purchase request.
    #[arg(long, required_unless_present = "resume")]
    pub request: Option<PathBuf>,

    /// Resume the session `<seller-address>/<session-id>` instead of
    /// opening a new one.
    #[arg(long, conflicts_with_all = ["request", "connect"])]
    pub resume: Option<String>,
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Stake sent with each publication, in wei.
    #[arg(long, default_value_t = 0)]
    pub stake: u64,

    /// VRF public-key digest for table bulletins (hex or decimal).
    #[arg(long)]
    pub vrf_digest: Option<String>,
}

#[derive(Args, Debug)]
pub struct UnpublishArgs {
    /// Merkle root of the bulletin, as listed in the config.
    pub merkle_root: String,

    /// Withdraw the stake of a bulletin whose cooldown has passed.
    #[arg(long)]
    pub withdraw: bool,
}

#[derive(Args, Debug)]
pub struct BulletinKeyArgs {
    /// Dataset file.
    pub path: PathBuf,

    #[arg(long, default_value = "plain")]
    pub mode: TopMode,

    /// Plain-mode chunk size in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    pub chunk_size: u64,
}

#[derive(Args, Debug)]
pub struct DepositArgs {
    #[command(subcommand)]
    pub action: DepositAction,
}

#[derive(Subcommand, Debug)]
pub enum DepositAction {
    /// Add to the deposit held for `seller`.
    Add {
        seller: String,
        /// Amount in wei.
        amount: u64,
    },
    /// Start the withdrawal cooldown.
    Remove { seller: String },
    /// Withdraw after the cooldown.
    Withdraw { seller: String },
    /// Show the deposit and the caller's balance.
    Show { seller: String },
}
