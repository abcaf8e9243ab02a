//! # JSON-RPC Ledger
//!
//! [`EscrowLedger`] over an Ethereum JSON-RPC endpoint. Calls go through
//! an `ethers` [`Contract`] built from the exchange contract's
//! human-readable ABI and signed by the node wallet.
//!
//! A transaction counts as sent once it is mined; a receipt with status 0
//! is reported as [`LedgerError::Reverted`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::{parse_abi, Detokenize, Tokenize};
use ethers::contract::{Contract, ContractError};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use tracing::debug;

use pod_protocol::bulletin::{Bulletin, BulletinStatus};
use pod_protocol::crypto::hash::{parse_bytes32, parse_u256_dec};
use pod_protocol::escrow::{
    BulletinInfo, ComplaintClaim, DepositInfo, EscrowLedger, LedgerError, LedgerResult,
    ProofSubmission, SessionRecord,
};
use pod_protocol::mode::{TopMode, TransactionKind};
use pod_protocol::receipt::{ModeReceipt, Secret};

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

const EXCHANGE_ABI: &[&str] = &[
    "function publish(uint64 size, uint64 s, uint64 n, uint256 sigmaMklRoot, uint256 vrfMetaDigest, uint8 mode) payable",
    "function unPublish(bytes32 bltKey)",
    "function withdrawA(bytes32 bltKey)",
    "function bobDeposit(address to) payable",
    "function bobUnDeposit(address to)",
    "function withdrawB(address to)",
    "function submitProofComplaint(bytes32 seed0, uint256 sid, address b, bytes32 seed2, bytes32 kRoot, uint64 count, uint256 price, uint256 expireAt, bytes sig)",
    "function submitProofAtomicSwap(bytes32 seed0, uint256 sid, address b, bytes32 seed2, uint256 vw, uint64 count, uint256 price, uint256 expireAt, bytes sig)",
    "function submitProofAtomicSwapVC(bytes32 seed0, bytes32 seed0Rand, uint256 sid, address b, uint256 digest, uint256 price, uint256 expireAt, bytes sig)",
    "function submitProofVRF(bytes32 r, uint256 sid, address b, uint256 g0, uint256 g1, uint256 price, uint256 expireAt, bytes sig)",
    "function claimComplaint(address a, uint256 sid, uint64 i, bytes evidence)",
    "function settleComplaintDeal(address a, address b, uint256 sid)",
    "function bulletins(bytes32 bltKey) view returns (address owner, uint64 size, uint64 s, uint64 n, uint256 sigmaMklRoot, uint256 vrfMetaDigest, uint8 mode, uint256 stake, uint8 stat, uint256 unPublishAt)",
    "function bobDeposits(address b, address a) view returns (uint256 value, uint8 stat, uint256 unDepositAt)",
    "function getRecordComplaint(address a, address b, uint256 sid) view returns (uint256 submitAt, bytes32 seed0, uint256 price, uint256 expireAt, bool claimed, bool settled)",
    "function getRecordAtomicSwap(address a, address b, uint256 sid) view returns (uint256 submitAt, bytes32 seed0, uint256 price, uint256 expireAt)",
    "function getRecordAtomicSwapVC(address a, address b, uint256 sid) view returns (uint256 submitAt, bytes32 seed0, bytes32 seed0Rand, uint256 price, uint256 expireAt)",
    "function getRecordVRF(address a, address b, uint256 sid) view returns (uint256 submitAt, bytes32 r, uint256 price, uint256 expireAt)",
];

type BulletinRow = (Address, u64, u64, u64, U256, U256, u8, U256, u8, U256);

fn mode_code(mode: TopMode) -> u8 {
    match mode {
        TopMode::Plain => 0,
        TopMode::Table => 1,
    }
}

fn mode_from_code(code: u8) -> LedgerResult<TopMode> {
    match code {
        0 => Ok(TopMode::Plain),
        1 => Ok(TopMode::Table),
        other => Err(LedgerError::Encoding(format!("unknown bulletin mode {other}"))),
    }
}

fn read_err(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Read(e.to_string())
}

fn encoding(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Encoding(e.to_string())
}

/// Seconds as stored on chain. Values past `u64` are clamped.
fn secs(v: U256) -> u64 {
    if v > U256::from(u64::MAX) {
        u64::MAX
    } else {
        v.as_u64()
    }
}

pub struct RpcLedger {
    contract: Contract<Client>,
    client: Arc<Client>,
    caller: Address,
}

impl RpcLedger {
    pub fn connect(
        rpc_url: &str,
        contract: Address,
        wallet: LocalWallet,
        chain_id: u64,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)?.interval(poll_interval);
        let wallet = wallet.with_chain_id(chain_id);
        let caller = wallet.address();
        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let abi = parse_abi(EXCHANGE_ABI)?;
        Ok(Self {
            contract: Contract::new(contract, abi, Arc::clone(&client)),
            client,
            caller,
        })
    }

    async fn send<T: Tokenize>(&self, method: &str, args: T, value: Option<U256>) -> LedgerResult<H256> {
        let mut call = self
            .contract
            .method::<T, H256>(method, args)
            .map_err(encoding)?;
        if let Some(value) = value {
            call = call.value(value);
        }
        let pending = call.send().await.map_err(send_err)?;
        let tx = pending.tx_hash();
        let receipt = pending
            .await
            .map_err(|e| LedgerError::Send(e.to_string()))?
            .ok_or_else(|| LedgerError::Send(format!("{method}: transaction {tx:?} dropped")))?;
        if receipt.status.map_or(false, |s| s.is_zero()) {
            return Err(LedgerError::Reverted(format!("{method}: transaction {tx:?} reverted")));
        }
        debug!(method, ?tx, block = ?receipt.block_number, "transaction mined");
        Ok(tx)
    }

    async fn view<T: Tokenize, D: Detokenize>(&self, method: &str, args: T) -> LedgerResult<D> {
        self.contract
            .method::<T, D>(method, args)
            .map_err(encoding)?
            .call()
            .await
            .map_err(read_err)
    }
}

fn send_err(e: ContractError<Client>) -> LedgerError {
    if e.is_revert() {
        LedgerError::Reverted(e.to_string())
    } else {
        LedgerError::Send(e.to_string())
    }
}

fn sig_bytes(signature: &[u8]) -> Bytes {
    Bytes::from(signature.to_vec())
}

#[async_trait]
impl EscrowLedger for RpcLedger {
    fn caller(&self) -> Address {
        self.caller
    }

    async fn publish(
        &self,
        bulletin: &Bulletin,
        mode: TopMode,
        vrf_digest: U256,
        stake: U256,
    ) -> LedgerResult<H256> {
        let root = bulletin.root_u256().map_err(encoding)?;
        let args = (bulletin.size, bulletin.s, bulletin.n, root, vrf_digest, mode_code(mode));
        self.send("publish", args, Some(stake)).await
    }

    async fn un_publish(&self, key: H256) -> LedgerResult<H256> {
        self.send("unPublish", key, None).await
    }

    async fn withdraw_a(&self, key: H256) -> LedgerResult<H256> {
        self.send("withdrawA", key, None).await
    }

    async fn bob_deposit(&self, seller: Address, value: U256) -> LedgerResult<H256> {
        self.send("bobDeposit", seller, Some(value)).await
    }

    async fn bob_un_deposit(&self, seller: Address) -> LedgerResult<H256> {
        self.send("bobUnDeposit", seller, None).await
    }

    async fn withdraw_b(&self, seller: Address) -> LedgerResult<H256> {
        self.send("withdrawB", seller, None).await
    }

    async fn submit_proof(&self, proof: &ProofSubmission) -> LedgerResult<H256> {
        let sid = U256::from(proof.session_id);
        let price = U256::from(proof.price);
        let expire = U256::from(proof.expire_at.max(0) as u64);
        let sig = sig_bytes(&proof.signature);
        let seed = proof.secret.seed;
        let method = proof.kind.submit_method();
        match &proof.receipt {
            ModeReceipt::Complaint { seed2, k_root, count } => {
                let args = (
                    seed,
                    sid,
                    proof.buyer,
                    parse_bytes32(seed2).map_err(encoding)?,
                    parse_bytes32(k_root).map_err(encoding)?,
                    *count,
                    price,
                    expire,
                    sig,
                );
                self.send(method, args, None).await
            }
            ModeReceipt::AtomicSwap { seed2, vw, count } => {
                let args = (
                    seed,
                    sid,
                    proof.buyer,
                    parse_bytes32(seed2).map_err(encoding)?,
                    parse_u256_dec(vw).map_err(encoding)?,
                    *count,
                    price,
                    expire,
                    sig,
                );
                self.send(method, args, None).await
            }
            ModeReceipt::AtomicSwapVc { digest } => {
                let rand = proof
                    .secret
                    .rand
                    .ok_or_else(|| LedgerError::Encoding("vc secret without blinding value".into()))?;
                let args = (
                    seed,
                    rand,
                    sid,
                    proof.buyer,
                    parse_u256_dec(digest).map_err(encoding)?,
                    price,
                    expire,
                    sig,
                );
                self.send(method, args, None).await
            }
            ModeReceipt::Vrf { g_exp_r } => {
                let args = (
                    seed,
                    sid,
                    proof.buyer,
                    parse_u256_dec(&g_exp_r[0]).map_err(encoding)?,
                    parse_u256_dec(&g_exp_r[1]).map_err(encoding)?,
                    price,
                    expire,
                    sig,
                );
                self.send(method, args, None).await
            }
        }
    }

    async fn claim_complaint(&self, claim: &ComplaintClaim) -> LedgerResult<H256> {
        let args = (
            claim.seller,
            U256::from(claim.session_id),
            claim.index,
            Bytes::from(claim.evidence.clone()),
        );
        self.send("claimComplaint", args, None).await
    }

    async fn settle_complaint_deal(
        &self,
        seller: Address,
        buyer: Address,
        session_id: u64,
    ) -> LedgerResult<H256> {
        self.send("settleComplaintDeal", (seller, buyer, U256::from(session_id)), None)
            .await
    }

    async fn bulletin(&self, key: H256) -> LedgerResult<Option<BulletinInfo>> {
        let row: BulletinRow = self.view("bulletins", key).await?;
        let (owner, size, s, n, root, vrf_digest, mode, stake, stat, un_publish_at) = row;
        if owner.is_zero() {
            return Ok(None);
        }
        Ok(Some(BulletinInfo {
            owner,
            size,
            s,
            n,
            sigma_mkl_root: root,
            vrf_digest,
            mode: mode_from_code(mode)?,
            stake,
            status: BulletinStatus::from_stat(stat),
            un_publish_at: secs(un_publish_at),
        }))
    }

    async fn bob_deposit_of(&self, buyer: Address, seller: Address) -> LedgerResult<DepositInfo> {
        let (value, stat, un_deposit_at): (U256, u8, U256) =
            self.view("bobDeposits", (buyer, seller)).await?;
        Ok(DepositInfo {
            value,
            stat,
            un_deposit_at: secs(un_deposit_at),
        })
    }

    async fn session_record(
        &self,
        kind: &TransactionKind,
        seller: Address,
        buyer: Address,
        session_id: u64,
    ) -> LedgerResult<SessionRecord> {
        let args = (seller, buyer, U256::from(session_id));
        let method = kind.record_query();
        let record = match kind {
            TransactionKind::Complaint { .. } => {
                let (submit_at, seed, price, expire_at, claimed, settled): (U256, H256, U256, U256, bool, bool) =
                    self.view(method, args).await?;
                SessionRecord {
                    submit_at: secs(submit_at),
                    secret: Some(Secret::new(seed)),
                    price,
                    expire_at: secs(expire_at),
                    claimed,
                    settled,
                }
            }
            TransactionKind::AtomicSwap { .. } => {
                let (submit_at, seed, price, expire_at): (U256, H256, U256, U256) =
                    self.view(method, args).await?;
                SessionRecord {
                    submit_at: secs(submit_at),
                    secret: Some(Secret::new(seed)),
                    price,
                    expire_at: secs(expire_at),
                    ..SessionRecord::default()
                }
            }
            TransactionKind::AtomicSwapVc { .. } => {
                let (submit_at, seed, rand, price, expire_at): (U256, H256, H256, U256, U256) =
                    self.view(method, args).await?;
                SessionRecord {
                    submit_at: secs(submit_at),
                    secret: Some(Secret::with_rand(seed, rand)),
                    price,
                    expire_at: secs(expire_at),
                    ..SessionRecord::default()
                }
            }
            TransactionKind::VrfQuery { .. } => {
                let (submit_at, r, price, expire_at): (U256, H256, U256, U256) =
                    self.view(method, args).await?;
                SessionRecord {
                    submit_at: secs(submit_at),
                    secret: Some(Secret::new(r)),
                    price,
                    expire_at: secs(expire_at),
                    ..SessionRecord::default()
                }
            }
        };
        // Nothing submitted yet: the zero seed is not a secret.
        if record.submit_at == 0 {
            return Ok(SessionRecord {
                secret: None,
                ..record
            });
        }
        Ok(record)
    }

    async fn balance(&self, who: Address) -> LedgerResult<U256> {
        self.client.get_balance(who, None).await.map_err(read_err)
    }
}
