//! # Buyer Driver
//!
//! One purchase per call. The wire part runs establishment, optional
//! negotiation, request, response and receipt; the channel is then closed
//! and the rest happens against the chain:
//!
//! ```text
//! establish ─▶ [nego] ─▶ request ─▶ response ─▶ receipt ─▶ poll secret
//!   ─▶ gotSecret ─▶ decrypt ─▶ closed
//!                      └─ bad item (complaint) ─▶ claim ─▶ settle ─▶ closed
//! ```
//!
//! If the secret does not show up within the retry policy the record
//! stays `receipted` and [`Buyer::resume`] can pick it up later.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::bulletin::Bulletin;
use crate::config::{RetryPolicy, RECEIPT_TTL};
use crate::engine::{BuyerEngine, BuyerSession, Delivery, SessionContext};
use crate::error::{PodError, PodResult};
use crate::escrow::{poll_secret, ComplaintClaim, Escrow, SecretOutcome};
use crate::mode::{SubMode, TopMode};
use crate::receipt::ReceiptEnvelope;
use crate::registry::{ActiveSession, SessionGuard, SessionRegistry};
use crate::session::{address_string, establish, log_failure, FailAt, Failed, Offer};
use crate::transaction::store::buyer_key;
use crate::transaction::{ItemRange, RecordPayload, RecordStore, Role, TransactionRecord, TxStatus};
use crate::wire::WireSession;

/// What the buyer wants from a bulletin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub bulletin: Bulletin,
    pub mode: TopMode,
    #[serde(default)]
    pub sub_mode: Option<SubMode>,
    #[serde(default)]
    pub ot: bool,
    /// Highest unit price accepted, in wei.
    pub max_unit_price: u64,
    #[serde(default)]
    pub demands: Vec<ItemRange>,
    #[serde(default)]
    pub phantoms: Vec<ItemRange>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub key_values: Vec<String>,
}

impl PurchaseRequest {
    fn payload(&self) -> RecordPayload {
        RecordPayload {
            demands: self.demands.clone(),
            phantoms: self.phantoms.clone(),
            key_name: self.key_name.clone(),
            key_values: self.key_values.clone(),
        }
    }
}

/// How a purchase ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Every item verified; plaintext written to `output`.
    Delivered { output: PathBuf, items: u64 },
    /// No secret on chain yet. The receipt is still valid.
    Pending { attempts: u32 },
    /// An item failed verification and was disputed on chain.
    Disputed { index: u64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct PurchaseOutcome {
    pub record: TransactionRecord,
    pub settlement: Settlement,
}

pub struct Buyer {
    escrow: Escrow,
    store: RecordStore,
    engine: Arc<dyn BuyerEngine>,
    registry: Arc<SessionRegistry>,
    wallet: LocalWallet,
    policy: RetryPolicy,
    receipt_ttl: i64,
    data_dir: PathBuf,
}

impl Buyer {
    pub fn new(
        escrow: Escrow,
        store: RecordStore,
        engine: Arc<dyn BuyerEngine>,
        wallet: LocalWallet,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            escrow,
            store,
            engine,
            registry: SessionRegistry::new(1),
            wallet,
            policy: RetryPolicy::default(),
            receipt_ttl: RECEIPT_TTL.as_secs() as i64,
            data_dir: data_dir.into(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn session_dir(&self, record: &TransactionRecord) -> PathBuf {
        self.data_dir
            .join("buyer")
            .join(&record.seller)
            .join(&record.session_id)
    }

    fn context(&self, record: &TransactionRecord, seller: Address) -> PodResult<SessionContext> {
        Ok(SessionContext {
            session_id: session_number(record)?,
            kind: record.kind,
            bulletin: record.bulletin.clone(),
            seller,
            buyer: self.address(),
        })
    }

    fn guard(&self, record: &TransactionRecord) -> SessionGuard {
        self.registry.register(ActiveSession {
            role: Role::Buyer,
            key: buyer_key(&record.seller, &record.session_id),
            kind: record.kind,
            peer: record.seller.clone(),
            started_at: Utc::now(),
        })
    }

    fn step(&self, record: &mut TransactionRecord, next: TxStatus) -> Result<(), Failed> {
        record.advance(next).fail_at(TxStatus::Error)?;
        self.store.put(record).fail_at(TxStatus::Error)
    }

    fn conclude(
        &self,
        mut record: TransactionRecord,
        result: Result<Settlement, Failed>,
    ) -> PodResult<PurchaseOutcome> {
        match result {
            Ok(settlement) => Ok(PurchaseOutcome { record, settlement }),
            Err(Failed { status, error }) => {
                log_failure(Role::Buyer, &record.session_id, status, &error);
                record.fail(status, &error);
                if let Err(e) = self.store.put(&record) {
                    warn!(session = %record.session_id, error = %e, "could not persist failed record");
                }
                Err(error)
            }
        }
    }

    /// Buy from the seller at the other end of `stream`.
    pub async fn purchase<S>(&self, stream: S, request: &PurchaseRequest) -> PodResult<PurchaseOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut wire = WireSession::new(stream);
        let offer = Offer {
            sigma_mkl_root: request.bulletin.sigma_mkl_root.clone(),
            mode: request.mode,
            sub_mode: request.sub_mode,
            ot: request.ot,
            price: request.max_unit_price,
            buyer: self.address(),
        };
        let params = match establish(&mut wire, &offer).await {
            Ok(p) => p,
            Err(e) => {
                log_failure(Role::Buyer, "-", TxStatus::Start, &e);
                let _ = wire.close().await;
                return Err(e);
            }
        };
        let Some(seller) = params.peer else {
            let _ = wire.close().await;
            return Err(PodError::ProtocolViolation(
                "seller did not announce its address".into(),
            ));
        };

        let mut record = TransactionRecord::new(
            params.session_id,
            Role::Buyer,
            params.kind,
            params.descriptor,
            params.mode_code,
            request.bulletin.clone(),
            address_string(seller),
            address_string(self.address()),
            params.unit_price,
        );
        record.payload = request.payload();
        self.store.put(&record)?;
        let _guard = self.guard(&record);

        let exchanged = self.exchange(&mut wire, &mut record, seller).await;
        let _ = wire.close().await;
        debug!(
            session = %record.session_id,
            sent = wire.bytes_sent(),
            received = wire.bytes_received(),
            "channel closed"
        );
        let result = match exchanged {
            Ok(mut engine) => self.settle(&mut record, engine.as_mut(), seller).await,
            Err(failed) => Err(failed),
        };
        self.conclude(record, result)
    }

    /// Continue a purchase whose secret was not yet on chain.
    pub async fn resume(&self, seller: &str, session_id: &str) -> PodResult<PurchaseOutcome> {
        let key = buyer_key(seller, session_id);
        let mut record = self.store.require(Role::Buyer, &key)?;
        if record.status != TxStatus::Receipted {
            return Err(PodError::ProtocolViolation(format!(
                "session {key} is {}, not waiting for a secret",
                record.status
            )));
        }
        let seller_addr: Address = record.seller.parse().map_err(|_| {
            PodError::ProtocolViolation(format!("bad seller address {}", record.seller))
        })?;
        let _guard = self.guard(&record);
        let ctx = self.context(&record, seller_addr)?;
        let dir = self.session_dir(&record);

        let rebuilt = self
            .engine
            .open(&ctx, &record.payload)
            .and_then(|mut engine| engine.on_response(&dir.join("response")).map(|_| engine));
        let result = match rebuilt {
            Ok(mut engine) => self.settle(&mut record, engine.as_mut(), seller_addr).await,
            Err(e) => Err(Failed {
                status: TxStatus::Error,
                error: e.into(),
            }),
        };
        self.conclude(record, result)
    }

    async fn exchange<S>(
        &self,
        wire: &mut WireSession<S>,
        record: &mut TransactionRecord,
        seller: Address,
    ) -> Result<Box<dyn BuyerSession>, Failed>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let kind = record.kind;
        let ctx = self.context(record, seller).fail_at(TxStatus::Error)?;
        let mut engine = self
            .engine
            .open(&ctx, &record.payload)
            .fail_at(TxStatus::Error)?;
        let dir = self.session_dir(record);
        tokio::fs::create_dir_all(&dir)
            .await
            .fail_at(TxStatus::Error)?;

        if kind.requires_negotiation() {
            self.step(record, TxStatus::Nego)?;
            let request = engine.nego_request().fail_at(TxStatus::NegoFailed)?;
            wire.send_nego_request(request)
                .await
                .fail_at(TxStatus::NegoFailed)?;
            let ((ack, reflected), _) = wire
                .recv_nego_ack_req()
                .await
                .fail_at(TxStatus::NegoFailed)?;
            let answer = engine
                .on_nego_ack_req(&ack, &reflected)
                .fail_at(TxStatus::NegoFailed)?;
            wire.send_nego_ack(answer)
                .await
                .fail_at(TxStatus::NegoFailed)?;
            self.step(record, TxStatus::NegoOk)?;
        }

        let request = dir.join("request");
        let response = dir.join("response");
        engine.request(&request).fail_at(TxStatus::RequestFailed)?;
        let sent = wire
            .send_tx_request(&request)
            .await
            .fail_at(TxStatus::RequestFailed)?;
        self.step(record, TxStatus::Requested)?;

        let received = wire
            .recv_tx_response(&response)
            .await
            .fail_at(TxStatus::ResponseFailed)?;
        let summary = engine
            .on_response(&response)
            .fail_at(TxStatus::ResponseFailed)?;
        self.step(record, TxStatus::Responded)?;
        debug!(session = %record.session_id, sent, received, count = summary.count, "response verified");

        let price = record
            .unit_price
            .checked_mul(summary.count)
            .ok_or_else(|| Failed {
                status: TxStatus::ReceiptFailed,
                error: PodError::ProtocolViolation("price overflow".into()),
            })?;
        let expire_at = Utc::now().timestamp() + self.receipt_ttl;
        let envelope = ReceiptEnvelope::sign(
            &summary.receipt,
            ctx.session_id,
            &self.wallet,
            self.address(),
            price,
            expire_at,
        )
        .fail_at(TxStatus::ReceiptFailed)?;
        wire.send_tx_receipt(&envelope)
            .await
            .fail_at(TxStatus::ReceiptFailed)?;
        let json = serde_json::to_vec_pretty(&envelope)
            .map_err(std::io::Error::from)
            .fail_at(TxStatus::ReceiptFailed)?;
        tokio::fs::write(dir.join("receipt"), json)
            .await
            .fail_at(TxStatus::ReceiptFailed)?;
        record.price = Some(price);
        record.expire_at = Some(expire_at);
        self.step(record, TxStatus::Receipted)?;
        info!(session = %record.session_id, kind = kind.label(), price, expire_at, "receipt sent");
        Ok(engine)
    }

    async fn settle(
        &self,
        record: &mut TransactionRecord,
        engine: &mut dyn BuyerSession,
        seller: Address,
    ) -> Result<Settlement, Failed> {
        let kind = record.kind;
        let sid = session_number(record).fail_at(TxStatus::Error)?;
        let buyer = self.address();
        let dir = self.session_dir(record);

        let ledger = self.escrow.ledger().as_ref();
        let secret = match poll_secret(ledger, &kind, seller, buyer, sid, &self.policy).await {
            SecretOutcome::Revealed(secret) => secret,
            SecretOutcome::NotAvailable { attempts } => {
                let expired = record
                    .expire_at
                    .map_or(false, |at| at <= Utc::now().timestamp());
                if expired {
                    return Err(Failed {
                        status: TxStatus::SecretTerminated,
                        error: PodError::PollTimeout { attempts },
                    });
                }
                info!(session = %record.session_id, attempts, "secret not yet revealed");
                return Ok(Settlement::Pending { attempts });
            }
        };
        let json = serde_json::to_vec_pretty(&secret)
            .map_err(std::io::Error::from)
            .fail_at(TxStatus::GotSecretFailed)?;
        tokio::fs::write(dir.join("secret"), json)
            .await
            .fail_at(TxStatus::GotSecretFailed)?;
        self.step(record, TxStatus::GotSecret)?;

        if !engine.on_secret(&secret).fail_at(TxStatus::GotSecretFailed)? {
            return Err(Failed {
                status: TxStatus::VerifyFailed,
                error: PodError::Verification("revealed secret does not open the commitment".into()),
            });
        }

        let output = dir.join("output");
        match engine.decrypt(&output).fail_at(TxStatus::DecryptFailed)? {
            Delivery::Verified { items } => {
                self.step(record, TxStatus::Closed)?;
                info!(session = %record.session_id, items, output = %output.display(), "data delivered");
                Ok(Settlement::Delivered { output, items })
            }
            Delivery::Corrupted { index } if kind.supports_claim() => {
                warn!(session = %record.session_id, index, "item failed verification, claiming");
                let evidence = engine.claim().ok_or_else(|| Failed {
                    status: TxStatus::ClaimFailed,
                    error: PodError::Verification(format!("no evidence for item {index}")),
                })?;
                let claim = ComplaintClaim {
                    seller,
                    session_id: sid,
                    index: evidence.index,
                    evidence: evidence.evidence,
                };
                self.escrow
                    .claim_complaint(&claim)
                    .await
                    .fail_at(TxStatus::ClaimFailed)?;
                self.step(record, TxStatus::Claimed)?;
                self.escrow
                    .settle_complaint_deal(seller, buyer, sid)
                    .await
                    .fail_at(TxStatus::ClaimFailed)?;
                self.step(record, TxStatus::Closed)?;
                Ok(Settlement::Disputed { index })
            }
            Delivery::Corrupted { index } => Err(Failed {
                status: TxStatus::DecryptFailed,
                error: PodError::Verification(format!("item {index} failed verification")),
            }),
        }
    }
}

fn session_number(record: &TransactionRecord) -> PodResult<u64> {
    record
        .session_number()
        .ok_or_else(|| PodError::ProtocolViolation(format!("bad session id {}", record.session_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulletin::{BulletinCatalog, PublishedBulletin};
    use crate::engine::{KeystreamEngine, SellerEngine};
    use crate::escrow::testing::ScriptedLedger;
    use crate::receipt::Secret;
    use crate::session::accept;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    struct Setup {
        dir: tempfile::TempDir,
        published: PublishedBulletin,
        data: Vec<u8>,
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..640u32).map(|i| (i * 31 % 256) as u8).collect();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, &data).unwrap();
        Setup {
            published: PublishedBulletin {
                bulletin: KeystreamEngine::bulletin(&data, TopMode::Plain, 64).unwrap(),
                mode: TopMode::Plain,
                sub_modes: vec![SubMode::Complaint],
                price: 3,
                data_path: path,
            },
            dir,
            data,
        }
    }

    fn request(s: &Setup) -> PurchaseRequest {
        PurchaseRequest {
            bulletin: s.published.bulletin.clone(),
            mode: TopMode::Plain,
            sub_mode: None,
            ot: false,
            max_unit_price: 5,
            demands: vec![ItemRange::new(0, 10)],
            phantoms: vec![],
            key_name: None,
            key_values: vec![],
        }
    }

    /// A seller that answers the exchange and never submits its proof.
    /// Returns the secret it would have revealed.
    async fn silent_seller(stream: DuplexStream, published: PublishedBulletin, dir: PathBuf) -> Secret {
        let mut wire = WireSession::new(stream);
        let catalog = BulletinCatalog::new();
        catalog.insert(published.clone());
        let (params, _) = accept(&mut wire, &catalog, &SessionRegistry::new(9), Address::repeat_byte(0xee))
            .await
            .unwrap();
        let ctx = SessionContext {
            session_id: params.session_id,
            kind: params.kind,
            bulletin: published.bulletin.clone(),
            seller: Address::repeat_byte(0xee),
            buyer: params.peer.unwrap(),
        };
        let mut engine = SellerEngine::open(&KeystreamEngine::new(), &ctx, &published).unwrap();
        wire.recv_tx_request(&dir.join("seller-request")).await.unwrap();
        engine
            .on_request(&dir.join("seller-request"), &dir.join("seller-response"))
            .unwrap();
        wire.send_tx_response(&dir.join("seller-response")).await.unwrap();
        let (envelope, _) = wire.recv_tx_receipt().await.unwrap();
        let receipt = envelope
            .verify(&params.kind, params.session_id, ctx.buyer, 30, Utc::now().timestamp())
            .unwrap();
        engine.on_receipt(&receipt).unwrap()
    }

    fn buyer(s: &Setup, store: RecordStore, ledger: ScriptedLedger, wallet: LocalWallet) -> Buyer {
        Buyer::new(
            Escrow::new(Arc::new(ledger)),
            store,
            Arc::new(KeystreamEngine::new()),
            wallet,
            s.dir.path(),
        )
        .with_policy(RetryPolicy::fixed(3, Duration::from_millis(5)))
    }

    #[tokio::test]
    async fn unrevealed_secret_leaves_session_pending_then_resumes() {
        let s = setup();
        let store = RecordStore::open_temporary().unwrap();
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let (a, b) = duplex(1 << 20);
        let seller = tokio::spawn(silent_seller(b, s.published.clone(), s.dir.path().to_path_buf()));

        let first = buyer(&s, store.clone(), ScriptedLedger::revealing_after(u32::MAX, Default::default()), wallet.clone());
        let outcome = first.purchase(a, &request(&s)).await.unwrap();
        assert_eq!(outcome.settlement, Settlement::Pending { attempts: 3 });
        assert_eq!(outcome.record.status, TxStatus::Receipted);
        assert_eq!(outcome.record.price, Some(30));
        assert_eq!(outcome.record.session_id, "9");
        assert!(first.registry().is_empty());

        let secret = seller.await.unwrap();
        let second = buyer(&s, store.clone(), ScriptedLedger::revealing_after(0, secret.seed), wallet);
        let resumed = second.resume(&outcome.record.seller, "9").await.unwrap();
        assert_eq!(resumed.record.status, TxStatus::Closed);
        let Settlement::Delivered { output, items } = resumed.settlement else {
            panic!("expected delivery");
        };
        assert_eq!(items, 10);
        assert_eq!(std::fs::read(output).unwrap(), s.data);

        let key = buyer_key(&resumed.record.seller, "9");
        assert_eq!(store.require(Role::Buyer, &key).unwrap().status, TxStatus::Closed);
    }

    #[tokio::test]
    async fn wrong_secret_is_a_verify_failure() {
        let s = setup();
        let store = RecordStore::open_temporary().unwrap();
        let (a, b) = duplex(1 << 20);
        let seller = tokio::spawn(silent_seller(b, s.published.clone(), s.dir.path().to_path_buf()));
        let liar = ScriptedLedger::revealing_after(0, ethers::types::H256::repeat_byte(7));
        let client = buyer(&s, store.clone(), liar, LocalWallet::new(&mut rand::thread_rng()));

        let err = client.purchase(a, &request(&s)).await.unwrap_err();
        seller.await.unwrap();
        assert!(matches!(err, PodError::Verification(_)));
        let record = store.list(Role::Buyer).unwrap().pop().unwrap();
        assert_eq!(record.status, TxStatus::VerifyFailed);
    }

    #[tokio::test]
    async fn resuming_an_unknown_session_is_a_persistence_error() {
        let s = setup();
        let client = buyer(
            &s,
            RecordStore::open_temporary().unwrap(),
            ScriptedLedger::default(),
            LocalWallet::new(&mut rand::thread_rng()),
        );
        assert!(matches!(
            client.resume("0xee", "1").await,
            Err(PodError::Persistence(_))
        ));
    }

    #[test]
    fn purchase_request_reads_minimal_json() {
        let json = r#"{
            "bulletin": {"size": 10, "s": 5, "n": 2, "sigma_mkl_root": "ab"},
            "mode": "plain",
            "maxUnitPrice": 7,
            "demands": [{"start": 0, "count": 2}]
        }"#;
        let req: PurchaseRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.max_unit_price, 7);
        assert!(!req.ot);
        assert_eq!(req.payload().demands, vec![ItemRange::new(0, 2)]);
    }
}
