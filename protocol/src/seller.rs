//! # Seller Driver
//!
//! Runs one session per inbound connection:
//!
//! ```text
//! accept ─▶ [nego] ─▶ request ─▶ lock deposit ─▶ response ─▶ receipt
//!        ─▶ secret ─▶ submitProof* ─▶ claimed ··· reconcile ─▶ closed
//! ```
//!
//! Every step persists the record before moving on. A failed step leaves
//! the record in that step's failure status and closes the channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use ethers::types::{Address, U256};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::bulletin::{BulletinCatalog, PublishedBulletin};
use crate::engine::{SellerEngine, SessionContext};
use crate::error::{PodError, PodResult};
use crate::escrow::{DepositLocks, Escrow, SignedReceipt};
use crate::registry::{ActiveSession, SessionRegistry};
use crate::session::{self, address_string, log_failure, FailAt, Failed, SessionParams};
use crate::transaction::{RecordStore, Role, TransactionRecord, TxStatus};
use crate::wire::WireSession;

pub struct Seller {
    escrow: Escrow,
    store: RecordStore,
    engine: Arc<dyn SellerEngine>,
    catalog: Arc<BulletinCatalog>,
    registry: Arc<SessionRegistry>,
    locks: Arc<DepositLocks>,
    data_dir: PathBuf,
}

impl Seller {
    /// Seller with an empty catalog. Session ids continue after the
    /// highest id already in `store`.
    pub fn new(
        escrow: Escrow,
        store: RecordStore,
        engine: Arc<dyn SellerEngine>,
        data_dir: impl Into<PathBuf>,
    ) -> PodResult<Self> {
        let registry = SessionRegistry::from_store(&store)?;
        Ok(Self {
            escrow,
            store,
            engine,
            catalog: Arc::new(BulletinCatalog::new()),
            registry,
            locks: DepositLocks::new(),
            data_dir: data_dir.into(),
        })
    }

    pub fn with_catalog(mut self, catalog: Arc<BulletinCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_locks(mut self, locks: Arc<DepositLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn catalog(&self) -> &Arc<BulletinCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn escrow(&self) -> &Escrow {
        &self.escrow
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir.join("seller").join(session_id)
    }

    /// Run one session over `stream`.
    ///
    /// Returns the final record. Failures after establishment are also
    /// recorded in the store before the error is returned.
    pub async fn serve<S>(&self, stream: S) -> PodResult<TransactionRecord>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut wire = WireSession::new(stream);
        let seller = self.escrow.address();
        let accepted = session::accept(&mut wire, &self.catalog, &self.registry, seller).await;
        let (params, published) = match accepted {
            Ok(v) => v,
            Err(e) => {
                log_failure(Role::Seller, "-", TxStatus::Start, &e);
                let _ = wire.close().await;
                return Err(e);
            }
        };
        let Some(buyer) = params.peer else {
            let _ = wire.close().await;
            return Err(PodError::ProtocolViolation(
                "buyer did not announce its address".into(),
            ));
        };

        let mut record = TransactionRecord::new(
            params.session_id,
            Role::Seller,
            params.kind,
            params.descriptor,
            params.mode_code,
            published.bulletin.clone(),
            address_string(seller),
            address_string(buyer),
            params.unit_price,
        );
        self.store.put(&record)?;
        let _guard = self.registry.register(ActiveSession {
            role: Role::Seller,
            key: record.session_id.clone(),
            kind: params.kind,
            peer: record.buyer.clone(),
            started_at: record.created_at,
        });

        let result = self
            .drive(&mut wire, &mut record, &params, &published, buyer)
            .await;
        let _ = wire.close().await;
        debug!(
            session = %record.session_id,
            sent = wire.bytes_sent(),
            received = wire.bytes_received(),
            "channel closed"
        );

        match result {
            Ok(()) => Ok(record),
            Err(Failed { status, error }) => {
                log_failure(Role::Seller, &record.session_id, status, &error);
                record.fail(status, &error);
                if let Err(e) = self.store.put(&record) {
                    warn!(session = %record.session_id, error = %e, "could not persist failed record");
                }
                Err(error)
            }
        }
    }

    fn step(&self, record: &mut TransactionRecord, next: TxStatus) -> Result<(), Failed> {
        record.advance(next).fail_at(TxStatus::Error)?;
        self.store.put(record).fail_at(TxStatus::Error)
    }

    async fn drive<S>(
        &self,
        wire: &mut WireSession<S>,
        record: &mut TransactionRecord,
        params: &SessionParams,
        published: &PublishedBulletin,
        buyer: Address,
    ) -> Result<(), Failed>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let kind = params.kind;
        let seller = self.escrow.address();
        let ctx = SessionContext {
            session_id: params.session_id,
            kind,
            bulletin: published.bulletin.clone(),
            seller,
            buyer,
        };
        let mut engine = self.engine.open(&ctx, published).fail_at(TxStatus::Error)?;
        let dir = self.session_dir(&record.session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .fail_at(TxStatus::Error)?;

        if kind.requires_negotiation() {
            self.step(record, TxStatus::Nego)?;
            let (request, _) = wire.recv_nego_request().await.fail_at(TxStatus::NegoFailed)?;
            let (ack, reflected) = engine
                .on_nego_request(&request)
                .fail_at(TxStatus::NegoFailed)?;
            wire.send_nego_ack_req(ack, reflected)
                .await
                .fail_at(TxStatus::NegoFailed)?;
            let (answer, _) = wire.recv_nego_ack().await.fail_at(TxStatus::NegoFailed)?;
            engine.on_nego_ack(&answer).fail_at(TxStatus::NegoFailed)?;
            self.step(record, TxStatus::NegoOk)?;
        }

        let request = dir.join("request");
        let response = dir.join("response");
        let received = wire
            .recv_tx_request(&request)
            .await
            .fail_at(TxStatus::RequestFailed)?;
        self.step(record, TxStatus::Requested)?;
        let count = engine
            .on_request(&request, &response)
            .fail_at(TxStatus::InvalidRequest)?;
        let price = params.unit_price.checked_mul(count).ok_or_else(|| Failed {
            status: TxStatus::InvalidRequest,
            error: PodError::ProtocolViolation(format!("{count} items overflow the price")),
        })?;
        debug!(session = %record.session_id, bytes = received, count, price, "request accepted");

        let deposit = self
            .escrow
            .deposit_of(buyer, seller)
            .await
            .fail_at(TxStatus::RequestFailed)?;
        let now = Utc::now().timestamp().max(0) as u64;
        let _lease = self
            .locks
            .lock(seller, buyer, &deposit, U256::from(price), now)
            .fail_at(TxStatus::RequestFailed)?;

        let sent = wire
            .send_tx_response(&response)
            .await
            .fail_at(TxStatus::ResponseFailed)?;
        self.step(record, TxStatus::Responded)?;
        debug!(session = %record.session_id, bytes = sent, "response sent");

        let (envelope, _) = wire.recv_tx_receipt().await.fail_at(TxStatus::ReceiptFailed)?;
        let receipt = envelope
            .verify(&kind, params.session_id, buyer, price, Utc::now().timestamp())
            .fail_at(TxStatus::ReceiptFailed)?;
        record.price = Some(price);
        record.expire_at = Some(envelope.expire_at);
        self.step(record, TxStatus::Receipted)?;

        let secret = engine
            .on_receipt(&receipt)
            .fail_at(TxStatus::GenerateSecretFailed)?;
        write_json(&dir.join("receipt"), &envelope)
            .await
            .fail_at(TxStatus::GenerateSecretFailed)?;
        write_json(&dir.join("secret"), &secret)
            .await
            .fail_at(TxStatus::GenerateSecretFailed)?;
        self.step(record, TxStatus::GenerateSecret)?;

        let signed = SignedReceipt {
            session_id: params.session_id,
            buyer,
            receipt,
            price,
            expire_at: envelope.expire_at,
            signature: envelope.receipt_sign.clone(),
        };
        self.escrow
            .submit_proof(&kind, &signed, &secret)
            .await
            .fail_at(TxStatus::ClaimFailed)?;
        self.step(record, TxStatus::Claimed)?;
        info!(session = %record.session_id, kind = kind.label(), price, "secret revealed on chain");
        Ok(())
    }

    /// Close a claimed session once the chain shows it paid out.
    ///
    /// Complaint sessions are settled first unless the buyer already did.
    /// Records in any other status are returned unchanged.
    pub async fn reconcile(&self, session_id: &str) -> PodResult<TransactionRecord> {
        let mut record = self.store.require(Role::Seller, session_id)?;
        if record.status != TxStatus::Claimed {
            return Ok(record);
        }
        let sid = record.session_number().ok_or_else(|| {
            PodError::ProtocolViolation(format!("bad session id {}", record.session_id))
        })?;
        let buyer: Address = record.buyer.parse().map_err(|_| {
            PodError::ProtocolViolation(format!("bad buyer address {}", record.buyer))
        })?;
        let seller = self.escrow.address();
        let chain = self
            .escrow
            .session_record(&record.kind, seller, buyer, sid)
            .await?;
        if chain.submit_at == 0 {
            return Err(PodError::Verification(format!(
                "session {session_id} has no proof on chain"
            )));
        }
        if record.kind.supports_claim() && !chain.settled {
            self.escrow.settle_complaint_deal(seller, buyer, sid).await?;
        }
        record.advance(TxStatus::Closed)?;
        self.store.put(&record)?;
        info!(session = %record.session_id, claimed = chain.claimed, "session closed");
        Ok(record)
    }

    /// Reconcile every claimed session. Returns how many were closed.
    pub async fn reconcile_all(&self) -> PodResult<usize> {
        let mut closed = 0;
        for record in self.store.list(Role::Seller)? {
            if record.status != TxStatus::Claimed {
                continue;
            }
            match self.reconcile(&record.session_id).await {
                Ok(r) if r.status == TxStatus::Closed => closed += 1,
                Ok(_) => {}
                Err(e) => warn!(session = %record.session_id, error = %e, "reconcile failed"),
            }
        }
        Ok(closed)
    }
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(std::io::Error::from)?;
    tokio::fs::write(path, bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulletin::PublishedBulletin;
    use crate::engine::{BuyerEngine, KeystreamEngine};
    use crate::escrow::testing::ScriptedLedger;
    use crate::mode::{SubMode, TopMode};
    use crate::receipt::ReceiptEnvelope;
    use crate::session::{establish, Offer};
    use crate::transaction::{ItemRange, RecordPayload};
    use ethers::signers::{LocalWallet, Signer};
    use tokio::io::duplex;

    struct Setup {
        dir: tempfile::TempDir,
        seller: Arc<Seller>,
        ledger: Arc<ScriptedLedger>,
        published: PublishedBulletin,
    }

    fn setup(deposit: u64) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 7) as u8).collect();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, &data).unwrap();
        let published = PublishedBulletin {
            bulletin: KeystreamEngine::bulletin(&data, TopMode::Plain, 100).unwrap(),
            mode: TopMode::Plain,
            sub_modes: vec![SubMode::Batch1],
            price: 100,
            data_path: path,
        };
        let catalog = Arc::new(BulletinCatalog::new());
        catalog.insert(published.clone());
        let ledger = Arc::new(ScriptedLedger::default().with_deposit(deposit));
        let seller = Seller::new(
            Escrow::new(ledger.clone()),
            RecordStore::open_temporary().unwrap(),
            Arc::new(KeystreamEngine::new()),
            dir.path(),
        )
        .unwrap()
        .with_catalog(catalog);
        Setup {
            dir,
            seller: Arc::new(seller),
            ledger,
            published,
        }
    }

    /// Plays the buyer up to the receipt, signing it with `signer`.
    async fn buyer_until_receipt(
        stream: tokio::io::DuplexStream,
        s: &Setup,
        buyer: &LocalWallet,
        signer: &LocalWallet,
    ) -> PodResult<()> {
        let mut wire = WireSession::new(stream);
        let offer = Offer {
            sigma_mkl_root: s.published.bulletin.sigma_mkl_root.clone(),
            mode: TopMode::Plain,
            sub_mode: None,
            ot: false,
            price: 100,
            buyer: buyer.address(),
        };
        let params = establish(&mut wire, &offer).await?;
        let ctx = SessionContext {
            session_id: params.session_id,
            kind: params.kind,
            bulletin: s.published.bulletin.clone(),
            seller: Address::repeat_byte(0xee),
            buyer: buyer.address(),
        };
        let payload = RecordPayload {
            demands: vec![ItemRange::new(0, 10)],
            ..RecordPayload::default()
        };
        let mut engine = BuyerEngine::open(&KeystreamEngine::new(), &ctx, &payload)?;
        let request = s.dir.path().join("buyer-request");
        let response = s.dir.path().join("buyer-response");
        engine.request(&request)?;
        wire.send_tx_request(&request).await?;
        wire.recv_tx_response(&response).await?;
        let summary = engine.on_response(&response)?;
        let envelope = ReceiptEnvelope::sign(
            &summary.receipt,
            params.session_id,
            signer,
            buyer.address(),
            100 * summary.count,
            Utc::now().timestamp() + 600,
        )?;
        wire.send_tx_receipt(&envelope).await?;
        Ok(())
    }

    #[tokio::test]
    async fn valid_receipt_reaches_claimed() {
        let s = setup(1_000_000);
        let buyer = LocalWallet::new(&mut rand::thread_rng());
        let (a, b) = duplex(1 << 20);
        let seller = Arc::clone(&s.seller);
        let task = tokio::spawn(async move { seller.serve(b).await });
        buyer_until_receipt(a, &s, &buyer, &buyer).await.unwrap();

        let record = task.await.unwrap().unwrap();
        assert_eq!(record.status, TxStatus::Claimed);
        assert_eq!(record.session_id, "1");
        assert_eq!(record.price, Some(1000));
        assert_eq!(s.ledger.submissions(), 1);
        assert!(s.dir.path().join("seller/1/secret").exists());
        assert!(s.seller.registry().is_empty());
    }

    #[tokio::test]
    async fn foreign_signature_fails_receipt_and_submits_nothing() {
        let s = setup(1_000_000);
        let buyer = LocalWallet::new(&mut rand::thread_rng());
        let mallory = LocalWallet::new(&mut rand::thread_rng());
        let (a, b) = duplex(1 << 20);
        let seller = Arc::clone(&s.seller);
        let task = tokio::spawn(async move { seller.serve(b).await });
        let _ = buyer_until_receipt(a, &s, &buyer, &mallory).await;

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::SignatureInvalid);
        let record = s.seller.store().require(Role::Seller, "1").unwrap();
        assert_eq!(record.status, TxStatus::ReceiptFailed);
        assert!(record.error.is_some());
        assert_eq!(s.ledger.submissions(), 0);
    }

    #[tokio::test]
    async fn short_deposit_fails_the_request() {
        let s = setup(999);
        let buyer = LocalWallet::new(&mut rand::thread_rng());
        let (a, b) = duplex(1 << 20);
        let seller = Arc::clone(&s.seller);
        let task = tokio::spawn(async move { seller.serve(b).await });
        assert!(buyer_until_receipt(a, &s, &buyer, &buyer).await.is_err());

        assert!(matches!(
            task.await.unwrap(),
            Err(PodError::DepositRejected(_))
        ));
        let record = s.seller.store().require(Role::Seller, "1").unwrap();
        assert_eq!(record.status, TxStatus::RequestFailed);
    }

    #[tokio::test]
    async fn ids_continue_after_restart() {
        let s = setup(1_000_000);
        let store = s.seller.store().clone();
        let mut record = TransactionRecord::new(
            0x2a,
            Role::Seller,
            crate::TransactionKind::Complaint {
                mode: TopMode::Plain,
                ot: false,
            },
            crate::ModeDescriptor::new(TopMode::Plain, SubMode::Batch1, false),
            0,
            s.published.bulletin.clone(),
            "0x00".into(),
            "0x00".into(),
            1,
        );
        record.advance(TxStatus::Requested).unwrap();
        store.put(&record).unwrap();
        let restarted = Seller::new(
            Escrow::new(s.ledger.clone()),
            store,
            Arc::new(KeystreamEngine::new()),
            s.dir.path(),
        )
        .unwrap();
        assert_eq!(restarted.registry().allocate_id(), 0x2b);
    }
}
