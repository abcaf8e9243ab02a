//! End-to-end tests for PoD sessions.
//!
//! A seller and a buyer run over an in-memory duplex channel and settle
//! through the exchange contract model on a shared devnet. These tests
//! prove the pieces compose: establishment, negotiation, the engine's
//! request/response/receipt exchange, proof submission, secret polling,
//! decryption and the complaint dispute.
//!
//! Each test has its own temp directory, record stores and devnet.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use tokio::io::duplex;

use pod_contracts::{Devnet, Flow};
use pod_protocol::bulletin::{BulletinCatalog, PublishedBulletin};
use pod_protocol::buyer::{Buyer, PurchaseRequest, Settlement};
use pod_protocol::config::RetryPolicy;
use pod_protocol::engine::KeystreamEngine;
use pod_protocol::escrow::Escrow;
use pod_protocol::seller::Seller;
use pod_protocol::transaction::{ItemRange, RecordStore, Role, TxStatus};
use pod_protocol::{PodError, SubMode, TopMode};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct Market {
    _dir: tempfile::TempDir,
    devnet: Devnet,
    seller: Arc<Seller>,
    buyer: Buyer,
    seller_addr: Address,
}

fn plain_data() -> Vec<u8> {
    (0..1000u32).map(|i| (i * 13 % 251) as u8).collect()
}

fn listing(dir: &tempfile::TempDir, data: &[u8], mode: TopMode, chunk: u64, sub_modes: Vec<SubMode>, price: u64) -> PublishedBulletin {
    let bulletin = KeystreamEngine::bulletin(data, mode, chunk).unwrap();
    let path = dir.path().join(format!("{}.dat", &bulletin.sigma_mkl_root[..16]));
    std::fs::write(&path, data).unwrap();
    PublishedBulletin {
        bulletin,
        mode,
        sub_modes,
        price,
        data_path: path,
    }
}

/// Seller serving `listings` with `engine`, and a buyer holding `deposit`
/// towards it.
async fn market(listings: Vec<PublishedBulletin>, engine: KeystreamEngine, deposit: u64, dir: tempfile::TempDir) -> Market {
    let devnet = Devnet::new();
    let seller_addr = Address::repeat_byte(0x5e);
    let wallet = LocalWallet::new(&mut rand::thread_rng());

    let catalog = Arc::new(BulletinCatalog::new());
    for entry in listings {
        catalog.insert(entry);
    }
    let seller = Seller::new(
        Escrow::new(Arc::new(devnet.ledger(seller_addr))),
        RecordStore::open_temporary().unwrap(),
        Arc::new(engine),
        dir.path(),
    )
    .unwrap()
    .with_catalog(catalog);

    let buyer_escrow = Escrow::new(Arc::new(devnet.ledger(wallet.address())));
    if deposit > 0 {
        buyer_escrow
            .deposit_buyer_stake(U256::from(deposit), seller_addr)
            .await
            .unwrap();
    }
    let buyer = Buyer::new(
        buyer_escrow,
        RecordStore::open_temporary().unwrap(),
        Arc::new(KeystreamEngine::new()),
        wallet,
        dir.path(),
    )
    .with_policy(RetryPolicy::fixed(40, Duration::from_millis(25)));

    Market {
        _dir: dir,
        devnet,
        seller: Arc::new(seller),
        buyer,
        seller_addr,
    }
}

fn request(listing: &PublishedBulletin, sub_mode: Option<SubMode>, max_unit_price: u64) -> PurchaseRequest {
    PurchaseRequest {
        bulletin: listing.bulletin.clone(),
        mode: listing.mode,
        sub_mode,
        ot: false,
        max_unit_price,
        demands: vec![],
        phantoms: vec![],
        key_name: None,
        key_values: vec![],
    }
}

fn output_of(settlement: &Settlement) -> PathBuf {
    match settlement {
        Settlement::Delivered { output, .. } => output.clone(),
        other => panic!("expected delivery, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Complaint flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn complaint_purchase_delivers_and_seller_reconciles() {
    let dir = tempfile::tempdir().unwrap();
    let data = plain_data();
    let entry = listing(&dir, &data, TopMode::Plain, 100, vec![SubMode::Batch1], 100);
    let m = market(vec![entry.clone()], KeystreamEngine::new(), 1_500, dir).await;

    let mut req = request(&entry, None, 120);
    req.demands = vec![ItemRange::new(0, 10)];

    let (a, b) = duplex(1 << 20);
    let seller = Arc::clone(&m.seller);
    let serving = tokio::spawn(async move { seller.serve(b).await });
    let outcome = m.buyer.purchase(a, &req).await.unwrap();
    let sold = serving.await.unwrap().unwrap();

    assert_eq!(sold.status, TxStatus::Claimed);
    assert_eq!(sold.session_id, "1");
    assert_eq!(sold.price, Some(1_000));
    assert_eq!(outcome.record.status, TxStatus::Closed);
    assert_eq!(std::fs::read(output_of(&outcome.settlement)).unwrap(), data);

    // Price left the deposit and is held until the deal settles.
    let buyer = m.buyer.address();
    assert_eq!(
        m.devnet.inspect(|ex| ex.bob_deposit_of(buyer, m.seller_addr)).value,
        U256::from(500)
    );
    assert_eq!(m.seller.reconcile_all().await.unwrap(), 1);
    let closed = m.seller.store().require(Role::Seller, "1").unwrap();
    assert_eq!(closed.status, TxStatus::Closed);
    assert_eq!(m.devnet.inspect(|ex| ex.balance(m.seller_addr)), U256::from(1_000));
    assert!(m.seller.registry().is_empty());
    assert!(m.buyer.registry().is_empty());
}

#[tokio::test]
async fn corrupted_item_is_disputed_and_refunded() {
    let dir = tempfile::tempdir().unwrap();
    let entry = listing(&dir, &plain_data(), TopMode::Plain, 100, vec![SubMode::Complaint], 10);
    let m = market(vec![entry.clone()], KeystreamEngine::with_corruption(4), 100, dir).await;

    let mut req = request(&entry, Some(SubMode::Complaint), 10);
    req.demands = vec![ItemRange::new(0, 10)];

    let (a, b) = duplex(1 << 20);
    let seller = Arc::clone(&m.seller);
    let serving = tokio::spawn(async move { seller.serve(b).await });
    let outcome = m.buyer.purchase(a, &req).await.unwrap();
    serving.await.unwrap().unwrap();

    assert_eq!(outcome.settlement, Settlement::Disputed { index: 4 });
    assert_eq!(outcome.record.status, TxStatus::Closed);
    let buyer = m.buyer.address();
    let chain = m.devnet.inspect(|ex| ex.record(Flow::Complaint, m.seller_addr, buyer, 1));
    assert!(chain.claimed && chain.settled);
    assert_eq!(m.devnet.inspect(|ex| ex.balance(buyer)), U256::from(100));

    // Already settled by the buyer; the seller only closes its record.
    let closed = m.seller.reconcile("1").await.unwrap();
    assert_eq!(closed.status, TxStatus::Closed);
    assert_eq!(m.devnet.inspect(|ex| ex.balance(m.seller_addr)), U256::zero());
}

// ---------------------------------------------------------------------------
// Other flows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn vrf_query_with_oblivious_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let table = b"alice,1\nbob,2\ncarol,3\nbob,4\ndave,5\n";
    let entry = listing(&dir, table, TopMode::Table, 0, vec![SubMode::Vrf], 7);
    let m = market(vec![entry.clone()], KeystreamEngine::new(), 50, dir).await;

    let mut req = request(&entry, Some(SubMode::Vrf), 7);
    req.ot = true;
    req.key_name = Some("name".into());
    req.key_values = vec!["bob".into()];

    let (a, b) = duplex(1 << 20);
    let seller = Arc::clone(&m.seller);
    let serving = tokio::spawn(async move { seller.serve(b).await });
    let outcome = m.buyer.purchase(a, &req).await.unwrap();
    let sold = serving.await.unwrap().unwrap();

    assert_eq!(sold.status, TxStatus::Claimed);
    assert_eq!(sold.price, Some(7));
    assert_eq!(
        std::fs::read(output_of(&outcome.settlement)).unwrap(),
        b"bob,2\nbob,4\n"
    );
    // Non-complaint flows pay the seller on submission.
    assert_eq!(m.devnet.inspect(|ex| ex.balance(m.seller_addr)), U256::from(7));
}

#[tokio::test]
async fn atomic_swap_vc_reveals_blinded_secret() {
    let dir = tempfile::tempdir().unwrap();
    let data = plain_data();
    let entry = listing(
        &dir,
        &data,
        TopMode::Plain,
        250,
        vec![SubMode::Complaint, SubMode::AtomicSwapVc],
        20,
    );
    let m = market(vec![entry.clone()], KeystreamEngine::new(), 40, dir).await;

    let mut req = request(&entry, Some(SubMode::AtomicSwapVc), 20);
    req.demands = vec![ItemRange::new(1, 2)];

    let (a, b) = duplex(1 << 20);
    let seller = Arc::clone(&m.seller);
    let serving = tokio::spawn(async move { seller.serve(b).await });
    let outcome = m.buyer.purchase(a, &req).await.unwrap();
    serving.await.unwrap().unwrap();

    assert_eq!(outcome.record.status, TxStatus::Closed);
    assert_eq!(std::fs::read(output_of(&outcome.settlement)).unwrap(), &data[250..750]);
    let buyer = m.buyer.address();
    let chain = m.devnet.inspect(|ex| ex.record(Flow::AtomicSwapVc, m.seller_addr, buyer, 1));
    assert!(chain.secret.and_then(|s| s.rand).is_some());
    assert_eq!(m.devnet.inspect(|ex| ex.bob_deposit_of(buyer, m.seller_addr)).value, U256::zero());
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_bulletin_is_refused_before_any_record() {
    let dir = tempfile::tempdir().unwrap();
    let entry = listing(&dir, &plain_data(), TopMode::Plain, 100, vec![SubMode::Batch1], 1);
    let other = listing(&dir, b"not listed here", TopMode::Plain, 5, vec![SubMode::Batch1], 1);
    let m = market(vec![entry], KeystreamEngine::new(), 100, dir).await;

    let mut req = request(&other, None, 1);
    req.demands = vec![ItemRange::new(0, 1)];
    let (a, b) = duplex(1 << 20);
    let seller = Arc::clone(&m.seller);
    let serving = tokio::spawn(async move { seller.serve(b).await });

    assert!(m.buyer.purchase(a, &req).await.is_err());
    assert!(matches!(
        serving.await.unwrap(),
        Err(PodError::BulletinNotFound(_))
    ));
    assert_eq!(m.seller.store().count(Role::Seller), 0);
    assert_eq!(m.buyer.store().count(Role::Buyer), 0);
}

#[tokio::test]
async fn missing_deposit_fails_the_request_on_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let entry = listing(&dir, &plain_data(), TopMode::Plain, 100, vec![SubMode::Batch1], 100);
    let m = market(vec![entry.clone()], KeystreamEngine::new(), 0, dir).await;

    let mut req = request(&entry, None, 100);
    req.demands = vec![ItemRange::new(0, 3)];
    let (a, b) = duplex(1 << 20);
    let seller = Arc::clone(&m.seller);
    let serving = tokio::spawn(async move { seller.serve(b).await });

    assert!(m.buyer.purchase(a, &req).await.is_err());
    assert!(matches!(
        serving.await.unwrap(),
        Err(PodError::DepositRejected(_))
    ));
    assert_eq!(
        m.seller.store().require(Role::Seller, "1").unwrap().status,
        TxStatus::RequestFailed
    );
    let buyer_record = m.buyer.store().list(Role::Buyer).unwrap().pop().unwrap();
    assert_eq!(buyer_record.status, TxStatus::ResponseFailed);
}

#[tokio::test]
async fn concurrent_sessions_get_distinct_ids() {
    let dir = tempfile::tempdir().unwrap();
    let data = plain_data();
    let entry = listing(&dir, &data, TopMode::Plain, 100, vec![SubMode::AtomicSwap], 5);
    let m = market(vec![entry.clone()], KeystreamEngine::new(), 1_000, dir).await;
    let buyer = Arc::new(m.buyer);

    let mut tasks = Vec::new();
    for start in 0..3u64 {
        let mut req = request(&entry, None, 5);
        req.demands = vec![ItemRange::new(start * 3, 3)];
        let (a, b) = duplex(1 << 20);
        let seller = Arc::clone(&m.seller);
        let buyer = Arc::clone(&buyer);
        tasks.push(tokio::spawn(async move {
            let (sold, bought) = tokio::join!(seller.serve(b), buyer.purchase(a, &req));
            (sold.unwrap(), bought.unwrap())
        }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        let (sold, bought) = task.await.unwrap();
        assert_eq!(sold.session_id, bought.record.session_id);
        assert_eq!(bought.record.status, TxStatus::Closed);
        ids.push(sold.session_id);
    }
    ids.sort();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(m.devnet.inspect(|ex| ex.balance(m.seller_addr)), U256::from(45));
}
