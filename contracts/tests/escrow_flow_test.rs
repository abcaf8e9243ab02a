//! Integration tests driving the exchange model through the protocol's
//! escrow adapter, the way sellers and buyers use it.
//!
//! Each party gets its own ledger handle on a shared devnet, so caller
//! checks (owner, buyer, party) run as they would on chain.

use std::sync::Arc;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256, U256};

use pod_contracts::{Devnet, Flow};
use pod_protocol::bulletin::{Bulletin, BulletinStatus};
use pod_protocol::escrow::{ComplaintClaim, Escrow, EscrowLedger, SignedReceipt};
use pod_protocol::receipt::{ModeReceipt, ReceiptEnvelope, Secret};
use pod_protocol::{PodError, TopMode, TransactionKind};

const START: u64 = 1_700_000_000;
const COOLDOWN: u64 = 8 * 3600;

struct Parties {
    devnet: Devnet,
    seller: Escrow,
    buyer: Escrow,
    buyer_wallet: LocalWallet,
}

fn parties() -> Parties {
    let devnet = Devnet::with_manual_clock(START);
    let buyer_wallet = LocalWallet::new(&mut rand::thread_rng());
    let seller = Escrow::new(Arc::new(devnet.ledger(Address::repeat_byte(0xa1))));
    let buyer = Escrow::new(Arc::new(devnet.ledger(buyer_wallet.address())));
    Parties {
        devnet,
        seller,
        buyer,
        buyer_wallet,
    }
}

fn signed(p: &Parties, receipt: ModeReceipt, session_id: u64, price: u64) -> SignedReceipt {
    let expire_at = (START + 3600) as i64;
    let env = ReceiptEnvelope::sign(
        &receipt,
        session_id,
        &p.buyer_wallet,
        p.buyer_wallet.address(),
        price,
        expire_at,
    )
    .unwrap();
    SignedReceipt {
        session_id,
        buyer: p.buyer_wallet.address(),
        receipt,
        price,
        expire_at,
        signature: env.receipt_sign,
    }
}

fn complaint_receipt() -> ModeReceipt {
    ModeReceipt::Complaint {
        seed2: format!("{:x}", H256::repeat_byte(0x5e)),
        k_root: format!("{:x}", H256::repeat_byte(0x6b)),
        count: 10,
    }
}

const COMPLAINT: TransactionKind = TransactionKind::Complaint {
    mode: TopMode::Plain,
    ot: false,
};

// ---------------------------------------------------------------------------
// Bulletin lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bulletin_publish_close_and_withdraw() {
    let p = parties();
    let bulletin = Bulletin::new(4096, 64, 64, H256::repeat_byte(0x42));
    let key = bulletin.key().unwrap();

    p.seller
        .publish(&bulletin, TopMode::Plain, U256::zero(), U256::from(1_000))
        .await
        .unwrap();
    assert_eq!(p.seller.read_status(key).await.unwrap(), BulletinStatus::Ok);
    let info = p.buyer.bulletin_info(key).await.unwrap().unwrap();
    assert_eq!(info.owner, p.seller.address());
    assert_eq!(info.sigma_mkl_root, bulletin.root_u256().unwrap());

    // Only the owner may close.
    assert!(matches!(
        p.buyer.close(key).await,
        Err(PodError::ContractCall(_))
    ));
    let (_, ok) = p.seller.close(key).await.unwrap();
    assert!(ok);

    assert!(p.seller.withdraw_publisher_stake(key).await.is_err());
    p.devnet.advance(COOLDOWN);
    p.seller.withdraw_publisher_stake(key).await.unwrap();
    assert_eq!(p.seller.read_status(key).await.unwrap(), BulletinStatus::Canceled);
    assert_eq!(
        p.seller.balance(p.seller.address()).await.unwrap(),
        U256::from(1_000)
    );
}

#[tokio::test]
async fn unknown_bulletin_reads_as_unknown() {
    let p = parties();
    let status = p.buyer.read_status(H256::repeat_byte(9)).await.unwrap();
    assert_eq!(status, BulletinStatus::Unknown);
}

// ---------------------------------------------------------------------------
// Deposits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deposit_withdrawal_waits_for_cooldown() {
    let p = parties();
    let seller = p.seller.address();
    p.buyer
        .deposit_buyer_stake(U256::from(2_000), seller)
        .await
        .unwrap();
    p.buyer.undeposit_buyer_stake(seller).await.unwrap();
    assert_eq!(
        p.seller
            .deposit_of(p.buyer.address(), seller)
            .await
            .unwrap()
            .stat,
        1
    );

    p.devnet.advance(COOLDOWN - 1);
    assert!(p.buyer.withdraw_buyer_stake(seller).await.is_err());
    p.devnet.advance(1);
    let (_, emptied) = p.buyer.withdraw_buyer_stake(seller).await.unwrap();
    assert!(emptied);
    assert_eq!(
        p.buyer.balance(p.buyer.address()).await.unwrap(),
        U256::from(2_000)
    );
}

// ---------------------------------------------------------------------------
// Proofs and complaints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn complaint_proof_settles_to_seller_when_unclaimed() {
    let p = parties();
    let (seller, buyer) = (p.seller.address(), p.buyer.address());
    p.buyer
        .deposit_buyer_stake(U256::from(1_500), seller)
        .await
        .unwrap();

    let secret = Secret::new(H256::repeat_byte(0x77));
    let receipt = signed(&p, complaint_receipt(), 3, 1_000);
    p.seller
        .submit_proof(&COMPLAINT, &receipt, &secret)
        .await
        .unwrap();

    let record = p
        .buyer
        .session_record(&COMPLAINT, seller, buyer, 3)
        .await
        .unwrap();
    assert_eq!(record.submit_at, START);
    assert_eq!(record.secret, Some(secret));
    assert_eq!(record.price, U256::from(1_000));
    assert_eq!(
        p.buyer.deposit_of(buyer, seller).await.unwrap().value,
        U256::from(500)
    );

    p.seller
        .settle_complaint_deal(seller, buyer, 3)
        .await
        .unwrap();
    assert_eq!(p.seller.balance(seller).await.unwrap(), U256::from(1_000));
    assert!(p
        .seller
        .settle_complaint_deal(seller, buyer, 3)
        .await
        .is_err());
}

#[tokio::test]
async fn claimed_complaint_refunds_buyer() {
    let p = parties();
    let (seller, buyer) = (p.seller.address(), p.buyer.address());
    p.buyer
        .deposit_buyer_stake(U256::from(1_000), seller)
        .await
        .unwrap();
    let receipt = signed(&p, complaint_receipt(), 4, 1_000);
    p.seller
        .submit_proof(&COMPLAINT, &receipt, &Secret::new(H256::repeat_byte(1)))
        .await
        .unwrap();

    p.buyer
        .claim_complaint(&ComplaintClaim {
            seller,
            session_id: 4,
            index: 2,
            evidence: vec![0xde, 0xad],
        })
        .await
        .unwrap();
    p.buyer
        .settle_complaint_deal(seller, buyer, 4)
        .await
        .unwrap();

    assert_eq!(p.buyer.balance(buyer).await.unwrap(), U256::from(1_000));
    assert_eq!(p.seller.balance(seller).await.unwrap(), U256::zero());
    let record = p.devnet.inspect(|ex| ex.record(Flow::Complaint, seller, buyer, 4));
    assert!(record.claimed && record.settled);
}

#[tokio::test]
async fn atomic_swap_pays_seller_immediately() {
    let p = parties();
    let (seller, buyer) = (p.seller.address(), p.buyer.address());
    p.buyer
        .deposit_buyer_stake(U256::from(300), seller)
        .await
        .unwrap();
    let kind = TransactionKind::AtomicSwap {
        mode: TopMode::Table,
    };
    let receipt = signed(
        &p,
        ModeReceipt::AtomicSwap {
            seed2: format!("{:x}", H256::repeat_byte(2)),
            vw: "123456789".into(),
            count: 3,
        },
        5,
        300,
    );
    p.seller
        .submit_proof(&kind, &receipt, &Secret::new(H256::repeat_byte(3)))
        .await
        .unwrap();
    assert_eq!(p.seller.balance(seller).await.unwrap(), U256::from(300));
    // A complaint view of the same session sees nothing.
    let other = p
        .seller
        .session_record(&COMPLAINT, seller, buyer, 5)
        .await
        .unwrap();
    assert_eq!(other.submit_at, 0);
}

#[tokio::test]
async fn proof_beyond_deposit_is_reverted() {
    let p = parties();
    let seller = p.seller.address();
    p.buyer
        .deposit_buyer_stake(U256::from(999), seller)
        .await
        .unwrap();
    let receipt = signed(&p, complaint_receipt(), 6, 1_000);
    let err = p
        .seller
        .submit_proof(&COMPLAINT, &receipt, &Secret::new(H256::zero()))
        .await
        .unwrap_err();
    assert!(matches!(err, PodError::ContractCall(_)));
    assert_eq!(
        p.seller
            .deposit_of(p.buyer.address(), seller)
            .await
            .unwrap()
            .value,
        U256::from(999)
    );
}

#[tokio::test]
async fn expired_receipt_is_reverted_on_chain() {
    let p = parties();
    let seller = p.seller.address();
    p.buyer
        .deposit_buyer_stake(U256::from(5_000), seller)
        .await
        .unwrap();
    let receipt = signed(&p, complaint_receipt(), 7, 1_000);
    p.devnet.advance(3600);

    let ledger = p.devnet.ledger(seller);
    let err = ledger
        .submit_proof(&pod_protocol::escrow::ProofSubmission {
            kind: COMPLAINT,
            session_id: receipt.session_id,
            buyer: receipt.buyer,
            receipt: receipt.receipt.clone(),
            secret: Secret::new(H256::zero()),
            price: receipt.price,
            expire_at: receipt.expire_at,
            signature: receipt.signature.clone(),
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("expired"));
}
