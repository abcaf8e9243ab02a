//! # Session Establishment
//!
//! ```text
//! buyer                                   seller
//!   │ SessionRequest{0, root, extra} ──────▶ │  look up bulletin, pick sub-mode,
//!   │                                        │  encode mode, assign id
//!   │ ◀────── SessionAck{id, code, root, extra}
//!   │ SessionAck{id, code, ...} (echo) ────▶ │  echo must match exactly
//!   ▼ established                            ▼ established
//! ```
//!
//! Either side aborts on the first failure; there is no retry at this
//! layer. A retry is a new connection.

use std::str::FromStr;

use ethers::types::Address;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::bulletin::{normalize_root, BulletinCatalog, PublishedBulletin};
use crate::error::{ErrorKind, PodError, PodResult};
use crate::mode::{self, ModeDescriptor, SubMode, TopMode, TransactionKind};
use crate::registry::SessionRegistry;
use crate::transaction::{Role, TxStatus};
use crate::wire::{ExtraInfo, SessionAck, WireSession};

/// What both sides agreed on during establishment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionParams {
    pub session_id: u64,
    pub descriptor: ModeDescriptor,
    pub mode_code: u8,
    pub kind: TransactionKind,
    /// Normalized Merkle root of the bulletin.
    pub sigma_mkl_root: String,
    /// Unit price in wei the seller acked.
    pub unit_price: u64,
    /// Counterparty chain address sent in the extra info.
    pub peer: Option<Address>,
}

/// Buyer's opening terms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Offer {
    pub sigma_mkl_root: String,
    pub mode: TopMode,
    /// Preferred flow. The seller's default is used when `None`.
    pub sub_mode: Option<SubMode>,
    pub ot: bool,
    /// Highest unit price the buyer accepts.
    pub price: u64,
    pub buyer: Address,
}

fn parse_peer(addr: Option<&str>) -> PodResult<Option<Address>> {
    addr.map(|a| {
        Address::from_str(a)
            .map_err(|_| PodError::ProtocolViolation(format!("invalid peer address {a:?}")))
    })
    .transpose()
}

/// Refuse an offer no registry entry can satisfy. With no sub-mode hint
/// the seller picks the flow, so only `(mode, ot)` has to exist.
fn check_offer_mode(offer: &Offer) -> PodResult<()> {
    match offer.sub_mode {
        Some(sub) => {
            mode::encode(ModeDescriptor::new(offer.mode, sub, offer.ot))?;
        }
        None => {
            let reachable = mode::REGISTRY
                .iter()
                .any(|(_, d)| d.mode == offer.mode && d.ot == offer.ot);
            if !reachable {
                return Err(mode::ModeError::InvalidCombination(ModeDescriptor::new(
                    offer.mode,
                    SubMode::Batch1,
                    offer.ot,
                ))
                .into());
            }
        }
    }
    Ok(())
}

/// Open a session as the buyer.
pub async fn establish<S>(wire: &mut WireSession<S>, offer: &Offer) -> PodResult<SessionParams>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    check_offer_mode(offer)?;
    let price = i64::try_from(offer.price)
        .map_err(|_| PodError::ProtocolViolation("offered price out of range".into()))?;
    let extra = ExtraInfo {
        price,
        mode: offer.mode.to_string(),
        sub_mode: offer.sub_mode.map(|s| s.to_string()),
        ot: offer.ot,
        addr: Some(address_string(offer.buyer)),
    };
    wire.send_new_session_request(0, &offer.sigma_mkl_root, &extra)
        .await?;
    let (ack, n) = wire.recv_session_ack(None).await?;
    debug!(session = %format!("{:x}", ack.id), code = ack.mode_code, bytes = n, "session ack received");

    if normalize_root(&ack.sigma_mkl_root) != normalize_root(&offer.sigma_mkl_root) {
        return Err(PodError::ProtocolViolation(format!(
            "ack names bulletin {} instead of {}",
            ack.sigma_mkl_root, offer.sigma_mkl_root
        )));
    }
    let descriptor = mode::decode(ack.mode_code)?;
    if descriptor.mode != offer.mode || descriptor.ot != offer.ot {
        return Err(PodError::ProtocolViolation(format!(
            "seller acked {descriptor} for a {} offer",
            offer.mode
        )));
    }
    if let Some(sub) = offer.sub_mode {
        if descriptor.sub_mode != sub {
            return Err(PodError::ProtocolViolation(format!(
                "seller acked {} instead of {sub}",
                descriptor.sub_mode
            )));
        }
    }
    let kind = TransactionKind::try_from(descriptor)?;
    let unit_price = u64::try_from(ack.extra.price)
        .map_err(|_| PodError::ProtocolViolation(format!("negative price {}", ack.extra.price)))?;
    if unit_price > offer.price {
        return Err(PodError::ProtocolViolation(format!(
            "seller asks {unit_price} per item, offer was {}",
            offer.price
        )));
    }
    let peer = parse_peer(ack.extra.addr.as_deref())?;

    wire.send_session_ack(&ack).await?;
    info!(
        session = %format!("{:x}", ack.id),
        mode = %descriptor,
        kind = kind.label(),
        unit_price,
        "session established"
    );
    Ok(SessionParams {
        session_id: ack.id,
        descriptor,
        mode_code: ack.mode_code,
        kind,
        sigma_mkl_root: normalize_root(&ack.sigma_mkl_root),
        unit_price,
        peer,
    })
}

/// Accept a session as the seller. Returns the agreed parameters and the
/// catalog entry being sold.
pub async fn accept<S>(
    wire: &mut WireSession<S>,
    catalog: &BulletinCatalog,
    registry: &SessionRegistry,
    seller: Address,
) -> PodResult<(SessionParams, PublishedBulletin)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (request, n) = wire.recv_session_request().await?;
    debug!(root = %request.sigma_mkl_root, bytes = n, "session request received");

    let published = catalog
        .get(&request.sigma_mkl_root)
        .ok_or_else(|| PodError::BulletinNotFound(request.sigma_mkl_root.clone()))?;
    let mode = TopMode::from_str(&request.extra.mode)?;
    if mode != published.mode {
        return Err(PodError::ProtocolViolation(format!(
            "bulletin is {}, buyer asked for {mode}",
            published.mode
        )));
    }
    let hint = request
        .extra
        .sub_mode
        .as_deref()
        .map(SubMode::from_str)
        .transpose()?;
    let sub_mode = published.select_sub_mode(hint).ok_or_else(|| {
        PodError::ProtocolViolation(format!(
            "sub-mode {} is not offered for this bulletin",
            request.extra.sub_mode.as_deref().unwrap_or("-")
        ))
    })?;
    let descriptor = ModeDescriptor::new(mode, sub_mode, request.extra.ot);
    let mode_code = mode::encode(descriptor)?;
    let kind = TransactionKind::try_from(descriptor)?;
    if request.extra.price < 0 || (request.extra.price as u64) < published.price {
        return Err(PodError::ProtocolViolation(format!(
            "offered price {} is below the listed {}",
            request.extra.price, published.price
        )));
    }
    let peer = parse_peer(request.extra.addr.as_deref())?;
    let listed = i64::try_from(published.price)
        .map_err(|_| PodError::ProtocolViolation("listed price out of range".into()))?;

    let session_id = registry.allocate_id();
    let ack = SessionAck {
        id: session_id,
        mode_code,
        sigma_mkl_root: published.bulletin.sigma_mkl_root.clone(),
        extra: ExtraInfo {
            price: listed,
            mode: mode.to_string(),
            sub_mode: Some(sub_mode.to_string()),
            ot: descriptor.ot,
            addr: Some(address_string(seller)),
        },
    };
    wire.send_session_ack(&ack).await?;
    if let Err(e) = wire.recv_session_ack(Some((session_id, mode_code))).await {
        warn!(session = %format!("{session_id:x}"), error = %e, "session ack echo rejected");
        return Err(e.into());
    }
    info!(
        session = %format!("{session_id:x}"),
        mode = %descriptor,
        kind = kind.label(),
        "session accepted"
    );
    Ok((
        SessionParams {
            session_id,
            descriptor,
            mode_code,
            kind,
            sigma_mkl_root: normalize_root(&published.bulletin.sigma_mkl_root),
            unit_price: published.price,
            peer,
        },
        published,
    ))
}

// ---------------------------------------------------------------------------
// Driver plumbing
// ---------------------------------------------------------------------------

/// A driver step that failed, with the status the record ends in.
#[derive(Debug)]
pub(crate) struct Failed {
    pub status: TxStatus,
    pub error: PodError,
}

pub(crate) trait FailAt<T> {
    /// Tag an error with the failure status of the step that produced it.
    fn fail_at(self, status: TxStatus) -> Result<T, Failed>;
}

impl<T, E: Into<PodError>> FailAt<T> for Result<T, E> {
    fn fail_at(self, status: TxStatus) -> Result<T, Failed> {
        self.map_err(|e| Failed {
            status,
            error: e.into(),
        })
    }
}

/// Log a failed session at the level its error kind calls for.
pub(crate) fn log_failure(role: Role, session: &str, status: TxStatus, err: &PodError) {
    match err.kind() {
        ErrorKind::ProtocolViolation | ErrorKind::SignatureInvalid | ErrorKind::Verification => {
            warn!(%role, session, %status, kind = ?err.kind(), error = %err, "session aborted")
        }
        _ => error!(%role, session, %status, kind = ?err.kind(), error = %err, "session failed"),
    }
}

pub(crate) fn address_string(addr: Address) -> String {
    format!("{addr:?}")
}
