//! Development PoD engine.
//!
//! Items are fixed-size chunks (plain) or CSV lines (table). The seller
//! encrypts each served item with a Keccak keystream keyed by a fresh seed
//! and the item index, and commits to the seed (`S = keccak(seed)`) and to
//! the ciphertexts (`K` = Merkle root over ciphertext leaves). The buyer
//! checks the revealed seed against the commitment and every decrypted
//! item against the bulletin's Merkle root.
//!
//! VRF queries match key values against the first CSV field. The VRF
//! "group element" is `keccak(seed ‖ 0)`, `keccak(seed ‖ 1)` read as
//! integers. Oblivious-transfer sessions serve the phantom ranges and pay
//! for the declared demand count.

use std::collections::BTreeSet;
use std::path::Path;

use ethers::types::{H256, U256};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    BuyerEngine, BuyerSession, ClaimEvidence, Delivery, EngineError, EngineResult,
    ResponseSummary, SellerEngine, SellerSession, SessionContext,
};
use crate::bulletin::{Bulletin, PublishedBulletin};
use crate::crypto::hash::{keccak256, parse_bytes32, parse_u256_dec};
use crate::crypto::merkle::{leaf_hash, MerkleProof, MerkleTree};
use crate::mode::{TopMode, TransactionKind};
use crate::receipt::{ModeReceipt, Secret};
use crate::transaction::{ItemRange, RecordPayload};

/// Keystream engine for both sides.
#[derive(Clone, Debug, Default)]
pub struct KeystreamEngine {
    corrupt: Option<u64>,
}

impl KeystreamEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A seller engine that delivers item `index` with one flipped byte.
    pub fn with_corruption(index: u64) -> Self {
        Self {
            corrupt: Some(index),
        }
    }

    /// Describe `data` as a bulletin. `chunk_size` is only used for plain
    /// data.
    pub fn bulletin(data: &[u8], mode: TopMode, chunk_size: u64) -> EngineResult<Bulletin> {
        let items = split_items(data, mode, chunk_size)?;
        if items.is_empty() {
            return Err(EngineError::Rejected("no items in data".into()));
        }
        let s = match mode {
            TopMode::Plain => chunk_size,
            TopMode::Table => field_count(&items[0]),
        };
        let root = MerkleTree::from_items(items.iter().map(|i| i.as_slice())).root();
        Ok(Bulletin::new(data.len() as u64, s, items.len() as u64, root))
    }
}

/// Cut data into items.
pub fn split_items(data: &[u8], mode: TopMode, chunk_size: u64) -> EngineResult<Vec<Vec<u8>>> {
    match mode {
        TopMode::Plain => {
            if chunk_size == 0 {
                return Err(EngineError::Rejected("chunk size must be positive".into()));
            }
            Ok(data.chunks(chunk_size as usize).map(<[u8]>::to_vec).collect())
        }
        TopMode::Table => Ok(data
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(<[u8]>::to_vec)
            .collect()),
    }
}

fn field_count(line: &[u8]) -> u64 {
    line.iter().filter(|b| **b == b',').count() as u64 + 1
}

fn first_field(line: &[u8]) -> &[u8] {
    let end = line.iter().position(|b| *b == b',').unwrap_or(line.len());
    let field = &line[..end];
    let start = field.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(field.len());
    let stop = field.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &field[start..stop]
}

fn keystream_xor(seed: &H256, index: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for (block, chunk) in data.chunks(32).enumerate() {
        let mut input = [0u8; 48];
        input[..32].copy_from_slice(seed.as_bytes());
        input[32..40].copy_from_slice(&index.to_be_bytes());
        input[40..].copy_from_slice(&(block as u64).to_be_bytes());
        let ks = keccak256(input);
        out.extend(chunk.iter().zip(ks.iter()).map(|(b, k)| b ^ k));
    }
    out
}

fn random_h256() -> H256 {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    H256(bytes)
}

fn hash_pair(a: &H256, b: &H256) -> H256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(a.as_bytes());
    buf[32..].copy_from_slice(b.as_bytes());
    H256(keccak256(buf))
}

fn as_u256(h: &H256) -> U256 {
    U256::from_big_endian(h.as_bytes())
}

fn seed_commitment(seed: &H256) -> H256 {
    H256(keccak256(seed.as_bytes()))
}

fn derive_g(seed: &H256) -> [U256; 2] {
    let point = |tag: u8| {
        let mut buf = [0u8; 33];
        buf[..32].copy_from_slice(seed.as_bytes());
        buf[32] = tag;
        U256::from_big_endian(&keccak256(buf))
    };
    [point(0), point(1)]
}

fn range_indices(ranges: &[ItemRange]) -> BTreeSet<u64> {
    ranges.iter().flat_map(ItemRange::indices).collect()
}

/// Like [`range_indices`], but every range must lie inside `0..n` and the
/// ranges together may not name more than `n` items. Checked before any
/// index is materialized.
fn bounded_indices(ranges: &[ItemRange], n: u64) -> EngineResult<BTreeSet<u64>> {
    let mut total = 0u64;
    for r in ranges {
        let end = r.start.checked_add(r.count).ok_or_else(|| {
            EngineError::Rejected(format!("range {}+{} overflows", r.start, r.count))
        })?;
        if end > n {
            return Err(EngineError::Rejected(format!(
                "items {}..{end} out of range 0..{n}",
                r.start
            )));
        }
        total = total.saturating_add(r.count);
        if total > n {
            return Err(EngineError::Rejected(format!(
                "ranges name more than the {n} available items"
            )));
        }
    }
    Ok(range_indices(ranges))
}

fn nonce_bytes(bytes: &[u8], what: &'static str) -> EngineResult<H256> {
    if bytes.len() != 32 {
        return Err(EngineError::malformed(what, format!("{} bytes", bytes.len())));
    }
    Ok(H256::from_slice(bytes))
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestDoc {
    demands: Vec<ItemRange>,
    phantoms: Vec<ItemRange>,
    key_name: Option<String>,
    key_values: Vec<String>,
    count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CipherItem {
    index: u64,
    cipher: String,
    proof: MerkleProof,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseDoc {
    items: Vec<CipherItem>,
    commitment: H256,
    k_root: H256,
    digest: Option<String>,
    g_exp_r: Option<[String; 2]>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimDoc {
    cipher: String,
    k_proof: MerkleProof,
}

fn cipher_tree(items: &[CipherItem]) -> EngineResult<(MerkleTree, Vec<Vec<u8>>)> {
    let ciphers = items
        .iter()
        .map(|i| hex::decode(&i.cipher).map_err(|e| EngineError::malformed("cipher item", e)))
        .collect::<EngineResult<Vec<_>>>()?;
    let tree = MerkleTree::from_items(ciphers.iter().map(|c| c.as_slice()));
    Ok((tree, ciphers))
}

// ---------------------------------------------------------------------------
// Seller
// ---------------------------------------------------------------------------

struct Sent {
    commitment: H256,
    k_root: H256,
    vw: U256,
    digest: U256,
    g: [U256; 2],
    count: u64,
}

struct KeystreamSeller {
    kind: TransactionKind,
    items: Vec<Vec<u8>>,
    sigma: MerkleTree,
    seed: H256,
    rand: H256,
    nonce: Option<H256>,
    negotiated: bool,
    corrupt: Option<u64>,
    sent: Option<Sent>,
}

impl SellerEngine for KeystreamEngine {
    fn open(
        &self,
        ctx: &SessionContext,
        published: &PublishedBulletin,
    ) -> EngineResult<Box<dyn SellerSession>> {
        let data = std::fs::read(&published.data_path)?;
        let items = split_items(&data, published.mode, published.bulletin.s)?;
        let sigma = MerkleTree::from_items(items.iter().map(|i| i.as_slice()));
        let expected = parse_bytes32(&published.bulletin.sigma_mkl_root)
            .map_err(|e| EngineError::malformed("bulletin root", e))?;
        if sigma.root() != expected {
            return Err(EngineError::Rejected(
                "data does not match the bulletin's merkle root".into(),
            ));
        }
        debug!(session = %format!("{:x}", ctx.session_id), items = items.len(), "seller engine session opened");
        Ok(Box::new(KeystreamSeller {
            kind: ctx.kind,
            items,
            sigma,
            seed: random_h256(),
            rand: random_h256(),
            nonce: None,
            negotiated: false,
            corrupt: self.corrupt,
            sent: None,
        }))
    }
}

impl KeystreamSeller {
    fn served_indices(&self, req: &RequestDoc) -> EngineResult<(BTreeSet<u64>, u64)> {
        if let TransactionKind::VrfQuery { .. } = self.kind {
            if req.key_values.is_empty() {
                return Err(EngineError::Rejected("no key values".into()));
            }
            let mut found = BTreeSet::new();
            for key in &req.key_values {
                let before = found.len();
                found.extend(
                    self.items
                        .iter()
                        .enumerate()
                        .filter(|(_, line)| first_field(line) == key.trim().as_bytes())
                        .map(|(i, _)| i as u64),
                );
                if found.len() == before {
                    return Err(EngineError::Rejected(format!("key {key:?} not found")));
                }
            }
            return Ok((found, req.key_values.len() as u64));
        }

        let ranges = if self.kind.ot() {
            &req.phantoms
        } else {
            &req.demands
        };
        let indices = bounded_indices(ranges, self.items.len() as u64)?;
        if indices.is_empty() {
            return Err(EngineError::Rejected("empty request".into()));
        }
        let count = if self.kind.ot() {
            if req.count == 0 || req.count > indices.len() as u64 {
                return Err(EngineError::Rejected(format!(
                    "declared count {} outside 1..={}",
                    req.count,
                    indices.len()
                )));
            }
            req.count
        } else {
            indices.len() as u64
        };
        Ok((indices, count))
    }
}

impl SellerSession for KeystreamSeller {
    fn on_nego_request(&mut self, request: &[u8]) -> EngineResult<(Vec<u8>, Vec<u8>)> {
        let theirs = nonce_bytes(request, "nego request")?;
        let ours = random_h256();
        self.nonce = Some(ours);
        Ok((
            keccak256(theirs.as_bytes()).to_vec(),
            ours.as_bytes().to_vec(),
        ))
    }

    fn on_nego_ack(&mut self, ack: &[u8]) -> EngineResult<()> {
        let nonce = self
            .nonce
            .ok_or_else(|| EngineError::Rejected("nego ack before nego request".into()))?;
        if ack != keccak256(nonce.as_bytes()).as_slice() {
            return Err(EngineError::Rejected("nego ack does not answer our request".into()));
        }
        self.negotiated = true;
        Ok(())
    }

    fn on_request(&mut self, request: &Path, response: &Path) -> EngineResult<u64> {
        if self.kind.requires_negotiation() && !self.negotiated {
            return Err(EngineError::Rejected(format!(
                "{} requires negotiation before the request",
                self.kind.label()
            )));
        }
        let req: RequestDoc = serde_json::from_slice(&std::fs::read(request)?)
            .map_err(|e| EngineError::malformed("request", e))?;
        let (indices, count) = self.served_indices(&req)?;

        let mut items = Vec::with_capacity(indices.len());
        for index in indices {
            let mut cipher = keystream_xor(&self.seed, index, &self.items[index as usize]);
            if self.corrupt == Some(index) {
                if let Some(b) = cipher.first_mut() {
                    *b ^= 0xff;
                }
            }
            let proof = self
                .sigma
                .proof(index as usize)
                .ok_or_else(|| EngineError::Rejected(format!("no proof for item {index}")))?;
            items.push(CipherItem {
                index,
                cipher: hex::encode(cipher),
                proof,
            });
        }
        let (k_tree, _) = cipher_tree(&items)?;

        let commitment = seed_commitment(&self.seed);
        let k_root = k_tree.root();
        let digest = as_u256(&hash_pair(&self.seed, &self.rand));
        let g = derive_g(&self.seed);
        let doc = ResponseDoc {
            items,
            commitment,
            k_root,
            digest: Some(digest.to_string()),
            g_exp_r: Some([g[0].to_string(), g[1].to_string()]),
        };
        let bytes = serde_json::to_vec(&doc).map_err(|e| EngineError::malformed("response", e))?;
        std::fs::write(response, bytes)?;

        self.sent = Some(Sent {
            commitment,
            k_root,
            vw: as_u256(&hash_pair(&commitment, &k_root)),
            digest,
            g,
            count,
        });
        Ok(count)
    }

    fn on_receipt(&mut self, receipt: &ModeReceipt) -> EngineResult<Secret> {
        let sent = self
            .sent
            .as_ref()
            .ok_or_else(|| EngineError::Rejected("receipt before response".into()))?;
        let bad = |what: &str| EngineError::Rejected(format!("receipt {what} does not match the response"));
        let field = |e| EngineError::malformed("receipt", e);
        match receipt {
            ModeReceipt::Complaint {
                seed2,
                k_root,
                count,
            } => {
                if parse_bytes32(seed2).map_err(field)? != sent.commitment {
                    return Err(bad("seed commitment"));
                }
                if parse_bytes32(k_root).map_err(field)? != sent.k_root {
                    return Err(bad("cipher root"));
                }
                if *count != sent.count {
                    return Err(bad("count"));
                }
            }
            ModeReceipt::AtomicSwap { seed2, vw, count } => {
                if parse_bytes32(seed2).map_err(field)? != sent.commitment {
                    return Err(bad("seed commitment"));
                }
                if parse_u256_dec(vw).map_err(field)? != sent.vw {
                    return Err(bad("weighted commitment"));
                }
                if *count != sent.count {
                    return Err(bad("count"));
                }
            }
            ModeReceipt::AtomicSwapVc { digest } => {
                if parse_u256_dec(digest).map_err(field)? != sent.digest {
                    return Err(bad("digest"));
                }
                return Ok(Secret::with_rand(self.seed, self.rand));
            }
            ModeReceipt::Vrf { g_exp_r } => {
                let g = [
                    parse_u256_dec(&g_exp_r[0]).map_err(field)?,
                    parse_u256_dec(&g_exp_r[1]).map_err(field)?,
                ];
                if g != sent.g {
                    return Err(bad("group element"));
                }
            }
        }
        Ok(Secret::new(self.seed))
    }
}

// ---------------------------------------------------------------------------
// Buyer
// ---------------------------------------------------------------------------

struct KeystreamBuyer {
    kind: TransactionKind,
    mode: TopMode,
    sigma_root: H256,
    payload: RecordPayload,
    nonce: Option<H256>,
    negotiated: bool,
    response: Option<ResponseDoc>,
    secret: Option<Secret>,
    bad: Option<ClaimEvidence>,
}

impl BuyerEngine for KeystreamEngine {
    fn open(
        &self,
        ctx: &SessionContext,
        payload: &RecordPayload,
    ) -> EngineResult<Box<dyn BuyerSession>> {
        let sigma_root = parse_bytes32(&ctx.bulletin.sigma_mkl_root)
            .map_err(|e| EngineError::malformed("bulletin root", e))?;
        match ctx.kind {
            TransactionKind::VrfQuery { .. } => {
                if payload.key_values.is_empty() {
                    return Err(EngineError::Rejected("vrf query without key values".into()));
                }
            }
            kind => {
                let n = ctx.bulletin.n;
                let demands = bounded_indices(&payload.demands, n)?;
                if demands.is_empty() {
                    return Err(EngineError::Rejected("no demands".into()));
                }
                if kind.ot() && !demands.is_subset(&bounded_indices(&payload.phantoms, n)?) {
                    return Err(EngineError::Rejected(
                        "demands must be covered by phantoms".into(),
                    ));
                }
            }
        }
        Ok(Box::new(KeystreamBuyer {
            kind: ctx.kind,
            mode: ctx.kind.top_mode(),
            sigma_root,
            payload: payload.clone(),
            nonce: None,
            negotiated: false,
            response: None,
            secret: None,
            bad: None,
        }))
    }
}

impl KeystreamBuyer {
    fn expected_count(&self) -> u64 {
        match self.kind {
            TransactionKind::VrfQuery { .. } => self.payload.key_values.len() as u64,
            _ => range_indices(&self.payload.demands).len() as u64,
        }
    }

    fn served_indices(&self) -> Option<BTreeSet<u64>> {
        match self.kind {
            TransactionKind::VrfQuery { .. } => None,
            kind if kind.ot() => Some(range_indices(&self.payload.phantoms)),
            _ => Some(range_indices(&self.payload.demands)),
        }
    }

    fn wanted(&self, index: u64, plain: &[u8]) -> bool {
        match self.kind {
            TransactionKind::VrfQuery { .. } => self
                .payload
                .key_values
                .iter()
                .any(|k| first_field(plain) == k.trim().as_bytes()),
            kind if kind.ot() => range_indices(&self.payload.demands).contains(&index),
            _ => true,
        }
    }
}

impl BuyerSession for KeystreamBuyer {
    fn nego_request(&mut self) -> EngineResult<Vec<u8>> {
        let nonce = random_h256();
        self.nonce = Some(nonce);
        Ok(nonce.as_bytes().to_vec())
    }

    fn on_nego_ack_req(&mut self, ack: &[u8], request: &[u8]) -> EngineResult<Vec<u8>> {
        let nonce = self
            .nonce
            .ok_or_else(|| EngineError::Rejected("nego ack before nego request".into()))?;
        if ack != keccak256(nonce.as_bytes()).as_slice() {
            return Err(EngineError::Rejected("nego ack does not answer our request".into()));
        }
        let theirs = nonce_bytes(request, "nego request")?;
        self.negotiated = true;
        Ok(keccak256(theirs.as_bytes()).to_vec())
    }

    fn request(&mut self, path: &Path) -> EngineResult<()> {
        if self.kind.requires_negotiation() && !self.negotiated {
            return Err(EngineError::Rejected(format!(
                "{} requires negotiation before the request",
                self.kind.label()
            )));
        }
        let doc = match self.kind {
            TransactionKind::VrfQuery { .. } => RequestDoc {
                key_name: self.payload.key_name.clone(),
                key_values: self.payload.key_values.clone(),
                count: self.expected_count(),
                ..RequestDoc::default()
            },
            kind if kind.ot() => RequestDoc {
                phantoms: self.payload.phantoms.clone(),
                count: self.expected_count(),
                ..RequestDoc::default()
            },
            _ => RequestDoc {
                demands: self.payload.demands.clone(),
                count: self.expected_count(),
                ..RequestDoc::default()
            },
        };
        let bytes = serde_json::to_vec(&doc).map_err(|e| EngineError::malformed("request", e))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn on_response(&mut self, path: &Path) -> EngineResult<ResponseSummary> {
        let doc: ResponseDoc = serde_json::from_slice(&std::fs::read(path)?)
            .map_err(|e| EngineError::malformed("response", e))?;
        let (k_tree, _) = cipher_tree(&doc.items)?;
        if k_tree.root() != doc.k_root {
            return Err(EngineError::Rejected("cipher root does not match items".into()));
        }
        if doc.items.iter().any(|i| i.proof.index != i.index) {
            return Err(EngineError::Rejected("item proof for the wrong index".into()));
        }
        let served: BTreeSet<u64> = doc.items.iter().map(|i| i.index).collect();
        match self.served_indices() {
            Some(expected) if expected != served => {
                return Err(EngineError::Rejected("response items differ from the request".into()))
            }
            None if served.is_empty() => {
                return Err(EngineError::Rejected("empty vrf response".into()))
            }
            _ => {}
        }

        let count = self.expected_count();
        let receipt = match self.kind {
            TransactionKind::Complaint { .. } => ModeReceipt::Complaint {
                seed2: hex::encode(doc.commitment.as_bytes()),
                k_root: hex::encode(doc.k_root.as_bytes()),
                count,
            },
            TransactionKind::AtomicSwap { .. } => ModeReceipt::AtomicSwap {
                seed2: hex::encode(doc.commitment.as_bytes()),
                vw: as_u256(&hash_pair(&doc.commitment, &doc.k_root)).to_string(),
                count,
            },
            TransactionKind::AtomicSwapVc { .. } => ModeReceipt::AtomicSwapVc {
                digest: doc
                    .digest
                    .clone()
                    .ok_or_else(|| EngineError::malformed("response", "missing digest"))?,
            },
            TransactionKind::VrfQuery { .. } => ModeReceipt::Vrf {
                g_exp_r: doc
                    .g_exp_r
                    .clone()
                    .ok_or_else(|| EngineError::malformed("response", "missing group element"))?,
            },
        };
        self.response = Some(doc);
        Ok(ResponseSummary { receipt, count })
    }

    fn on_secret(&mut self, secret: &Secret) -> EngineResult<bool> {
        let doc = self
            .response
            .as_ref()
            .ok_or_else(|| EngineError::Rejected("secret before response".into()))?;
        let field = |e| EngineError::malformed("response", e);
        let ok = match self.kind {
            TransactionKind::Complaint { .. } | TransactionKind::AtomicSwap { .. } => {
                seed_commitment(&secret.seed) == doc.commitment
            }
            TransactionKind::AtomicSwapVc { .. } => match (secret.rand, doc.digest.as_deref()) {
                (Some(rand), Some(digest)) => {
                    as_u256(&hash_pair(&secret.seed, &rand)) == parse_u256_dec(digest).map_err(field)?
                }
                _ => false,
            },
            TransactionKind::VrfQuery { .. } => match &doc.g_exp_r {
                Some([g0, g1]) => {
                    derive_g(&secret.seed)
                        == [parse_u256_dec(g0).map_err(field)?, parse_u256_dec(g1).map_err(field)?]
                }
                None => false,
            },
        };
        if ok {
            self.secret = Some(*secret);
        }
        Ok(ok)
    }

    fn decrypt(&mut self, output: &Path) -> EngineResult<Delivery> {
        let secret = self
            .secret
            .ok_or_else(|| EngineError::Rejected("no accepted secret".into()))?;
        let doc = self
            .response
            .as_ref()
            .ok_or_else(|| EngineError::Rejected("no response".into()))?;
        let (k_tree, ciphers) = cipher_tree(&doc.items)?;

        let mut delivered: Vec<Vec<u8>> = Vec::new();
        for (pos, (item, cipher)) in doc.items.iter().zip(&ciphers).enumerate() {
            let plain = keystream_xor(&secret.seed, item.index, cipher);
            let valid = item.proof.verify(leaf_hash(&plain), self.sigma_root)
                && match self.kind {
                    TransactionKind::VrfQuery { .. } => self.wanted(item.index, &plain),
                    _ => true,
                };
            if !valid {
                let k_proof = k_tree
                    .proof(pos)
                    .ok_or_else(|| EngineError::Rejected("missing cipher proof".into()))?;
                let evidence = serde_json::to_vec(&ClaimDoc {
                    cipher: item.cipher.clone(),
                    k_proof,
                })
                .map_err(|e| EngineError::malformed("claim", e))?;
                self.bad = Some(ClaimEvidence {
                    index: item.index,
                    evidence,
                });
                return Ok(Delivery::Corrupted { index: item.index });
            }
            if self.wanted(item.index, &plain) {
                delivered.push(plain);
            }
        }

        let bytes = match self.mode {
            TopMode::Plain => delivered.concat(),
            TopMode::Table => {
                let mut out = delivered.join(&b'\n');
                out.push(b'\n');
                out
            }
        };
        std::fs::write(output, bytes)?;
        Ok(Delivery::Verified {
            items: delivered.len() as u64,
        })
    }

    fn claim(&self) -> Option<ClaimEvidence> {
        self.bad.clone()
    }
}
