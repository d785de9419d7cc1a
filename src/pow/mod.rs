//! Share difficulty math and proof-of-work checks.
//!
//! The proxy runs the final Ethash round only: the submitted mix digest is
//! folded into the header/nonce keccak and the result is compared against the
//! share and network boundaries. The DAG-dependent mix recomputation happens
//! on the full node when a block candidate is forwarded.
//!
//!   seed   = keccak512(header_hash ‖ nonce_le)
//!   result = keccak256(seed ‖ mix_digest)
//!   valid  ⇔ result ≤ boundary, where boundary = 2^256 / difficulty

use num_bigint::BigUint;
use num_traits::One;
use sha3::{Digest, Keccak256, Keccak512};

pub type Hash256 = [u8; 32];

/// Outcome of verifying one submitted share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Below pool share difficulty.
    Invalid,
    /// Meets the pool boundary only.
    Share,
    /// Meets the network boundary: a block solution.
    Block,
}

/// Seam for proof-of-work verification. The production implementation is
/// [`EthashLight`]; tests plug in scripted verifiers.
pub trait ShareVerifier: Send + Sync {
    fn verify(
        &self,
        header: &Hash256,
        nonce: u64,
        mix_digest: &Hash256,
        share_boundary: &Hash256,
        network_boundary: &Hash256,
    ) -> Verdict;
}

/// Final-round Ethash check without a DAG.
pub struct EthashLight;

impl ShareVerifier for EthashLight {
    fn verify(
        &self,
        header: &Hash256,
        nonce: u64,
        mix_digest: &Hash256,
        share_boundary: &Hash256,
        network_boundary: &Hash256,
    ) -> Verdict {
        let mut seed_input = [0u8; 40];
        seed_input[..32].copy_from_slice(header);
        seed_input[32..].copy_from_slice(&nonce.to_le_bytes());
        let seed = Keccak512::digest(seed_input);

        let mut result_input = [0u8; 96];
        result_input[..64].copy_from_slice(&seed);
        result_input[64..].copy_from_slice(mix_digest);
        let result: Hash256 = Keccak256::digest(result_input).into();

        if !meets_boundary(&result, share_boundary) {
            Verdict::Invalid
        } else if meets_boundary(&result, network_boundary) {
            Verdict::Block
        } else {
            Verdict::Share
        }
    }
}

/// Big-endian 256-bit comparison: hash ≤ boundary.
pub fn meets_boundary(hash: &Hash256, boundary: &Hash256) -> bool {
    hash <= boundary
}

/// boundary = 2^256 / difficulty, big-endian.
pub fn difficulty_to_boundary(difficulty: u64) -> Hash256 {
    if difficulty == 0 {
        return [0u8; 32];
    }
    let boundary = (BigUint::one() << 256u32) / BigUint::from(difficulty);
    let bytes = boundary.to_bytes_be();
    let mut out = [0u8; 32];
    // 2^256 / 1 needs 33 bytes; difficulty 1 accepts every hash.
    if bytes.len() > 32 {
        return [0xff; 32];
    }
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Inverse of [`difficulty_to_boundary`], saturating at u64::MAX.
pub fn boundary_to_difficulty(boundary: &Hash256) -> u64 {
    let b = BigUint::from_bytes_be(boundary);
    if b == BigUint::from(0u32) {
        return u64::MAX;
    }
    let diff = (BigUint::one() << 256u32) / b;
    diff.try_into().unwrap_or(u64::MAX)
}

// ─── Hex-shape validation ───────────────────────────────────────────
//
// Stratum params are hot-path validated before anything is decoded.

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// `0x` + 16 lowercase hex chars.
pub fn valid_nonce(s: &str) -> bool {
    match s.strip_prefix("0x") {
        Some(rest) => rest.len() == 16 && is_lower_hex(rest),
        None => false,
    }
}

/// `0x` + 64 lowercase hex chars.
pub fn valid_hash(s: &str) -> bool {
    match s.strip_prefix("0x") {
        Some(rest) => rest.len() == 64 && is_lower_hex(rest),
        None => false,
    }
}

/// `0x` + 40 hex chars, either case.
pub fn valid_login(s: &str) -> bool {
    match s.strip_prefix("0x") {
        Some(rest) => rest.len() == 40 && rest.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}

/// Worker ids are 1–8 chars of `[0-9a-zA-Z_-]`; anything else becomes `"0"`.
pub fn sanitize_worker(s: &str) -> String {
    let ok = !s.is_empty()
        && s.len() <= 8
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        s.to_string()
    } else {
        "0".to_string()
    }
}

/// Decode a validated `0x` + 64-hex string into 32 bytes.
pub fn parse_hash(s: &str) -> Option<Hash256> {
    let bytes = hex::decode(s.strip_prefix("0x")?).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

/// Decode a validated `0x` + 16-hex nonce into a u64.
pub fn parse_nonce(s: &str) -> Option<u64> {
    u64::from_str_radix(s.strip_prefix("0x")?, 16).ok()
}

pub fn encode_hash(h: &Hash256) -> String {
    format!("0x{}", hex::encode(h))
}
