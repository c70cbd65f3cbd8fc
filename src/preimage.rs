// src/preimage.rs
// Canonical preimage layout and difficulty predicate. The layout matches what
// the remote validates: nonce as 16 hex digits, then the address and the
// challenge fields concatenated in order.

use std::fmt::Write as FmtWrite;

use sha2::{Digest, Sha256};

use crate::remote::Challenge;

/// Writes the preimage for `(nonce, address, challenge)` into `buf`,
/// clearing it first so callers can reuse one allocation per batch.
pub fn write_preimage(buf: &mut String, nonce: u64, address: &str, challenge: &Challenge) {
    buf.clear();
    write!(buf, "{:016x}", nonce).expect("write to String cannot fail");
    buf.push_str(address);
    buf.push_str(&challenge.challenge_id);
    buf.push_str(&challenge.difficulty);
    buf.push_str(&challenge.no_pre_mine);
    buf.push_str(&challenge.latest_submission);
    buf.push_str(&challenge.no_pre_mine_hour);
}

pub fn build_preimage(nonce: u64, address: &str, challenge: &Challenge) -> String {
    let mut buf = String::with_capacity(256);
    write_preimage(&mut buf, nonce, address, challenge);
    buf
}

/// Parses the 8-hex-char difficulty bitmask.
pub fn difficulty_mask(difficulty_hex: &str) -> Result<u32, String> {
    if difficulty_hex.len() != 8 {
        return Err(format!(
            "difficulty must be exactly 8 hex chars, got {:?}",
            difficulty_hex
        ));
    }
    u32::from_str_radix(difficulty_hex, 16)
        .map_err(|e| format!("difficulty {:?} is not hex: {}", difficulty_hex, e))
}

/// A digest is a hit when every bit cleared in the mask is also cleared in
/// the big-endian prefix of the digest.
pub fn meets_difficulty(digest: &[u8; 64], mask: u32) -> bool {
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (prefix & !mask) == 0
}

/// Deterministic starting nonce for one (address, challenge) pair, so a
/// restarted solver explores fresh nonce space instead of replaying.
pub fn starting_nonce(address: &str, challenge_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    hasher.update(challenge_id.as_bytes());
    let out = hasher.finalize();
    u64::from_le_bytes(out[..8].try_into().expect("sha256 output is 32 bytes"))
}

pub fn nonce_hex(nonce: u64) -> String {
    format!("{:016x}", nonce)
}
