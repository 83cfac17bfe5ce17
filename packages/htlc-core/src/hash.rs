//! Hash-lock and time-lock primitives
//!
//! A swap is locked by `hashLock = keccak256(secret)` where the secret is 32
//! random bytes. Both travel as `0x`-prefixed lowercase hex (66 characters),
//! the same encoding the on-chain HTLC contracts use for `bytes32`.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};

use crate::clock::add_seconds;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a 32-byte value from hex (with or without 0x prefix)
///
/// Exactly 64 hex characters are required; shorter values are not left-padded.
pub fn parse_bytes32(value: &str) -> Result<[u8; 32], String> {
    let trimmed = value.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if digits.len() != 64 {
        return Err(format!(
            "expected 64 hex characters, got {}",
            digits.len()
        ));
    }
    let bytes = hex::decode(digits).map_err(|e| format!("invalid hex: {}", e))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Serde adapter for `[u8; 32]` as 0x-prefixed hex
pub mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::bytes32_to_hex(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        super::parse_bytes32(&value).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Secret / HashLock
// ============================================================================

/// Swap secret (the HTLC preimage)
///
/// `Debug` never prints the value and there is no `Display`. The hex form is
/// only produced through [`Secret::to_hex`] or serialization, which the
/// coordinator uses for the initiator's receipt and for the status view after
/// a claim has revealed the secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(#[serde(with = "hex32")] [u8; 32]);

impl Secret {
    /// Generate a fresh secret from the operating system CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Secret(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Secret(bytes)
    }

    /// Parse from hex (with or without 0x prefix)
    pub fn from_hex(value: &str) -> Result<Self, String> {
        parse_bytes32(value).map(Secret)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        bytes32_to_hex(&self.0)
    }

    /// Commitment for this secret
    pub fn hash_lock(&self) -> HashLock {
        HashLock(keccak256(&self.0))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Hash lock (commitment) = keccak256(secret)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashLock(#[serde(with = "hex32")] [u8; 32]);

impl HashLock {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        HashLock(bytes)
    }

    pub fn from_hex(value: &str) -> Result<Self, String> {
        parse_bytes32(value).map(HashLock)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        bytes32_to_hex(&self.0)
    }

    /// True iff `keccak256(preimage) == self`
    pub fn verify(&self, preimage: &Secret) -> bool {
        verify_preimage(preimage.as_bytes(), self)
    }
}

impl fmt::Display for HashLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Check a raw preimage against a hash lock
pub fn verify_preimage(preimage: &[u8], hash_lock: &HashLock) -> bool {
    keccak256(preimage) == hash_lock.0
}

// ============================================================================
// Identifier derivation
// ============================================================================

/// Domain tag mixed into operation ids so they never collide with swap ids
const OPERATION_DOMAIN: &[u8] = b"HTLC_CONSENSUS_OPERATION";

/// Compute the swap id
///
/// ```text
/// keccak256(sourceChain || 0x00 || destChain || 0x00 || recipient || 0x00 ||
///           amount(uint256) || hashLock || createdAtMillis(int64) || sequence(uint64))
/// ```
///
/// The hash lock is fresh per swap, so the sequence only matters for
/// reproducibility in tests that inject a fixed secret.
pub fn compute_swap_id(
    source_chain: &str,
    destination_chain: &str,
    recipient: &str,
    amount: u128,
    hash_lock: &HashLock,
    created_at: DateTime<Utc>,
    sequence: u64,
) -> [u8; 32] {
    let mut data = Vec::with_capacity(
        source_chain.len() + destination_chain.len() + recipient.len() + 3 + 32 + 32 + 8 + 8,
    );
    data.extend_from_slice(source_chain.as_bytes());
    data.push(0);
    data.extend_from_slice(destination_chain.as_bytes());
    data.push(0);
    data.extend_from_slice(recipient.as_bytes());
    data.push(0);

    // amount (uint256 as 32 bytes, big-endian)
    let mut amount_word = [0u8; 32];
    amount_word[16..].copy_from_slice(&amount.to_be_bytes());
    data.extend_from_slice(&amount_word);

    data.extend_from_slice(hash_lock.as_bytes());
    data.extend_from_slice(&created_at.timestamp_millis().to_be_bytes());
    data.extend_from_slice(&sequence.to_be_bytes());

    keccak256(&data)
}

/// Compute the consensus operation id for a swap
pub fn compute_operation_id(swap_id: &[u8; 32]) -> [u8; 32] {
    let mut data = [0u8; OPERATION_DOMAIN.len() + 32];
    data[..OPERATION_DOMAIN.len()].copy_from_slice(OPERATION_DOMAIN);
    data[OPERATION_DOMAIN.len()..].copy_from_slice(swap_id);
    keccak256(&data)
}

// ============================================================================
// Time lock
// ============================================================================

/// Absolute deadline for a time lock starting at `created_at`
pub fn timelock_deadline(created_at: DateTime<Utc>, timelock_seconds: u64) -> DateTime<Utc> {
    add_seconds(created_at, timelock_seconds)
}

/// True once `now` has reached the deadline
pub fn is_expired(deadline: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= deadline
}

/// Whole seconds until the deadline, rounded up; zero once expired
pub fn remaining_seconds(deadline: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    if is_expired(deadline, now) {
        return 0;
    }
    let millis = (deadline - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}
