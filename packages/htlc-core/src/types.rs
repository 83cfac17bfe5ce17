//! Common types for consensus-gated swaps

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SwapError;
use crate::hash::{bytes32_to_hex, compute_operation_id, hex32, parse_bytes32};

// ============================================================================
// Chain names
// ============================================================================

/// Maximum length of a chain name
pub const MAX_CHAIN_NAME_LEN: usize = 32;

/// Network name, e.g. `arbitrum`, `solana`, `ton`
///
/// Names are normalized to lowercase and limited to `[a-z0-9-]` so they can be
/// used verbatim in metric labels, env var suffixes and database rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainId(String);

impl ChainId {
    pub fn new(name: &str) -> Result<Self, SwapError> {
        let normalized = name.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(SwapError::invalid("chain name must not be empty"));
        }
        if normalized.len() > MAX_CHAIN_NAME_LEN {
            return Err(SwapError::invalid(format!(
                "chain name exceeds {} characters",
                MAX_CHAIN_NAME_LEN
            )));
        }
        if !normalized
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(SwapError::invalid(format!(
                "invalid chain name: {}",
                name.trim()
            )));
        }
        Ok(ChainId(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a comma separated list such as `arbitrum,solana,ton`
    pub fn parse_list(list: &str) -> Result<Vec<Self>, SwapError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ChainId::new)
            .collect()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ChainId {
    type Error = SwapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ChainId::new(&value)
    }
}

impl From<ChainId> for String {
    fn from(chain: ChainId) -> Self {
        chain.0
    }
}

impl FromStr for ChainId {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainId::new(s)
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Swap identifier (32-byte keccak digest, 0x hex on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwapId(#[serde(with = "hex32")] pub [u8; 32]);

impl SwapId {
    pub fn from_hex(value: &str) -> Result<Self, SwapError> {
        parse_bytes32(value)
            .map(SwapId)
            .map_err(|e| SwapError::invalid(format!("invalid swap id: {}", e)))
    }

    pub fn to_hex(&self) -> String {
        bytes32_to_hex(&self.0)
    }

    /// Operation id of the consensus record linked to this swap
    pub fn operation_id(&self) -> OperationId {
        OperationId(compute_operation_id(&self.0))
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Consensus operation identifier (32-byte keccak digest, 0x hex on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(#[serde(with = "hex32")] pub [u8; 32]);

impl OperationId {
    pub fn from_hex(value: &str) -> Result<Self, SwapError> {
        parse_bytes32(value)
            .map(OperationId)
            .map_err(|e| SwapError::invalid(format!("invalid operation id: {}", e)))
    }

    pub fn to_hex(&self) -> String {
        bytes32_to_hex(&self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ============================================================================
// Swap status
// ============================================================================

/// Swap lifecycle status
///
/// ```text
/// Pending -> ConsensusPending -> ConsensusReached -> Claimed
///    |              |                   |
///    +--------------+-------------------+--> Refunded (after timelock)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Pending,
    ConsensusPending,
    ConsensusReached,
    Claimed,
    Refunded,
}

impl SwapStatus {
    /// Get the status as a snake_case string
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Pending => "pending",
            SwapStatus::ConsensusPending => "consensus_pending",
            SwapStatus::ConsensusReached => "consensus_reached",
            SwapStatus::Claimed => "claimed",
            SwapStatus::Refunded => "refunded",
        }
    }

    /// Claimed and Refunded are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, SwapStatus::Claimed | SwapStatus::Refunded)
    }

    /// Whether `self -> next` is a legal lifecycle edge
    pub fn can_transition_to(&self, next: SwapStatus) -> bool {
        use SwapStatus::*;
        matches!(
            (self, next),
            (Pending, ConsensusPending)
                | (Pending, ConsensusReached)
                | (ConsensusPending, ConsensusReached)
                | (ConsensusReached, Claimed)
                | (Pending, Refunded)
                | (ConsensusPending, Refunded)
                | (ConsensusReached, Refunded)
        )
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SwapStatus {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SwapStatus::Pending),
            "consensus_pending" => Ok(SwapStatus::ConsensusPending),
            "consensus_reached" => Ok(SwapStatus::ConsensusReached),
            "claimed" => Ok(SwapStatus::Claimed),
            "refunded" => Ok(SwapStatus::Refunded),
            other => Err(SwapError::invalid(format!("unknown swap status: {}", other))),
        }
    }
}

// ============================================================================
// Attestations
// ============================================================================

/// Per-chain consensus state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    #[default]
    Pending,
    Signed,
    Failed,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Pending => "pending",
            ChainStatus::Signed => "signed",
            ChainStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome reported by a chain attestation adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attestation {
    Signed,
    Failed,
}

impl Attestation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Attestation::Signed => "signed",
            Attestation::Failed => "failed",
        }
    }
}

impl fmt::Display for Attestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<Attestation> for ChainStatus {
    fn from(outcome: Attestation) -> Self {
        match outcome {
            Attestation::Signed => ChainStatus::Signed,
            Attestation::Failed => ChainStatus::Failed,
        }
    }
}

impl FromStr for Attestation {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "signed" => Ok(Attestation::Signed),
            "failed" => Ok(Attestation::Failed),
            other => Err(SwapError::invalid(format!("unknown attestation outcome: {}", other))),
        }
    }
}

// ============================================================================
// Amounts
// ============================================================================

/// Serde adapter for `u128` amounts as decimal strings
///
/// JSON numbers lose precision past 2^53 in most clients, so amounts always
/// travel as strings.
pub mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}
