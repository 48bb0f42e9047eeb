//! Swap data model
//!
//! Defines:
//! - Negotiated swap terms ([`SwapDescriptor`]) and the handshake that builds them
//! - The HTLC secret and its hash
//! - Per-party mutable swap state and its lifecycle phases

pub mod descriptor;
pub mod secret;
pub mod state;

pub use descriptor::{
    Asset, HtlcParams, Identities, Ledger, LedgerKind, Network, SwapAcceptance, SwapDescriptor,
    SwapProposal,
};
pub use secret::{Secret, SecretHash};
pub use state::{Height, PendingAction, Phase, StatusError, SwapState, SwapStatus, TxRecord};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque swap identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwapId(Uuid);

impl SwapId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SwapId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SwapId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SwapId)
    }
}

/// One of the two ledgers of a swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Alpha,
    Beta,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Alpha => write!(f, "alpha"),
            Side::Beta => write!(f, "beta"),
        }
    }
}

/// Which side the local party funds
///
/// The alpha party holds the secret and redeems on beta first; the beta party
/// learns the secret from that redemption and redeems on alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Alpha,
    Beta,
}

impl Role {
    /// Side on which this party locks its own asset
    pub fn funding_side(self) -> Side {
        match self {
            Role::Alpha => Side::Alpha,
            Role::Beta => Side::Beta,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Alpha => write!(f, "alpha"),
            Role::Beta => write!(f, "beta"),
        }
    }
}
