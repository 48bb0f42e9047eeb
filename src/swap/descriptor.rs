//! Negotiated swap terms
//!
//! A [`SwapDescriptor`] is assembled from the two halves of the negotiation
//! handshake and never changes afterwards. Both parties hold an identical copy;
//! [`SwapDescriptor::digest`] commits to its canonical JSON encoding.

use super::secret::SecretHash;
use super::{Side, SwapId};
use crate::error::{SwapError, SwapResult};

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;

/// Ledger families the coordinator knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Bitcoin,
    Ethereum,
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerKind::Bitcoin => write!(f, "bitcoin"),
            LedgerKind::Ethereum => write!(f, "ethereum"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ledger {
    pub kind: LedgerKind,
    pub network: Network,
}

impl Ledger {
    pub fn new(kind: LedgerKind, network: Network) -> Self {
        Self { kind, network }
    }
}

/// Asset locked on one side of the swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub ledger: LedgerKind,
    /// Quantity in the ledger's base unit (satoshi, wei, token base unit)
    pub quantity: u128,
    /// Token contract, for assets that are not the ledger's native coin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
}

impl Asset {
    pub fn native(ledger: LedgerKind, quantity: u128) -> Self {
        Self {
            ledger,
            quantity,
            contract: None,
        }
    }

    pub fn token(ledger: LedgerKind, contract: impl Into<String>, quantity: u128) -> Self {
        Self {
            ledger,
            quantity,
            contract: Some(contract.into()),
        }
    }
}

/// Per-ledger identities used by the two HTLCs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identities {
    pub alpha_refund: String,
    pub alpha_redeem: String,
    pub beta_refund: String,
    pub beta_redeem: String,
}

/// Opening half of the handshake, sent by the alpha party
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapProposal {
    pub alpha_ledger: Ledger,
    pub beta_ledger: Ledger,
    pub alpha_asset: Asset,
    pub beta_asset: Asset,
    pub alpha_refund_identity: String,
    pub beta_redeem_identity: String,
    pub alpha_expiry: u64,
    pub beta_expiry: u64,
    pub secret_hash: SecretHash,
}

/// Closing half of the handshake, returned by the beta party
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapAcceptance {
    pub alpha_redeem_identity: String,
    pub beta_refund_identity: String,
}

/// Immutable record of a negotiated swap
///
/// Field order is the canonical encoding order; do not reorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapDescriptor {
    pub swap_id: SwapId,
    pub alpha_ledger: Ledger,
    pub beta_ledger: Ledger,
    pub alpha_asset: Asset,
    pub beta_asset: Asset,
    pub alpha_expiry: u64,
    pub beta_expiry: u64,
    pub identities: Identities,
    pub secret_hash: SecretHash,
}

/// A descriptor projected onto one of its two ledgers
#[derive(Debug, Clone, PartialEq)]
pub struct HtlcParams {
    pub swap_id: SwapId,
    pub side: Side,
    pub ledger: Ledger,
    pub asset: Asset,
    pub secret_hash: SecretHash,
    pub expiry: u64,
    pub redeem_identity: String,
    pub refund_identity: String,
}

impl SwapDescriptor {
    /// Assemble a descriptor from both handshake messages
    pub fn from_handshake(
        swap_id: SwapId,
        proposal: SwapProposal,
        acceptance: SwapAcceptance,
    ) -> SwapResult<Self> {
        let descriptor = Self {
            swap_id,
            alpha_ledger: proposal.alpha_ledger,
            beta_ledger: proposal.beta_ledger,
            alpha_asset: proposal.alpha_asset,
            beta_asset: proposal.beta_asset,
            alpha_expiry: proposal.alpha_expiry,
            beta_expiry: proposal.beta_expiry,
            identities: Identities {
                alpha_refund: proposal.alpha_refund_identity,
                alpha_redeem: acceptance.alpha_redeem_identity,
                beta_refund: acceptance.beta_refund_identity,
                beta_redeem: proposal.beta_redeem_identity,
            },
            secret_hash: proposal.secret_hash,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Check the structural rules every negotiated swap must satisfy
    pub fn validate(&self) -> SwapResult<()> {
        if self.alpha_expiry <= self.beta_expiry {
            return Err(SwapError::Negotiation(format!(
                "alpha expiry {} must be strictly after beta expiry {}",
                self.alpha_expiry, self.beta_expiry
            )));
        }

        for (side, ledger, asset) in [
            (Side::Alpha, &self.alpha_ledger, &self.alpha_asset),
            (Side::Beta, &self.beta_ledger, &self.beta_asset),
        ] {
            if asset.quantity == 0 {
                return Err(SwapError::Negotiation(format!(
                    "{} asset quantity must be positive",
                    side
                )));
            }
            if asset.ledger != ledger.kind {
                return Err(SwapError::Negotiation(format!(
                    "{} asset lives on {} but {} ledger is {}",
                    side, asset.ledger, side, ledger.kind
                )));
            }
            if asset.ledger == LedgerKind::Bitcoin && asset.contract.is_some() {
                return Err(SwapError::Negotiation(
                    "bitcoin assets cannot reference a token contract".to_string(),
                ));
            }
        }

        let ids = &self.identities;
        for (name, value) in [
            ("alpha refund", &ids.alpha_refund),
            ("alpha redeem", &ids.alpha_redeem),
            ("beta refund", &ids.beta_refund),
            ("beta redeem", &ids.beta_redeem),
        ] {
            if value.trim().is_empty() {
                return Err(SwapError::Negotiation(format!(
                    "{} identity is empty",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Canonical encoding used for commitments
    pub fn canonical_bytes(&self) -> SwapResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SwapError::Internal(e.to_string()))
    }

    /// SHA3-256 commitment over the canonical encoding
    pub fn digest(&self) -> SwapResult<String> {
        let bytes = self.canonical_bytes()?;
        Ok(hex::encode(Sha3_256::digest(bytes)))
    }

    pub fn ledger(&self, side: Side) -> Ledger {
        match side {
            Side::Alpha => self.alpha_ledger,
            Side::Beta => self.beta_ledger,
        }
    }

    pub fn expiry(&self, side: Side) -> u64 {
        match side {
            Side::Alpha => self.alpha_expiry,
            Side::Beta => self.beta_expiry,
        }
    }

    /// Contract parameters for one side
    pub fn htlc(&self, side: Side) -> HtlcParams {
        let (asset, redeem_identity, refund_identity) = match side {
            Side::Alpha => (
                &self.alpha_asset,
                &self.identities.alpha_redeem,
                &self.identities.alpha_refund,
            ),
            Side::Beta => (
                &self.beta_asset,
                &self.identities.beta_redeem,
                &self.identities.beta_refund,
            ),
        };

        HtlcParams {
            swap_id: self.swap_id,
            side,
            ledger: self.ledger(side),
            asset: asset.clone(),
            secret_hash: self.secret_hash,
            expiry: self.expiry(side),
            redeem_identity: redeem_identity.clone(),
            refund_identity: refund_identity.clone(),
        }
    }
}
