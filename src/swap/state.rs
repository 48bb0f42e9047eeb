//! Per-party swap state and lifecycle phases

use super::{Role, Secret, Side, SwapDescriptor, SwapId};
use crate::error::{ErrorKind, SwapError, SwapResult};
use crate::tx::{ActionKind, TxRef};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Lifecycle phase of a swap, as seen by one party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Negotiated,
    Accepted,
    AlphaDeployed,
    AlphaFunded,
    BetaFunded,
    AlphaRedeemed,
    BetaRedeemed,
    Refunded,
    Expired,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::AlphaRedeemed
                | Phase::BetaRedeemed
                | Phase::Refunded
                | Phase::Expired
                | Phase::Aborted
        )
    }

    /// No funding transaction can have been confirmed yet
    pub fn is_pre_funding(self) -> bool {
        matches!(
            self,
            Phase::Negotiated | Phase::Accepted | Phase::AlphaDeployed
        )
    }

    /// Whether the lifecycle allows moving from `self` to `to`
    pub fn can_transition_to(self, to: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Phase::Refunded | Phase::Expired | Phase::Aborted => true,
            Phase::Accepted => self == Phase::Negotiated,
            Phase::AlphaDeployed => self == Phase::Accepted,
            Phase::AlphaFunded => self == Phase::AlphaDeployed,
            Phase::BetaFunded => self == Phase::AlphaFunded,
            Phase::AlphaRedeemed | Phase::BetaRedeemed => self == Phase::BetaFunded,
            Phase::Negotiated => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Negotiated => "negotiated",
            Phase::Accepted => "accepted",
            Phase::AlphaDeployed => "alpha_deployed",
            Phase::AlphaFunded => "alpha_funded",
            Phase::BetaFunded => "beta_funded",
            Phase::AlphaRedeemed => "alpha_redeemed",
            Phase::BetaRedeemed => "beta_redeemed",
            Phase::Refunded => "refunded",
            Phase::Expired => "expired",
            Phase::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chain tip as reported by a ledger adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Height {
    pub number: u64,
    /// Block time in unix seconds; HTLC expiries are measured against it
    pub timestamp: u64,
}

/// Ledger action currently handed to the scheduler
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub side: Side,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxRecord {
    pub kind: ActionKind,
    pub side: Side,
    pub tx: TxRef,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Mutable swap state owned by one party
#[derive(Debug, Clone)]
pub struct SwapState {
    pub role: Role,
    pub phase: Phase,
    pub pending_action: Option<PendingAction>,
    pub alpha_height: Option<Height>,
    pub beta_height: Option<Height>,
    pub secret: Option<Secret>,
    pub transactions: Vec<TxRecord>,
    pub consecutive_failures: u32,
    pub error: Option<StatusError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SwapState {
    pub fn new(role: Role, secret: Option<Secret>) -> Self {
        let now = Utc::now();
        Self {
            role,
            phase: Phase::Negotiated,
            pending_action: None,
            alpha_height: None,
            beta_height: None,
            secret,
            transactions: Vec::new(),
            consecutive_failures: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, enforcing the lifecycle graph
    pub fn transition(&mut self, to: Phase) -> SwapResult<()> {
        if !self.phase.can_transition_to(to) {
            return Err(SwapError::InvalidStateTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        self.updated_at = Utc::now();
        if to.is_terminal() {
            self.pending_action = None;
        }
        Ok(())
    }

    pub fn observe_height(&mut self, side: Side, height: Height) {
        match side {
            Side::Alpha => self.alpha_height = Some(height),
            Side::Beta => self.beta_height = Some(height),
        }
    }

    pub fn record_tx(&mut self, kind: ActionKind, side: Side, tx: TxRef) {
        self.transactions.push(TxRecord { kind, side, tx });
        self.updated_at = Utc::now();
    }

    pub fn tx_for(&self, kind: ActionKind, side: Side) -> Option<&TxRef> {
        self.transactions
            .iter()
            .find(|r| r.kind == kind && r.side == side)
            .map(|r| &r.tx)
    }

    pub fn set_error(&mut self, error: &SwapError) {
        self.error = Some(StatusError {
            kind: error.kind(),
            message: error.to_string(),
        });
        self.updated_at = Utc::now();
    }

    /// A funding transaction has been handed to a ledger
    pub fn funding_broadcast(&self) -> bool {
        !self.phase.is_pre_funding()
            || self
                .pending_action
                .as_ref()
                .map(|a| a.kind == ActionKind::Fund)
                .unwrap_or(false)
            || self.tx_for(ActionKind::Fund, self.role.funding_side()).is_some()
    }

    pub fn status(&self, descriptor: &SwapDescriptor) -> SwapStatus {
        SwapStatus {
            swap_id: descriptor.swap_id,
            role: self.role,
            phase: self.phase,
            terminal: self.phase.is_terminal(),
            pending_action: self.pending_action.clone(),
            transactions: self.transactions.clone(),
            error: self.error.clone(),
            alpha_height: self.alpha_height,
            beta_height: self.beta_height,
            descriptor_digest: descriptor.digest().unwrap_or_default(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Operator-facing snapshot of a swap
#[derive(Debug, Clone, Serialize)]
pub struct SwapStatus {
    pub swap_id: SwapId,
    pub role: Role,
    pub phase: Phase,
    pub terminal: bool,
    pub pending_action: Option<PendingAction>,
    pub transactions: Vec<TxRecord>,
    pub error: Option<StatusError>,
    pub alpha_height: Option<Height>,
    pub beta_height: Option<Height>,
    pub descriptor_digest: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
