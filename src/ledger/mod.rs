//! Ledger module - the swap engine's only window onto the chains
//!
//! This module provides:
//! - The `LedgerAdapter` capability set implemented once per ledger
//! - Per-actor ledger wiring (`LedgerSet`, `ActorContext`)
//! - An in-memory simulated ledger for development networks and tests

pub mod simulated;

pub use simulated::{SimulatedLedger, SimulatedLedgerConfig};

pub use crate::swap::Height;

use crate::error::{SwapError, SwapResult};
use crate::swap::{Asset, HtlcParams, Ledger, Secret};
use crate::tx::TxRef;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

/// On-chain state of one HTLC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtlcState {
    NotDeployed,
    Deployed,
    Funded { quantity: u128 },
    Redeemed { secret: Secret },
    Refunded,
}

impl HtlcState {
    pub fn is_deployed(&self) -> bool {
        !matches!(self, HtlcState::NotDeployed)
    }

    /// Funded now or at some earlier point
    pub fn was_funded(&self) -> bool {
        matches!(
            self,
            HtlcState::Funded { .. } | HtlcState::Redeemed { .. } | HtlcState::Refunded
        )
    }

    /// Funded with at least `expected`
    pub fn is_funded_with(&self, expected: u128) -> bool {
        matches!(self, HtlcState::Funded { quantity } if *quantity >= expected)
    }

    pub fn revealed_secret(&self) -> Option<Secret> {
        match self {
            HtlcState::Redeemed { secret } => Some(*secret),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HtlcState::NotDeployed => "not_deployed",
            HtlcState::Deployed => "deployed",
            HtlcState::Funded { .. } => "funded",
            HtlcState::Redeemed { .. } => "redeemed",
            HtlcState::Refunded => "refunded",
        }
    }
}

/// Capability set the engine needs from a ledger
///
/// Every submitting call must be idempotent: re-submitting the same action for
/// the same swap and side returns the original transaction and has no further
/// on-chain effect.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Human-readable ledger name for logs and metrics
    fn name(&self) -> String;

    async fn deploy_contract(&self, htlc: &HtlcParams) -> SwapResult<TxRef>;

    async fn fund_contract(&self, htlc: &HtlcParams) -> SwapResult<TxRef>;

    async fn redeem(&self, htlc: &HtlcParams, secret: &Secret) -> SwapResult<TxRef>;

    async fn refund(&self, htlc: &HtlcParams) -> SwapResult<TxRef>;

    async fn query_confirmed(&self, tx: &TxRef) -> SwapResult<bool>;

    async fn current_height(&self) -> SwapResult<Height>;

    /// Current state of the contract described by `htlc`
    async fn observe(&self, htlc: &HtlcParams) -> SwapResult<HtlcState>;

    async fn balance(&self, identity: &str, asset: &Asset) -> SwapResult<u128>;
}

/// Adapters available to one actor, keyed by ledger
#[derive(Clone, Default)]
pub struct LedgerSet {
    adapters: HashMap<Ledger, Arc<dyn LedgerAdapter>>,
}

impl LedgerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ledger: Ledger, adapter: Arc<dyn LedgerAdapter>) -> Self {
        self.insert(ledger, adapter);
        self
    }

    pub fn insert(&mut self, ledger: Ledger, adapter: Arc<dyn LedgerAdapter>) {
        self.adapters.insert(ledger, adapter);
    }

    pub fn get(&self, ledger: &Ledger) -> SwapResult<Arc<dyn LedgerAdapter>> {
        self.adapters.get(ledger).cloned().ok_or_else(|| {
            SwapError::LedgerNotConfigured(format!("{}/{:?}", ledger.kind, ledger.network))
        })
    }

    pub fn ledgers(&self) -> Vec<Ledger> {
        self.adapters.keys().copied().collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerHealth {
    pub ledger: Ledger,
    pub name: String,
    pub healthy: bool,
    pub height: Option<Height>,
}

/// Everything one party brings to its swaps
///
/// Passed explicitly to every state machine step; there are no process-wide
/// wallet or ledger clients.
pub struct ActorContext {
    pub name: String,
    pub ledgers: LedgerSet,
}

impl ActorContext {
    pub fn new(name: impl Into<String>, ledgers: LedgerSet) -> Self {
        Self {
            name: name.into(),
            ledgers,
        }
    }

    pub fn ledger(&self, ledger: &Ledger) -> SwapResult<Arc<dyn LedgerAdapter>> {
        self.ledgers.get(ledger)
    }

    /// Health check for all ledgers
    pub async fn health_check(&self) -> Vec<LedgerHealth> {
        let mut results = Vec::new();

        for ledger in self.ledgers.ledgers() {
            let Ok(adapter) = self.ledgers.get(&ledger) else {
                continue;
            };
            let name = adapter.name();
            let height = match adapter.current_height().await {
                Ok(height) => {
                    crate::metrics::record_ledger_height(&name, height.number);
                    Some(height)
                }
                Err(e) => {
                    error!(ledger = %name, "Health check failed: {}", e);
                    None
                }
            };
            crate::metrics::record_ledger_health(&name, height.is_some());
            results.push(LedgerHealth {
                ledger,
                name,
                healthy: height.is_some(),
                height,
            });
        }

        results
    }
}
