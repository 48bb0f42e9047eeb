//! Maker and Taker in one process
//!
//! Runs both parties of a single swap against the same simulated ledgers: the
//! Taker proposes, the Maker accepts, both engines drive the swap to a terminal
//! phase, and balances of all four identities are reported before and after.

use crate::config::{EngineConfig, PairConfig, Settings};
use crate::coordination::SwapEngine;
use crate::error::{SwapError, SwapResult};
use crate::ledger::{ActorContext, LedgerAdapter, LedgerSet};
use crate::swap::{
    Asset, Ledger, LedgerKind, Phase, Role, Secret, SwapAcceptance, SwapId, SwapProposal,
    SwapStatus,
};

use serde::Serialize;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::info;

/// Balance of one identity on one side of the pair's swap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceLine {
    pub ledger: Ledger,
    pub identity: String,
    pub balance: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub swap_id: SwapId,
    pub taker: SwapStatus,
    pub maker: SwapStatus,
    pub before: Vec<BalanceLine>,
    pub after: Vec<BalanceLine>,
}

impl PairReport {
    /// Both parties received the counterparty's asset
    pub fn completed(&self) -> bool {
        self.taker.phase == Phase::BetaRedeemed && self.maker.phase == Phase::AlphaRedeemed
    }

    pub fn balance_after(&self, identity: &str) -> Option<u128> {
        self.after
            .iter()
            .find(|line| line.identity == identity)
            .map(|line| line.balance)
    }
}

/// A Taker engine and a Maker engine sharing one set of ledgers
pub struct SwapPair {
    taker: Arc<SwapEngine>,
    maker: Arc<SwapEngine>,
    ledgers: LedgerSet,
    terms: PairConfig,
    alpha_ledger: Ledger,
    beta_ledger: Ledger,
}

impl SwapPair {
    pub fn new(settings: &Settings, ledgers: LedgerSet) -> SwapResult<Self> {
        let terms = settings
            .pair
            .clone()
            .ok_or_else(|| SwapError::Config("no [pair] section configured".to_string()))?;
        let resolve = |key: &str| {
            settings
                .ledgers
                .get(key)
                .map(|l| l.ledger())
                .ok_or_else(|| SwapError::Config(format!("pair ledger {} is not configured", key)))
        };
        let alpha_ledger = resolve(&terms.alpha_ledger)?;
        let beta_ledger = resolve(&terms.beta_ledger)?;

        let engine = |name: &str| {
            let config = EngineConfig {
                instance_id: format!("{}-{}", settings.engine.instance_id, name),
                ..settings.engine.clone()
            };
            Arc::new(SwapEngine::new(
                ActorContext::new(name, ledgers.clone()),
                config,
            ))
        };

        let taker = engine(&terms.taker);
        let maker = engine(&terms.maker);

        Ok(Self {
            taker,
            maker,
            ledgers,
            alpha_ledger,
            beta_ledger,
            terms,
        })
    }

    fn asset(kind: LedgerKind, contract: &Option<String>, quantity: u128) -> Asset {
        match contract {
            Some(contract) => Asset::token(kind, contract.clone(), quantity),
            None => Asset::native(kind, quantity),
        }
    }

    fn alpha_asset(&self) -> Asset {
        Self::asset(
            self.alpha_ledger.kind,
            &self.terms.alpha_contract,
            self.terms.alpha_quantity,
        )
    }

    fn beta_asset(&self) -> Asset {
        Self::asset(
            self.beta_ledger.kind,
            &self.terms.beta_contract,
            self.terms.beta_quantity,
        )
    }

    /// Taker's opening message; expiries count from each ledger's block time
    pub async fn proposal(&self, secret: &Secret) -> SwapResult<SwapProposal> {
        let alpha_tip = self.ledgers.get(&self.alpha_ledger)?.current_height().await?;
        let beta_tip = self.ledgers.get(&self.beta_ledger)?.current_height().await?;
        let ids = &self.terms.identities;

        Ok(SwapProposal {
            alpha_ledger: self.alpha_ledger,
            beta_ledger: self.beta_ledger,
            alpha_asset: self.alpha_asset(),
            beta_asset: self.beta_asset(),
            alpha_refund_identity: ids.alpha_refund.clone(),
            beta_redeem_identity: ids.beta_redeem.clone(),
            alpha_expiry: alpha_tip.timestamp + self.terms.alpha_expiry_secs,
            beta_expiry: beta_tip.timestamp + self.terms.beta_expiry_secs,
            secret_hash: secret.hash(),
        })
    }

    /// Maker's reply
    pub fn acceptance(&self) -> SwapAcceptance {
        let ids = &self.terms.identities;
        SwapAcceptance {
            alpha_redeem_identity: ids.alpha_redeem.clone(),
            beta_refund_identity: ids.beta_refund.clone(),
        }
    }

    /// Balances of both parties' identities on both ledgers
    pub async fn balances(&self) -> SwapResult<Vec<BalanceLine>> {
        let ids = &self.terms.identities;
        let alpha_asset = self.alpha_asset();
        let beta_asset = self.beta_asset();
        let mut lines = Vec::new();

        for (ledger, asset, identity) in [
            (&self.alpha_ledger, &alpha_asset, &ids.alpha_refund),
            (&self.alpha_ledger, &alpha_asset, &ids.alpha_redeem),
            (&self.beta_ledger, &beta_asset, &ids.beta_refund),
            (&self.beta_ledger, &beta_asset, &ids.beta_redeem),
        ] {
            let balance = self.taker.balance(ledger, identity, asset).await?;
            lines.push(BalanceLine {
                ledger: *ledger,
                identity: identity.clone(),
                balance,
            });
        }

        Ok(lines)
    }

    fn log_balances(&self, label: &str, lines: &[BalanceLine]) {
        for line in lines {
            info!(
                ledger = %line.ledger.kind,
                identity = %line.identity,
                "{} balance: {}",
                label,
                line.balance
            );
        }
    }

    /// Negotiate, accept on both sides and wait for both parties to finish
    pub async fn run(&self) -> SwapResult<PairReport> {
        let before = self.balances().await?;
        self.log_balances("Opening", &before);

        let secret = Secret::generate();
        let swap_id = SwapId::new();
        let proposal = self.proposal(&secret).await?;
        let acceptance = self.acceptance();

        self.taker
            .create_swap_from_handshake(
                swap_id,
                proposal.clone(),
                acceptance.clone(),
                Role::Alpha,
                Some(secret),
            )
            .await?;
        self.maker
            .create_swap_from_handshake(swap_id, proposal, acceptance, Role::Beta, None)
            .await?;

        self.maker.accept_swap(swap_id).await?;
        self.taker.accept_swap(swap_id).await?;
        info!(
            %swap_id,
            taker = %self.taker.actor(),
            maker = %self.maker.actor(),
            "Swap started, swapping {} on {} for {} on {}",
            self.terms.alpha_quantity,
            self.alpha_ledger.kind,
            self.terms.beta_quantity,
            self.beta_ledger.kind
        );

        let timeout = Duration::from_secs(self.terms.timeout_secs);
        let (taker, maker) = futures::try_join!(
            self.taker.wait_terminal(swap_id, timeout),
            self.maker.wait_terminal(swap_id, timeout),
        )?;
        info!(%swap_id, taker = %taker.phase, maker = %maker.phase, "Swap finished");

        let after = self.balances().await?;
        self.log_balances("Closing", &after);

        Ok(PairReport {
            swap_id,
            taker,
            maker,
            before,
            after,
        })
    }

    pub async fn stop(&self) {
        self.taker.stop().await;
        self.maker.stop().await;
    }
}
