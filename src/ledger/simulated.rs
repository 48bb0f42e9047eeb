//! In-memory ledger with HTLC semantics
//!
//! Stands in for a regtest node: blocks are mined on demand, on every
//! submission (instant mining) or by a background miner task. Transactions sit
//! in a mempool until a block includes them, and their effects are re-checked
//! at inclusion. Fault injection lets tests drop calls or starve confirmations.

use super::{HtlcState, LedgerAdapter, LedgerSet};
use crate::config::Settings;
use crate::error::{SwapError, SwapResult};
use crate::swap::{Asset, Height, HtlcParams, Ledger, Secret, Side, SwapId};
use crate::tx::{ActionKind, TxRef};

use async_trait::async_trait;
use chrono::Utc;
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SimulatedLedgerConfig {
    pub name: String,
    pub ledger: Ledger,
    /// Blocks needed (including the inclusion block) to report a tx confirmed
    pub confirmations: u64,
    /// Mine a block on every accepted submission
    pub instant_mining: bool,
    /// Seconds added to the block clock per mined block
    pub block_time_secs: u64,
    /// Follow wall-clock time instead of the synthetic block clock
    pub wall_clock: bool,
    pub genesis_time: u64,
}

impl SimulatedLedgerConfig {
    pub fn new(name: impl Into<String>, ledger: Ledger, genesis_time: u64) -> Self {
        Self {
            name: name.into(),
            ledger,
            confirmations: 1,
            instant_mining: true,
            block_time_secs: 1,
            wall_clock: false,
            genesis_time,
        }
    }
}

type ContractKey = (SwapId, Side);
type BalanceKey = (String, Option<String>);

#[derive(Debug, Clone)]
enum Effect {
    Deploy(HtlcParams),
    Fund(HtlcParams),
    Redeem(HtlcParams, Secret),
    Refund(HtlcParams),
}

impl Effect {
    fn key(&self) -> ContractKey {
        let htlc = match self {
            Effect::Deploy(h) | Effect::Fund(h) | Effect::Redeem(h, _) | Effect::Refund(h) => h,
        };
        (htlc.swap_id, htlc.side)
    }
}

#[derive(Debug, Clone)]
struct Contract {
    state: HtlcState,
}

#[derive(Debug, Default)]
struct Chain {
    height: u64,
    time: u64,
    next_seq: u64,
    mempool: Vec<(TxRef, Effect)>,
    /// Included transactions and their block number
    included: HashMap<TxRef, u64>,
    contracts: HashMap<ContractKey, Contract>,
    balances: HashMap<BalanceKey, u128>,
    /// Idempotency index: one transaction per (swap, side, action)
    submitted: HashMap<(SwapId, Side, ActionKind), TxRef>,
    /// Number of funding effects applied per contract
    fundings: HashMap<ContractKey, u32>,
    fail_next: u32,
    withholding: bool,
}

/// In-memory HTLC ledger
pub struct SimulatedLedger {
    config: SimulatedLedgerConfig,
    chain: Mutex<Chain>,
}

impl SimulatedLedger {
    pub fn new(config: SimulatedLedgerConfig) -> Self {
        let chain = Chain {
            time: config.genesis_time,
            ..Default::default()
        };
        Self {
            config,
            chain: Mutex::new(chain),
        }
    }

    pub fn ledger(&self) -> Ledger {
        self.config.ledger
    }

    /// Give `identity` some of `asset`'s unit
    pub async fn credit(&self, identity: &str, asset: &Asset, amount: u128) {
        let mut chain = self.chain.lock().await;
        *chain
            .balances
            .entry((identity.to_string(), asset.contract.clone()))
            .or_insert(0) += amount;
    }

    /// Mine `count` blocks
    pub async fn mine(&self, count: u64) -> Height {
        let mut chain = self.chain.lock().await;
        for _ in 0..count {
            self.mine_block(&mut chain);
        }
        Height {
            number: chain.height,
            timestamp: chain.time,
        }
    }

    /// Mine one block `secs` seconds after the current tip
    pub async fn advance_time(&self, secs: u64) -> Height {
        let mut chain = self.chain.lock().await;
        chain.time += secs.saturating_sub(self.config.block_time_secs);
        self.mine_block(&mut chain);
        Height {
            number: chain.height,
            timestamp: chain.time,
        }
    }

    /// Make the next `count` adapter calls fail with a transient error
    pub async fn fail_next(&self, count: u32) {
        self.chain.lock().await.fail_next = count;
    }

    /// Keep new transactions out of blocks while enabled
    pub async fn set_withholding(&self, withholding: bool) {
        self.chain.lock().await.withholding = withholding;
    }

    pub async fn mempool_len(&self) -> usize {
        self.chain.lock().await.mempool.len()
    }

    /// How many times funds were actually locked in a contract
    pub async fn funding_count(&self, swap_id: SwapId, side: Side) -> u32 {
        self.chain
            .lock()
            .await
            .fundings
            .get(&(swap_id, side))
            .copied()
            .unwrap_or(0)
    }

    /// Spawn a task mining one block per `interval`
    pub fn spawn_miner(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let ledger = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let height = ledger.mine(1).await;
                debug!(ledger = %ledger.config.name, height = height.number, "Mined block");
            }
        })
    }

    /// Wall-clock ledgers keep time between blocks
    fn sync_clock(&self, chain: &mut Chain) {
        if self.config.wall_clock {
            let now = Utc::now().timestamp().max(0) as u64;
            chain.time = chain.time.max(now);
        }
    }

    fn mine_block(&self, chain: &mut Chain) {
        chain.height += 1;
        if self.config.wall_clock {
            self.sync_clock(chain);
        } else {
            chain.time += self.config.block_time_secs;
        }

        if chain.withholding {
            return;
        }

        let pending = std::mem::take(&mut chain.mempool);
        for (tx, effect) in pending {
            match check(chain, &effect) {
                Ok(()) => {
                    apply(chain, &effect);
                    chain.included.insert(tx.clone(), chain.height);
                    debug!(
                        ledger = %self.config.name,
                        tx = %tx,
                        block = chain.height,
                        "Transaction included"
                    );
                }
                Err(e) => {
                    warn!(
                        ledger = %self.config.name,
                        tx = %tx,
                        "Dropping transaction at inclusion: {}",
                        e
                    );
                }
            }
        }
    }

    fn take_fault(&self, chain: &mut Chain) -> SwapResult<()> {
        if chain.fail_next > 0 {
            chain.fail_next -= 1;
            return Err(SwapError::TransientLedger {
                ledger: self.config.name.clone(),
                message: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    async fn submit(&self, kind: ActionKind, effect: Effect) -> SwapResult<TxRef> {
        let mut chain = self.chain.lock().await;
        self.take_fault(&mut chain)?;
        self.sync_clock(&mut chain);

        let (swap_id, side) = effect.key();
        if let Some(tx) = chain.submitted.get(&(swap_id, side, kind)) {
            debug!(
                ledger = %self.config.name,
                %swap_id,
                %side,
                %kind,
                "Duplicate submission, returning original tx"
            );
            return Ok(tx.clone());
        }

        check(&chain, &effect).map_err(|e| self.label(e))?;

        chain.next_seq += 1;
        let tx = self.tx_ref(chain.next_seq, swap_id, side, kind);
        chain.submitted.insert((swap_id, side, kind), tx.clone());
        chain.mempool.push((tx.clone(), effect));

        info!(
            ledger = %self.config.name,
            %swap_id,
            %side,
            %kind,
            tx = %tx,
            "Transaction accepted into mempool"
        );

        if self.config.instant_mining && !chain.withholding {
            self.mine_block(&mut chain);
        }

        Ok(tx)
    }

    fn tx_ref(&self, seq: u64, swap_id: SwapId, side: Side, kind: ActionKind) -> TxRef {
        let mut hasher = Sha3_256::new();
        hasher.update(self.config.name.as_bytes());
        hasher.update(seq.to_be_bytes());
        hasher.update(swap_id.to_string().as_bytes());
        hasher.update(side.to_string().as_bytes());
        hasher.update(kind.to_string().as_bytes());
        TxRef::new(format!("0x{}", hex::encode(hasher.finalize())))
    }

    fn label(&self, error: SwapError) -> SwapError {
        match error {
            SwapError::ContractRejected { message, .. } => SwapError::ContractRejected {
                ledger: self.config.name.clone(),
                message,
            },
            SwapError::InsufficientBalance {
                identity, have, need, ..
            } => SwapError::InsufficientBalance {
                ledger: self.config.name.clone(),
                identity,
                have,
                need,
            },
            other => other,
        }
    }
}

/// Build every enabled `[ledgers.*]` section, credit opening balances and
/// start block production where an interval is configured
pub async fn from_settings(settings: &Settings) -> (LedgerSet, Vec<JoinHandle<()>>) {
    let genesis = Utc::now().timestamp().max(0) as u64;
    let mut ledgers = LedgerSet::new();
    let mut miners = Vec::new();

    for (name, config) in settings.enabled_ledgers() {
        let mut sim = SimulatedLedgerConfig::new(name.clone(), config.ledger(), genesis);
        sim.confirmations = config.confirmations;
        sim.instant_mining = config.instant_mining;
        sim.wall_clock = config.wall_clock;
        if config.block_interval_ms > 0 {
            sim.block_time_secs = (config.block_interval_ms / 1_000).max(1);
        }

        let ledger = Arc::new(SimulatedLedger::new(sim));
        for balance in &config.balances {
            ledger
                .credit(&balance.identity, &balance.asset(config.kind), balance.amount)
                .await;
            info!(
                ledger = %name,
                identity = %balance.identity,
                "Credited opening balance of {}",
                balance.amount
            );
        }

        if config.block_interval_ms > 0 {
            miners.push(ledger.spawn_miner(Duration::from_millis(config.block_interval_ms)));
        }

        info!(
            ledger = %name,
            kind = %config.kind,
            confirmations = config.confirmations,
            wall_clock = config.wall_clock,
            "Simulated ledger ready"
        );
        ledgers.insert(config.ledger(), ledger);
    }

    (ledgers, miners)
}

fn rejected(message: impl Into<String>) -> SwapError {
    SwapError::ContractRejected {
        ledger: String::new(),
        message: message.into(),
    }
}

/// Validate an effect against the current chain state
fn check(chain: &Chain, effect: &Effect) -> SwapResult<()> {
    let state = chain
        .contracts
        .get(&effect.key())
        .map(|c| c.state.clone())
        .unwrap_or(HtlcState::NotDeployed);

    match effect {
        Effect::Deploy(_) => Ok(()),
        Effect::Fund(htlc) => {
            if state.was_funded() {
                return Err(rejected("contract already funded"));
            }
            if chain.time >= htlc.expiry {
                return Err(SwapError::ExpiryViolation {
                    swap_id: htlc.swap_id,
                    side: htlc.side,
                    message: "cannot fund an expired contract".to_string(),
                });
            }
            let key = (htlc.refund_identity.clone(), htlc.asset.contract.clone());
            let have = chain.balances.get(&key).copied().unwrap_or(0);
            if have < htlc.asset.quantity {
                return Err(SwapError::InsufficientBalance {
                    ledger: String::new(),
                    identity: htlc.refund_identity.clone(),
                    have,
                    need: htlc.asset.quantity,
                });
            }
            Ok(())
        }
        Effect::Redeem(htlc, secret) => {
            if !matches!(state, HtlcState::Funded { .. }) {
                return Err(rejected(format!("cannot redeem a {} contract", state.name())));
            }
            if !htlc.secret_hash.matches(secret) {
                return Err(rejected("secret does not match secret hash"));
            }
            if chain.time >= htlc.expiry {
                return Err(SwapError::ExpiryViolation {
                    swap_id: htlc.swap_id,
                    side: htlc.side,
                    message: format!("redeem at {} is past expiry {}", chain.time, htlc.expiry),
                });
            }
            Ok(())
        }
        Effect::Refund(htlc) => {
            if !matches!(state, HtlcState::Funded { .. }) {
                return Err(rejected(format!("cannot refund a {} contract", state.name())));
            }
            if chain.time < htlc.expiry {
                return Err(SwapError::ExpiryViolation {
                    swap_id: htlc.swap_id,
                    side: htlc.side,
                    message: format!("refund at {} is before expiry {}", chain.time, htlc.expiry),
                });
            }
            Ok(())
        }
    }
}

fn apply(chain: &mut Chain, effect: &Effect) {
    let key = effect.key();
    match effect {
        Effect::Deploy(_) => {
            chain.contracts.entry(key).or_insert(Contract {
                state: HtlcState::Deployed,
            });
        }
        Effect::Fund(htlc) => {
            let funder = (htlc.refund_identity.clone(), htlc.asset.contract.clone());
            if let Some(balance) = chain.balances.get_mut(&funder) {
                *balance = balance.saturating_sub(htlc.asset.quantity);
            }
            chain.contracts.insert(
                key,
                Contract {
                    state: HtlcState::Funded {
                        quantity: htlc.asset.quantity,
                    },
                },
            );
            *chain.fundings.entry(key).or_insert(0) += 1;
        }
        Effect::Redeem(htlc, secret) => {
            let redeemer = (htlc.redeem_identity.clone(), htlc.asset.contract.clone());
            *chain.balances.entry(redeemer).or_insert(0) += htlc.asset.quantity;
            chain.contracts.insert(
                key,
                Contract {
                    state: HtlcState::Redeemed { secret: *secret },
                },
            );
        }
        Effect::Refund(htlc) => {
            let refundee = (htlc.refund_identity.clone(), htlc.asset.contract.clone());
            *chain.balances.entry(refundee).or_insert(0) += htlc.asset.quantity;
            chain.contracts.insert(
                key,
                Contract {
                    state: HtlcState::Refunded,
                },
            );
        }
    }
}

#[async_trait]
impl LedgerAdapter for SimulatedLedger {
    fn name(&self) -> String {
        self.config.name.clone()
    }

    async fn deploy_contract(&self, htlc: &HtlcParams) -> SwapResult<TxRef> {
        self.submit(ActionKind::Deploy, Effect::Deploy(htlc.clone()))
            .await
    }

    async fn fund_contract(&self, htlc: &HtlcParams) -> SwapResult<TxRef> {
        self.submit(ActionKind::Fund, Effect::Fund(htlc.clone())).await
    }

    async fn redeem(&self, htlc: &HtlcParams, secret: &Secret) -> SwapResult<TxRef> {
        self.submit(ActionKind::Redeem, Effect::Redeem(htlc.clone(), *secret))
            .await
    }

    async fn refund(&self, htlc: &HtlcParams) -> SwapResult<TxRef> {
        self.submit(ActionKind::Refund, Effect::Refund(htlc.clone()))
            .await
    }

    async fn query_confirmed(&self, tx: &TxRef) -> SwapResult<bool> {
        let mut chain = self.chain.lock().await;
        self.take_fault(&mut chain)?;
        Ok(match chain.included.get(tx) {
            Some(block) => chain.height + 1 - block >= self.config.confirmations,
            None => false,
        })
    }

    async fn current_height(&self) -> SwapResult<Height> {
        let mut chain = self.chain.lock().await;
        self.take_fault(&mut chain)?;
        self.sync_clock(&mut chain);
        Ok(Height {
            number: chain.height,
            timestamp: chain.time,
        })
    }

    async fn observe(&self, htlc: &HtlcParams) -> SwapResult<HtlcState> {
        let mut chain = self.chain.lock().await;
        self.take_fault(&mut chain)?;
        Ok(chain
            .contracts
            .get(&(htlc.swap_id, htlc.side))
            .map(|c| c.state.clone())
            .unwrap_or(HtlcState::NotDeployed))
    }

    async fn balance(&self, identity: &str, asset: &Asset) -> SwapResult<u128> {
        let mut chain = self.chain.lock().await;
        self.take_fault(&mut chain)?;
        Ok(chain
            .balances
            .get(&(identity.to_string(), asset.contract.clone()))
            .copied()
            .unwrap_or(0))
    }
}
