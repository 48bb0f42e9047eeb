//! Swap engine: operator operations and per-swap workers

use super::machine::{StepOutcome, SwapStateMachine};
use crate::config::EngineConfig;
use crate::error::{SwapError, SwapResult};
use crate::events::{EventBus, SwapEvent};
use crate::ledger::{ActorContext, LedgerHealth};
use crate::state::{SwapEntry, SwapRegistry};
use crate::swap::{
    Asset, Ledger, Role, Secret, SwapAcceptance, SwapDescriptor, SwapId, SwapProposal, SwapState,
    SwapStatus,
};
use crate::tx::{ActionScheduler, SchedulerConfig};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Hosts all swaps of one actor
pub struct SwapEngine {
    /// Ledgers and identity of the local party
    ctx: Arc<ActorContext>,
    registry: Arc<SwapRegistry>,
    machine: Arc<SwapStateMachine>,
    config: EngineConfig,
    events: EventBus,
    /// One task per accepted swap
    workers: DashMap<SwapId, JoinHandle<()>>,
    shutdown: Arc<RwLock<bool>>,
}

impl SwapEngine {
    pub fn new(ctx: ActorContext, config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let scheduler = Arc::new(ActionScheduler::new(SchedulerConfig::from(&config)));
        let machine = Arc::new(SwapStateMachine::new(
            scheduler,
            events.clone(),
            config.max_consecutive_failures,
        ));

        Self {
            ctx: Arc::new(ctx),
            registry: Arc::new(SwapRegistry::new()),
            machine,
            config,
            events,
            workers: DashMap::new(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn actor(&self) -> &str {
        &self.ctx.name
    }

    pub fn registry(&self) -> &Arc<SwapRegistry> {
        &self.registry
    }

    /// Register a negotiated swap for the local party
    ///
    /// The alpha party must bring the secret; the beta party must not.
    pub async fn create_swap(
        &self,
        descriptor: SwapDescriptor,
        role: Role,
        secret: Option<Secret>,
    ) -> SwapResult<SwapStatus> {
        descriptor.validate()?;

        match (role, &secret) {
            (Role::Alpha, None) => {
                return Err(SwapError::Negotiation(
                    "alpha party must supply the secret".to_string(),
                ))
            }
            (Role::Alpha, Some(secret)) if !descriptor.secret_hash.matches(secret) => {
                return Err(SwapError::Negotiation(format!(
                    "secret does not match secret hash {}",
                    descriptor.secret_hash
                )))
            }
            (Role::Beta, Some(_)) => {
                return Err(SwapError::Negotiation(
                    "beta party cannot hold the secret".to_string(),
                ))
            }
            _ => {}
        }

        self.ctx.ledger(&descriptor.alpha_ledger)?;
        let beta = self.ctx.ledger(&descriptor.beta_ledger)?;
        let tip = beta.current_height().await?;
        if tip.timestamp >= descriptor.beta_expiry {
            return Err(SwapError::Negotiation(format!(
                "beta expiry {} already elapsed on {} (block time {})",
                descriptor.beta_expiry,
                beta.name(),
                tip.timestamp
            )));
        }

        let swap_id = descriptor.swap_id;
        let (entry, created) = self
            .registry
            .create_if_absent(descriptor, SwapState::new(role, secret))?;

        if created {
            info!(%swap_id, %role, actor = %self.ctx.name, "Swap created");
            self.events.emit(SwapEvent::created(swap_id, role));
        } else {
            let existing = entry.snapshot().await.role;
            if existing != role {
                return Err(SwapError::Negotiation(format!(
                    "swap {} is already registered as the {} party",
                    swap_id, existing
                )));
            }
            debug!(%swap_id, "Swap already registered");
        }

        Ok(entry.status().await)
    }

    /// Register a swap straight from both handshake messages
    pub async fn create_swap_from_handshake(
        &self,
        swap_id: SwapId,
        proposal: SwapProposal,
        acceptance: SwapAcceptance,
        role: Role,
        secret: Option<Secret>,
    ) -> SwapResult<SwapStatus> {
        let descriptor = SwapDescriptor::from_handshake(swap_id, proposal, acceptance)?;
        self.create_swap(descriptor, role, secret).await
    }

    /// `Negotiated -> Accepted` and start driving the swap
    pub async fn accept_swap(&self, swap_id: SwapId) -> SwapResult<SwapStatus> {
        let entry = self.registry.get(&swap_id)?;
        self.machine.accept(&entry).await?;
        self.spawn_worker(entry.clone());
        Ok(entry.status().await)
    }

    /// Abort a swap that has not broadcast any funding
    pub async fn abort_swap(&self, swap_id: SwapId) -> SwapResult<SwapStatus> {
        let entry = self.registry.get(&swap_id)?;
        self.machine.abort(&entry).await?;
        info!(%swap_id, "Swap aborted by operator");
        Ok(entry.status().await)
    }

    pub async fn get_swap_status(&self, swap_id: SwapId) -> SwapResult<SwapStatus> {
        Ok(self.registry.get(&swap_id)?.status().await)
    }

    pub async fn list_swaps(&self) -> Vec<SwapStatus> {
        self.registry.statuses().await
    }

    pub async fn ledger_health(&self) -> Vec<LedgerHealth> {
        self.ctx.health_check().await
    }

    /// Balance of `identity` in `asset`'s unit on `ledger`
    pub async fn balance(&self, ledger: &Ledger, identity: &str, asset: &Asset) -> SwapResult<u128> {
        self.ctx.ledger(ledger)?.balance(identity, asset).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SwapEvent> {
        self.events.subscribe()
    }

    /// Wait until `swap_id` reaches a terminal phase
    pub async fn wait_terminal(&self, swap_id: SwapId, timeout: Duration) -> SwapResult<SwapStatus> {
        let entry = self.registry.get(&swap_id)?;
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        let wait = async {
            loop {
                let status = entry.status().await;
                if status.terminal {
                    return status;
                }
                tokio::time::sleep(poll).await;
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            SwapError::Internal(format!("swap {} not terminal after {:?}", swap_id, timeout))
        })
    }

    fn spawn_worker(&self, entry: Arc<SwapEntry>) {
        let swap_id = entry.id();
        let ctx = self.ctx.clone();
        let machine = self.machine.clone();
        let shutdown = self.shutdown.clone();
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(%swap_id, "Swap worker started");

            loop {
                ticker.tick().await;
                if *shutdown.read().await {
                    debug!(%swap_id, "Swap worker stopping for shutdown");
                    break;
                }

                match machine.step(&ctx, &entry).await {
                    Ok(StepOutcome::Terminal(phase)) => {
                        info!(%swap_id, %phase, "Swap finished");
                        break;
                    }
                    Ok(StepOutcome::Progressed { to, .. }) if to.is_terminal() => {
                        info!(%swap_id, phase = %to, "Swap finished");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(%swap_id, "Swap step failed: {}", e);
                        if entry.phase().await.is_terminal() {
                            break;
                        }
                    }
                }
            }
        });

        if let Some(previous) = self.workers.insert(swap_id, handle) {
            warn!(%swap_id, "Replacing existing swap worker");
            previous.abort();
        }
    }

    /// Housekeeping loop; returns once `stop` is called
    pub async fn run(&self) -> SwapResult<()> {
        let mut cleanup_interval =
            interval(Duration::from_secs(self.config.cleanup_interval_secs.max(1)));
        let mut status_interval =
            interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));

        info!(actor = %self.ctx.name, "Swap engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                _ = cleanup_interval.tick() => {
                    self.cleanup().await;
                }
                _ = status_interval.tick() => {
                    crate::metrics::set_active_swaps(self.registry.active_count().await);
                }
            }
        }

        info!(actor = %self.ctx.name, "Swap engine stopped");
        Ok(())
    }

    /// Drop terminal swaps past retention and reap finished workers
    pub async fn cleanup(&self) -> Vec<SwapId> {
        let retention = Duration::from_secs(self.config.terminal_retention_secs);
        let removed = self.registry.remove_terminal(retention);
        for swap_id in &removed {
            self.workers.remove(swap_id);
        }
        self.workers.retain(|_, handle| !handle.is_finished());
        removed
    }

    /// Signal shutdown and wait for workers to finish their current step
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!(actor = %self.ctx.name, "Swap engine shutdown initiated");

        let ids: Vec<SwapId> = self.workers.iter().map(|w| *w.key()).collect();
        let handles: Vec<JoinHandle<()>> = ids
            .iter()
            .filter_map(|id| self.workers.remove(id).map(|(_, handle)| handle))
            .collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Swap worker ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerAdapter, LedgerSet, SimulatedLedger, SimulatedLedgerConfig};
    use crate::swap::descriptor::fixtures::erc20_for_btc;
    use crate::swap::{Ledger, LedgerKind, Network, Phase, Side};

    const GENESIS: u64 = 1_700_000_000;

    struct Ledgers {
        eth: Arc<SimulatedLedger>,
        btc: Arc<SimulatedLedger>,
    }

    impl Ledgers {
        fn new() -> Self {
            Self {
                eth: Arc::new(SimulatedLedger::new(SimulatedLedgerConfig::new(
                    "ethereum-regtest",
                    Ledger::new(LedgerKind::Ethereum, Network::Regtest),
                    GENESIS,
                ))),
                btc: Arc::new(SimulatedLedger::new(SimulatedLedgerConfig::new(
                    "bitcoin-regtest",
                    Ledger::new(LedgerKind::Bitcoin, Network::Regtest),
                    GENESIS,
                ))),
            }
        }

        fn engine(&self, actor: &str) -> SwapEngine {
            let ledgers = LedgerSet::new()
                .with(self.eth.ledger(), self.eth.clone())
                .with(self.btc.ledger(), self.btc.clone());
            let config = EngineConfig {
                poll_interval_ms: 10,
                action_timeout_ms: 200,
                retry_delay_ms: 1,
                max_retry_delay_ms: 10,
                terminal_retention_secs: 0,
                ..EngineConfig::default()
            };
            SwapEngine::new(ActorContext::new(actor, ledgers), config)
        }
    }

    #[tokio::test]
    async fn two_parties_complete_a_swap() {
        let ledgers = Ledgers::new();
        let taker = ledgers.engine("taker");
        let maker = ledgers.engine("maker");

        let secret = Secret::generate();
        let descriptor = erc20_for_btc(GENESIS, &secret);
        let alpha_asset = descriptor.alpha_asset.clone();
        let beta_asset = descriptor.beta_asset.clone();
        ledgers
            .eth
            .credit("taker-eth", &alpha_asset, alpha_asset.quantity)
            .await;
        ledgers
            .btc
            .credit("maker-btc", &beta_asset, beta_asset.quantity)
            .await;

        let swap_id = descriptor.swap_id;
        taker
            .create_swap(descriptor.clone(), Role::Alpha, Some(secret))
            .await
            .unwrap();
        maker
            .create_swap(descriptor, Role::Beta, None)
            .await
            .unwrap();

        let mut maker_events = maker.subscribe_events();
        maker.accept_swap(swap_id).await.unwrap();
        taker.accept_swap(swap_id).await.unwrap();

        let timeout = Duration::from_secs(10);
        let taker_status = taker.wait_terminal(swap_id, timeout).await.unwrap();
        let maker_status = maker.wait_terminal(swap_id, timeout).await.unwrap();

        assert_eq!(taker_status.phase, Phase::BetaRedeemed);
        assert_eq!(maker_status.phase, Phase::AlphaRedeemed);
        assert!(taker_status.error.is_none());
        assert!(maker_status.error.is_none());

        let eth = &ledgers.eth;
        let btc = &ledgers.btc;
        assert_eq!(eth.balance("taker-eth", &alpha_asset).await.unwrap(), 0);
        assert_eq!(
            eth.balance("maker-eth", &alpha_asset).await.unwrap(),
            alpha_asset.quantity
        );
        assert_eq!(btc.balance("maker-btc", &beta_asset).await.unwrap(), 0);
        assert_eq!(
            btc.balance("taker-btc", &beta_asset).await.unwrap(),
            beta_asset.quantity
        );
        assert_eq!(eth.funding_count(swap_id, Side::Alpha).await, 1);
        assert_eq!(btc.funding_count(swap_id, Side::Beta).await, 1);

        let mut phases = Vec::new();
        while let Ok(event) = maker_events.try_recv() {
            phases.push(event.to);
        }
        assert_eq!(
            phases,
            vec![
                Phase::Accepted,
                Phase::AlphaDeployed,
                Phase::AlphaFunded,
                Phase::BetaFunded,
                Phase::AlphaRedeemed
            ]
        );

        taker.stop().await;
        maker.stop().await;
    }

    #[tokio::test]
    async fn create_swap_checks_the_secret_against_the_role() {
        let ledgers = Ledgers::new();
        let engine = ledgers.engine("taker");
        let secret = Secret::generate();
        let descriptor = erc20_for_btc(GENESIS, &secret);

        let missing = engine
            .create_swap(descriptor.clone(), Role::Alpha, None)
            .await;
        assert!(matches!(missing, Err(SwapError::Negotiation(_))));

        let wrong = engine
            .create_swap(descriptor.clone(), Role::Alpha, Some(Secret::generate()))
            .await;
        assert!(matches!(wrong, Err(SwapError::Negotiation(_))));

        let leaked = engine
            .create_swap(descriptor.clone(), Role::Beta, Some(secret))
            .await;
        assert!(matches!(leaked, Err(SwapError::Negotiation(_))));

        let status = engine
            .create_swap(descriptor.clone(), Role::Alpha, Some(secret))
            .await
            .unwrap();
        assert_eq!(status.phase, Phase::Negotiated);
        assert_eq!(status.descriptor_digest, descriptor.digest().unwrap());

        let again = engine
            .create_swap(descriptor.clone(), Role::Alpha, Some(secret))
            .await
            .unwrap();
        assert_eq!(again.swap_id, status.swap_id);
        assert_eq!(engine.list_swaps().await.len(), 1);
    }

    #[tokio::test]
    async fn create_swap_rejects_bad_expiries() {
        let ledgers = Ledgers::new();
        let engine = ledgers.engine("maker");

        let mut inverted = erc20_for_btc(GENESIS, &Secret::generate());
        inverted.alpha_expiry = inverted.beta_expiry;
        let result = engine.create_swap(inverted, Role::Beta, None).await;
        assert!(matches!(result, Err(SwapError::Negotiation(_))));

        ledgers.btc.advance_time(3_600).await;
        let stale = erc20_for_btc(GENESIS, &Secret::generate());
        let result = engine.create_swap(stale, Role::Beta, None).await;
        assert!(matches!(result, Err(SwapError::Negotiation(_))));
        assert!(engine.list_swaps().await.is_empty());
    }

    #[tokio::test]
    async fn operator_operations_on_unknown_or_settled_swaps() {
        let ledgers = Ledgers::new();
        let engine = ledgers.engine("maker");
        let unknown = SwapId::new();

        assert_eq!(
            engine.get_swap_status(unknown).await.unwrap_err(),
            SwapError::SwapNotFound(unknown)
        );
        assert!(matches!(
            engine.abort_swap(unknown).await,
            Err(SwapError::SwapNotFound(_))
        ));

        let descriptor = erc20_for_btc(GENESIS, &Secret::generate());
        let swap_id = descriptor.swap_id;
        engine
            .create_swap(descriptor, Role::Beta, None)
            .await
            .unwrap();

        let aborted = engine.abort_swap(swap_id).await.unwrap();
        assert_eq!(aborted.phase, Phase::Aborted);
        assert!(aborted.terminal);

        let accept = engine.accept_swap(swap_id).await;
        assert!(matches!(
            accept,
            Err(SwapError::InvalidStateTransition { from: Phase::Aborted, .. })
        ));

        assert_eq!(engine.cleanup().await, vec![swap_id]);
        assert!(engine.list_swaps().await.is_empty());
    }

    #[tokio::test]
    async fn run_returns_after_stop() {
        let ledgers = Ledgers::new();
        let engine = Arc::new(ledgers.engine("maker"));

        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn ledger_health_reports_every_ledger() {
        let ledgers = Ledgers::new();
        let engine = ledgers.engine("maker");
        ledgers.btc.fail_next(1).await;

        let mut health = engine.ledger_health().await;
        health.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(health.len(), 2);
        assert_eq!(health[0].name, "bitcoin-regtest");
        assert!(!health[0].healthy);
        assert_eq!(health[1].name, "ethereum-regtest");
        assert!(health[1].healthy);
    }
}
