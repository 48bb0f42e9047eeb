//! Per-swap state machine
//!
//! Each call to [`SwapStateMachine::step`] observes both ledgers, decides on
//! exactly one move and carries it out. Decisions are made by the pure
//! [`decide`] function so that ordering and expiry rules can be tested without
//! any ledger at all.

use crate::error::{SwapError, SwapResult};
use crate::events::{EventBus, SwapEvent};
use crate::ledger::{ActorContext, HtlcState, LedgerAdapter};
use crate::state::SwapEntry;
use crate::swap::{
    Height, PendingAction, Phase, Role, Side, SwapDescriptor, SwapId, SwapState,
};
use crate::tx::{ActionKind, ActionOutcome, ActionRequest, ActionScheduler};

use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Both ledgers as seen at the start of a step
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub alpha_tip: Height,
    pub beta_tip: Height,
    pub alpha: HtlcState,
    pub beta: HtlcState,
}

impl Observation {
    pub fn tip(&self, side: Side) -> Height {
        match side {
            Side::Alpha => self.alpha_tip,
            Side::Beta => self.beta_tip,
        }
    }

    pub fn htlc(&self, side: Side) -> &HtlcState {
        match side {
            Side::Alpha => &self.alpha,
            Side::Beta => &self.beta,
        }
    }

    /// Expiry is measured against the ledger's own block time
    pub fn expired(&self, descriptor: &SwapDescriptor, side: Side) -> bool {
        self.tip(side).timestamp >= descriptor.expiry(side)
    }
}

/// The single move a step makes
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Wait,
    Transition(Phase),
    Act { kind: ActionKind, side: Side },
    /// Record the error and move to the given phase
    Fail(SwapError, Phase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    AwaitingAcceptance,
    Waiting,
    Progressed { from: Phase, to: Phase },
    Terminal(Phase),
}

/// Decide the next move for the local party
pub fn decide(descriptor: &SwapDescriptor, state: &SwapState, obs: &Observation) -> Decision {
    if state.phase.is_terminal() || state.phase == Phase::Negotiated {
        return Decision::Wait;
    }
    match state.role {
        Role::Alpha => decide_alpha(descriptor, state, obs),
        Role::Beta => decide_beta(descriptor, state, obs),
    }
}

/// Own funding was handed to the ledger and can still be included
///
/// Ledgers reject funding at or past the contract's expiry, so once the own
/// contract has expired an unobserved funding can never lock the asset.
fn own_funding_in_flight(descriptor: &SwapDescriptor, state: &SwapState, obs: &Observation) -> bool {
    let side = state.role.funding_side();
    state.tx_for(ActionKind::Fund, side).is_some()
        && !obs.htlc(side).was_funded()
        && !obs.expired(descriptor, side)
}

/// Alpha party: fund alpha, wait for beta, redeem beta with the secret
fn decide_alpha(descriptor: &SwapDescriptor, state: &SwapState, obs: &Observation) -> Decision {
    let beta_expired = obs.expired(descriptor, Side::Beta);
    let alpha_refunded = matches!(obs.alpha, HtlcState::Refunded);

    // Own asset is locked; it comes back only once alpha expires
    let reclaim = || {
        if alpha_refunded {
            Decision::Transition(Phase::Refunded)
        } else if obs.expired(descriptor, Side::Alpha) {
            Decision::Act {
                kind: ActionKind::Refund,
                side: Side::Alpha,
            }
        } else {
            Decision::Wait
        }
    };

    match state.phase {
        Phase::Accepted => {
            if obs.alpha.is_deployed() {
                Decision::Transition(Phase::AlphaDeployed)
            } else if beta_expired {
                Decision::Transition(Phase::Expired)
            } else {
                Decision::Act {
                    kind: ActionKind::Deploy,
                    side: Side::Alpha,
                }
            }
        }
        Phase::AlphaDeployed => {
            if obs.alpha.was_funded() {
                Decision::Transition(Phase::AlphaFunded)
            } else if beta_expired {
                // A late funding still locks the asset; wait until it lands or cannot
                if own_funding_in_flight(descriptor, state, obs) {
                    Decision::Wait
                } else {
                    Decision::Transition(Phase::Expired)
                }
            } else {
                Decision::Act {
                    kind: ActionKind::Fund,
                    side: Side::Alpha,
                }
            }
        }
        Phase::AlphaFunded => {
            if beta_expired || alpha_refunded {
                reclaim()
            } else if obs.beta.is_funded_with(descriptor.beta_asset.quantity) {
                Decision::Transition(Phase::BetaFunded)
            } else {
                Decision::Wait
            }
        }
        Phase::BetaFunded => {
            if matches!(obs.beta, HtlcState::Redeemed { .. }) {
                Decision::Transition(Phase::BetaRedeemed)
            } else if beta_expired || alpha_refunded {
                reclaim()
            } else {
                Decision::Act {
                    kind: ActionKind::Redeem,
                    side: Side::Beta,
                }
            }
        }
        _ => Decision::Wait,
    }
}

/// Beta party: follow alpha, fund beta, learn the secret, redeem alpha
fn decide_beta(descriptor: &SwapDescriptor, state: &SwapState, obs: &Observation) -> Decision {
    let alpha_expired = obs.expired(descriptor, Side::Alpha);
    let beta_expired = obs.expired(descriptor, Side::Beta);
    let alpha_refunded = matches!(obs.alpha, HtlcState::Refunded);

    match state.phase {
        Phase::Accepted => {
            if obs.alpha.is_deployed() {
                Decision::Transition(Phase::AlphaDeployed)
            } else if beta_expired {
                Decision::Transition(Phase::Expired)
            } else {
                Decision::Wait
            }
        }
        Phase::AlphaDeployed => {
            if obs.alpha.is_funded_with(descriptor.alpha_asset.quantity) {
                Decision::Transition(Phase::AlphaFunded)
            } else if beta_expired || alpha_refunded {
                Decision::Transition(Phase::Expired)
            } else {
                Decision::Wait
            }
        }
        Phase::AlphaFunded => {
            if obs.beta.was_funded() {
                Decision::Transition(Phase::BetaFunded)
            } else if beta_expired || alpha_refunded {
                if own_funding_in_flight(descriptor, state, obs) {
                    Decision::Wait
                } else {
                    Decision::Transition(Phase::Expired)
                }
            } else {
                Decision::Act {
                    kind: ActionKind::Fund,
                    side: Side::Beta,
                }
            }
        }
        Phase::BetaFunded => match &obs.beta {
            _ if matches!(obs.alpha, HtlcState::Redeemed { .. }) => {
                Decision::Transition(Phase::AlphaRedeemed)
            }
            HtlcState::Refunded => Decision::Transition(Phase::Refunded),
            HtlcState::Redeemed { .. } => {
                if state.secret.is_none() {
                    Decision::Fail(
                        SwapError::InvariantViolation(format!(
                            "beta contract of swap {} redeemed but secret was not learned",
                            descriptor.swap_id
                        )),
                        Phase::Aborted,
                    )
                } else if alpha_expired {
                    Decision::Fail(
                        SwapError::ExpiryViolation {
                            swap_id: descriptor.swap_id,
                            side: Side::Alpha,
                            message: "secret revealed after alpha expiry".to_string(),
                        },
                        Phase::Expired,
                    )
                } else {
                    Decision::Act {
                        kind: ActionKind::Redeem,
                        side: Side::Alpha,
                    }
                }
            }
            _ if beta_expired => Decision::Act {
                kind: ActionKind::Refund,
                side: Side::Beta,
            },
            _ => Decision::Wait,
        },
        _ => Decision::Wait,
    }
}

/// Phase reached once `kind` on `side` confirms
fn phase_after(kind: ActionKind, side: Side) -> Option<Phase> {
    match (kind, side) {
        (ActionKind::Deploy, Side::Alpha) => Some(Phase::AlphaDeployed),
        (ActionKind::Fund, Side::Alpha) => Some(Phase::AlphaFunded),
        (ActionKind::Fund, Side::Beta) => Some(Phase::BetaFunded),
        (ActionKind::Redeem, Side::Alpha) => Some(Phase::AlphaRedeemed),
        (ActionKind::Redeem, Side::Beta) => Some(Phase::BetaRedeemed),
        (ActionKind::Refund, _) => Some(Phase::Refunded),
        (ActionKind::Deploy, Side::Beta) => None,
    }
}

/// Drives swaps for one actor
pub struct SwapStateMachine {
    scheduler: Arc<ActionScheduler>,
    events: EventBus,
    max_consecutive_failures: u32,
}

impl SwapStateMachine {
    pub fn new(
        scheduler: Arc<ActionScheduler>,
        events: EventBus,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            scheduler,
            events,
            max_consecutive_failures: max_consecutive_failures.max(1),
        }
    }

    pub fn scheduler(&self) -> &Arc<ActionScheduler> {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// `Negotiated -> Accepted`
    pub async fn accept(&self, entry: &SwapEntry) -> SwapResult<()> {
        let mut state = entry.lock_state().await;
        self.transition(entry.id(), &mut state, Phase::Accepted)?;
        Ok(())
    }

    /// Operator abort, honoured only while no funding has been broadcast
    pub async fn abort(&self, entry: &SwapEntry) -> SwapResult<Phase> {
        let mut state = entry.lock_state().await;
        if state.phase == Phase::Aborted {
            return Ok(Phase::Aborted);
        }
        if state.phase.is_terminal() || state.funding_broadcast() {
            warn!(
                swap_id = %entry.id(),
                phase = %state.phase,
                "Abort rejected, funding already broadcast"
            );
            return Err(SwapError::AbortRejected {
                swap_id: entry.id(),
                phase: state.phase,
            });
        }
        self.transition(entry.id(), &mut state, Phase::Aborted)?;
        Ok(Phase::Aborted)
    }

    /// Observe, decide, act, transition
    pub async fn step(&self, ctx: &ActorContext, entry: &SwapEntry) -> SwapResult<StepOutcome> {
        let _drive = entry.lock_drive().await;
        let swap_id = entry.id();
        let descriptor = entry.descriptor();

        {
            let state = entry.lock_state().await;
            if state.phase.is_terminal() {
                return Ok(StepOutcome::Terminal(state.phase));
            }
            if state.phase == Phase::Negotiated {
                return Ok(StepOutcome::AwaitingAcceptance);
            }
        }

        let adapters = ctx
            .ledger(&descriptor.alpha_ledger)
            .and_then(|alpha| Ok((alpha, ctx.ledger(&descriptor.beta_ledger)?)));
        let (alpha, beta) = match adapters {
            Ok(adapters) => adapters,
            Err(e) => {
                let mut state = entry.lock_state().await;
                return self.fail(swap_id, &mut state, e, Phase::Aborted);
            }
        };
        let observation = match observe(descriptor, alpha.as_ref(), beta.as_ref()).await {
            Ok(observation) => observation,
            Err(e) if e.is_retryable() => {
                debug!(%swap_id, "Observation failed, retrying next step: {}", e);
                return Ok(StepOutcome::Waiting);
            }
            Err(e) => {
                entry.lock_state().await.set_error(&e);
                return Err(e);
            }
        };

        let mut state = entry.lock_state().await;
        if state.phase.is_terminal() {
            return Ok(StepOutcome::Terminal(state.phase));
        }
        state.observe_height(Side::Alpha, observation.alpha_tip);
        state.observe_height(Side::Beta, observation.beta_tip);

        if let Err(e) = learn_secret(descriptor, &mut state, &observation) {
            return self.fail(swap_id, &mut state, e, Phase::Aborted);
        }

        let decision = decide(descriptor, &state, &observation);
        debug!(%swap_id, phase = %state.phase, ?decision, "Step decision");

        let (kind, side) = match decision {
            Decision::Wait => return Ok(StepOutcome::Waiting),
            Decision::Transition(to) => return self.transition(swap_id, &mut state, to),
            Decision::Fail(e, to) => return self.fail(swap_id, &mut state, e, to),
            Decision::Act { kind, side } => (kind, side),
        };

        let mut request = ActionRequest::new(kind, descriptor.htlc(side));
        if kind == ActionKind::Redeem {
            match state.secret {
                Some(secret) => request = request.with_secret(secret),
                None => {
                    let e = SwapError::InvariantViolation(format!(
                        "redeem on {} ledger of swap {} without a secret",
                        side, swap_id
                    ));
                    return self.fail(swap_id, &mut state, e, Phase::Aborted);
                }
            }
        }
        state.pending_action = Some(PendingAction {
            kind,
            side,
            attempts: state.consecutive_failures + 1,
        });
        drop(state);

        let adapter = match side {
            Side::Alpha => alpha,
            Side::Beta => beta,
        };
        let result = self.scheduler.execute(adapter.as_ref(), request).await;

        let mut state = entry.lock_state().await;
        state.pending_action = None;
        if state.phase.is_terminal() {
            info!(%swap_id, phase = %state.phase, "Swap became terminal while {} was in flight", kind);
            return Ok(StepOutcome::Terminal(state.phase));
        }

        match result {
            Ok(ActionOutcome::Confirmed(tx)) => {
                state.consecutive_failures = 0;
                state.error = None;
                state.record_tx(kind, side, tx);
                match phase_after(kind, side) {
                    Some(to) => self.transition(swap_id, &mut state, to),
                    None => Ok(StepOutcome::Waiting),
                }
            }
            Ok(ActionOutcome::Unconfirmed(tx)) => {
                if state.tx_for(kind, side) != Some(&tx) {
                    state.record_tx(kind, side, tx.clone());
                }
                let reason = format!("{} transaction {} not confirmed in time", kind, tx);
                self.action_failed(swap_id, &mut state, adapter.name(), kind, side, reason)
            }
            Ok(ActionOutcome::Failed(reason)) => {
                self.action_failed(swap_id, &mut state, adapter.name(), kind, side, reason)
            }
            Err(e @ SwapError::ExpiryViolation { .. }) => {
                // Next step re-observes and takes the expiry path
                warn!(%swap_id, %kind, %side, "Action rejected by expiry: {}", e);
                state.set_error(&e);
                Ok(StepOutcome::Waiting)
            }
            Err(e) => self.fail(swap_id, &mut state, e, Phase::Aborted),
        }
    }

    fn action_failed(
        &self,
        swap_id: SwapId,
        state: &mut SwapState,
        ledger: String,
        kind: ActionKind,
        side: Side,
        reason: String,
    ) -> SwapResult<StepOutcome> {
        state.consecutive_failures += 1;
        let failures = state.consecutive_failures;
        warn!(
            %swap_id,
            %kind,
            %side,
            "Action failed ({}/{}): {}",
            failures,
            self.max_consecutive_failures,
            reason
        );
        state.set_error(&SwapError::TransientLedger {
            ledger,
            message: reason,
        });

        if failures >= self.max_consecutive_failures {
            let e = SwapError::InvariantViolation(format!(
                "{} on {} ledger failed {} consecutive times",
                kind, side, failures
            ));
            return self.fail(swap_id, state, e, Phase::Aborted);
        }
        Ok(StepOutcome::Waiting)
    }

    /// Record `e` and move to `to`; forced aborts surface the error
    fn fail(
        &self,
        swap_id: SwapId,
        state: &mut SwapState,
        e: SwapError,
        to: Phase,
    ) -> SwapResult<StepOutcome> {
        error!(%swap_id, phase = %state.phase, "Swap failed, moving to {}: {}", to, e);
        state.set_error(&e);
        let outcome = self.transition(swap_id, state, to)?;
        if to == Phase::Aborted {
            return Err(e);
        }
        Ok(outcome)
    }

    fn transition(
        &self,
        swap_id: SwapId,
        state: &mut SwapState,
        to: Phase,
    ) -> SwapResult<StepOutcome> {
        let from = state.phase;
        state.transition(to)?;
        info!(%swap_id, role = %state.role, %from, %to, "Swap phase changed");
        self.events
            .emit(SwapEvent::transition(swap_id, state.role, from, to));
        Ok(StepOutcome::Progressed { from, to })
    }
}

async fn observe(
    descriptor: &SwapDescriptor,
    alpha: &dyn LedgerAdapter,
    beta: &dyn LedgerAdapter,
) -> SwapResult<Observation> {
    let alpha_htlc = descriptor.htlc(Side::Alpha);
    let beta_htlc = descriptor.htlc(Side::Beta);
    let (alpha_tip, beta_tip, alpha_state, beta_state) = futures::try_join!(
        alpha.current_height(),
        beta.current_height(),
        alpha.observe(&alpha_htlc),
        beta.observe(&beta_htlc),
    )?;
    Ok(Observation {
        alpha_tip,
        beta_tip,
        alpha: alpha_state,
        beta: beta_state,
    })
}

/// Pick up the secret from a beta redemption
fn learn_secret(
    descriptor: &SwapDescriptor,
    state: &mut SwapState,
    obs: &Observation,
) -> SwapResult<()> {
    if state.secret.is_some() {
        return Ok(());
    }
    let Some(secret) = obs.beta.revealed_secret() else {
        return Ok(());
    };
    if !descriptor.secret_hash.matches(&secret) {
        return Err(SwapError::InvariantViolation(format!(
            "secret revealed on beta ledger of swap {} does not match {}",
            descriptor.swap_id, descriptor.secret_hash
        )));
    }
    info!(swap_id = %descriptor.swap_id, "Learned secret from beta redemption");
    state.secret = Some(secret);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerSet, SimulatedLedger, SimulatedLedgerConfig};
    use crate::state::SwapRegistry;
    use crate::swap::descriptor::fixtures::erc20_for_btc;
    use crate::swap::{Ledger, LedgerKind, Network, Secret};
    use crate::tx::{SchedulerConfig, TxRef};
    use std::time::Duration;

    const GENESIS: u64 = 1_700_000_000;

    struct Harness {
        eth: Arc<SimulatedLedger>,
        btc: Arc<SimulatedLedger>,
        ctx: ActorContext,
        machine: Arc<SwapStateMachine>,
        registry: SwapRegistry,
        secret: Secret,
        descriptor: SwapDescriptor,
    }

    impl Harness {
        fn new() -> Self {
            let eth = Arc::new(SimulatedLedger::new(SimulatedLedgerConfig::new(
                "ethereum-regtest",
                Ledger::new(LedgerKind::Ethereum, Network::Regtest),
                GENESIS,
            )));
            let btc = Arc::new(SimulatedLedger::new(SimulatedLedgerConfig::new(
                "bitcoin-regtest",
                Ledger::new(LedgerKind::Bitcoin, Network::Regtest),
                GENESIS,
            )));
            let ctx = ActorContext::new(
                "test",
                LedgerSet::new()
                    .with(eth.ledger(), eth.clone())
                    .with(btc.ledger(), btc.clone()),
            );
            let scheduler = Arc::new(ActionScheduler::new(SchedulerConfig {
                poll_interval: Duration::from_millis(5),
                action_timeout: Duration::from_millis(40),
                max_retries: 3,
                retry_delay: Duration::from_millis(1),
                max_retry_delay: Duration::from_millis(4),
            }));
            let secret = Secret::generate();
            let descriptor = erc20_for_btc(GENESIS, &secret);

            Self {
                eth,
                btc,
                ctx,
                machine: Arc::new(SwapStateMachine::new(scheduler, EventBus::new(64), 3)),
                registry: SwapRegistry::new(),
                secret,
                descriptor,
            }
        }

        async fn accepted(&self, role: Role) -> Arc<SwapEntry> {
            let secret = match role {
                Role::Alpha => Some(self.secret),
                Role::Beta => None,
            };
            let (entry, _) = self
                .registry
                .create_if_absent(self.descriptor.clone(), SwapState::new(role, secret))
                .unwrap();
            self.machine.accept(&entry).await.unwrap();
            entry
        }

        async fn step(&self, entry: &SwapEntry) -> SwapResult<StepOutcome> {
            self.machine.step(&self.ctx, entry).await
        }

        async fn expect_progress(&self, entry: &SwapEntry, to: Phase) {
            match self.step(entry).await.unwrap() {
                StepOutcome::Progressed { to: reached, .. } => assert_eq!(reached, to),
                other => panic!("expected progress to {}, got {:?}", to, other),
            }
        }
    }

    fn observation(alpha: HtlcState, beta: HtlcState, alpha_time: u64, beta_time: u64) -> Observation {
        Observation {
            alpha_tip: Height {
                number: 1,
                timestamp: alpha_time,
            },
            beta_tip: Height {
                number: 1,
                timestamp: beta_time,
            },
            alpha,
            beta,
        }
    }

    fn state_in(role: Role, phase: Phase) -> SwapState {
        let mut state = SwapState::new(role, None);
        state.phase = phase;
        state
    }

    #[test]
    fn expiry_wins_over_funding_for_beta_party() {
        let descriptor = erc20_for_btc(GENESIS, &Secret::generate());
        let state = state_in(Role::Beta, Phase::AlphaFunded);
        let funded = HtlcState::Funded {
            quantity: descriptor.alpha_asset.quantity,
        };

        let fresh = observation(funded.clone(), HtlcState::NotDeployed, GENESIS, GENESIS);
        assert_eq!(
            decide(&descriptor, &state, &fresh),
            Decision::Act {
                kind: ActionKind::Fund,
                side: Side::Beta
            }
        );

        let late = observation(funded, HtlcState::NotDeployed, GENESIS, descriptor.beta_expiry);
        assert_eq!(
            decide(&descriptor, &state, &late),
            Decision::Transition(Phase::Expired)
        );
    }

    #[test]
    fn alpha_party_never_redeems_after_beta_expiry() {
        let descriptor = erc20_for_btc(GENESIS, &Secret::generate());
        let state = state_in(Role::Alpha, Phase::BetaFunded);
        let alpha = HtlcState::Funded {
            quantity: descriptor.alpha_asset.quantity,
        };
        let beta = HtlcState::Funded {
            quantity: descriptor.beta_asset.quantity,
        };

        let between = observation(alpha.clone(), beta.clone(), GENESIS, descriptor.beta_expiry);
        assert_eq!(decide(&descriptor, &state, &between), Decision::Wait);

        let after = observation(alpha, beta, descriptor.alpha_expiry, descriptor.beta_expiry);
        assert_eq!(
            decide(&descriptor, &state, &after),
            Decision::Act {
                kind: ActionKind::Refund,
                side: Side::Alpha
            }
        );
    }

    #[test]
    fn short_beta_funding_is_not_accepted() {
        let descriptor = erc20_for_btc(GENESIS, &Secret::generate());
        let state = state_in(Role::Alpha, Phase::AlphaFunded);
        let obs = observation(
            HtlcState::Funded {
                quantity: descriptor.alpha_asset.quantity,
            },
            HtlcState::Funded {
                quantity: descriptor.beta_asset.quantity - 1,
            },
            GENESIS,
            GENESIS,
        );
        assert_eq!(decide(&descriptor, &state, &obs), Decision::Wait);
    }

    #[test]
    fn terminal_and_unaccepted_swaps_wait() {
        let descriptor = erc20_for_btc(GENESIS, &Secret::generate());
        let obs = observation(HtlcState::NotDeployed, HtlcState::NotDeployed, GENESIS, GENESIS);
        for phase in [Phase::Negotiated, Phase::Refunded, Phase::AlphaRedeemed] {
            let state = state_in(Role::Alpha, phase);
            assert_eq!(decide(&descriptor, &state, &obs), Decision::Wait);
        }
    }

    #[tokio::test]
    async fn beta_party_happy_path_ends_alpha_redeemed() {
        let h = Harness::new();
        let alpha_htlc = h.descriptor.htlc(Side::Alpha);
        let beta_htlc = h.descriptor.htlc(Side::Beta);
        h.eth
            .credit("taker-eth", &alpha_htlc.asset, alpha_htlc.asset.quantity)
            .await;
        h.btc
            .credit("maker-btc", &beta_htlc.asset, beta_htlc.asset.quantity)
            .await;

        let entry = h.accepted(Role::Beta).await;
        assert_eq!(h.step(&entry).await.unwrap(), StepOutcome::Waiting);

        // Counterparty locks alpha
        h.eth.deploy_contract(&alpha_htlc).await.unwrap();
        h.eth.fund_contract(&alpha_htlc).await.unwrap();

        h.expect_progress(&entry, Phase::AlphaDeployed).await;
        h.expect_progress(&entry, Phase::AlphaFunded).await;
        h.expect_progress(&entry, Phase::BetaFunded).await;
        assert_eq!(h.step(&entry).await.unwrap(), StepOutcome::Waiting);

        // Counterparty redeems beta, revealing the secret
        h.btc.redeem(&beta_htlc, &h.secret).await.unwrap();

        h.expect_progress(&entry, Phase::AlphaRedeemed).await;
        assert_eq!(
            h.step(&entry).await.unwrap(),
            StepOutcome::Terminal(Phase::AlphaRedeemed)
        );

        let state = entry.snapshot().await;
        assert_eq!(state.secret, Some(h.secret));
        assert!(state.error.is_none());
        assert_eq!(
            h.eth.balance("maker-eth", &alpha_htlc.asset).await.unwrap(),
            alpha_htlc.asset.quantity
        );
        assert_eq!(
            h.btc.balance("taker-btc", &beta_htlc.asset).await.unwrap(),
            beta_htlc.asset.quantity
        );
    }

    #[tokio::test]
    async fn alpha_party_refunds_when_beta_is_never_funded() {
        let h = Harness::new();
        let alpha_htlc = h.descriptor.htlc(Side::Alpha);
        let beta_htlc = h.descriptor.htlc(Side::Beta);
        h.eth
            .credit("taker-eth", &alpha_htlc.asset, alpha_htlc.asset.quantity)
            .await;
        h.btc
            .credit("maker-btc", &beta_htlc.asset, beta_htlc.asset.quantity)
            .await;

        let entry = h.accepted(Role::Alpha).await;
        h.expect_progress(&entry, Phase::AlphaDeployed).await;
        h.expect_progress(&entry, Phase::AlphaFunded).await;

        // Beta funding is broadcast but never mined
        h.btc.set_withholding(true).await;
        h.btc.fund_contract(&beta_htlc).await.unwrap();
        assert_eq!(h.step(&entry).await.unwrap(), StepOutcome::Waiting);

        h.btc.advance_time(3_600).await;
        assert_eq!(h.step(&entry).await.unwrap(), StepOutcome::Waiting);

        h.eth.advance_time(7_200).await;
        h.btc.advance_time(3_600).await;
        h.expect_progress(&entry, Phase::Refunded).await;

        let state = entry.snapshot().await;
        assert_eq!(state.phase, Phase::Refunded);
        assert!(state.tx_for(ActionKind::Refund, Side::Alpha).is_some());
        assert_eq!(
            h.eth.balance("taker-eth", &alpha_htlc.asset).await.unwrap(),
            alpha_htlc.asset.quantity
        );
    }

    #[test]
    fn in_flight_funding_holds_off_expiry() {
        let descriptor = erc20_for_btc(GENESIS, &Secret::generate());
        let mut state = state_in(Role::Alpha, Phase::AlphaDeployed);
        state.record_tx(ActionKind::Fund, Side::Alpha, TxRef::new("0xfund"));

        let beta_expired = observation(
            HtlcState::Deployed,
            HtlcState::NotDeployed,
            GENESIS,
            descriptor.beta_expiry,
        );
        assert_eq!(decide(&descriptor, &state, &beta_expired), Decision::Wait);

        // Funding can no longer be included once alpha has expired
        let both_expired = observation(
            HtlcState::Deployed,
            HtlcState::NotDeployed,
            descriptor.alpha_expiry,
            descriptor.beta_expiry,
        );
        assert_eq!(
            decide(&descriptor, &state, &both_expired),
            Decision::Transition(Phase::Expired)
        );

        let mut state = state_in(Role::Beta, Phase::AlphaFunded);
        let alpha_refunded = observation(HtlcState::Refunded, HtlcState::Deployed, GENESIS, GENESIS);
        assert_eq!(
            decide(&descriptor, &state, &alpha_refunded),
            Decision::Transition(Phase::Expired)
        );
        state.record_tx(ActionKind::Fund, Side::Beta, TxRef::new("0xfund"));
        assert_eq!(decide(&descriptor, &state, &alpha_refunded), Decision::Wait);
    }

    #[tokio::test]
    async fn late_alpha_funding_is_refunded_not_expired() {
        let h = Harness::new();
        let alpha_htlc = h.descriptor.htlc(Side::Alpha);
        h.eth
            .credit("taker-eth", &alpha_htlc.asset, alpha_htlc.asset.quantity)
            .await;

        let entry = h.accepted(Role::Alpha).await;
        h.expect_progress(&entry, Phase::AlphaDeployed).await;

        // Funding is broadcast but not mined before beta expires
        h.eth.set_withholding(true).await;
        assert_eq!(h.step(&entry).await.unwrap(), StepOutcome::Waiting);
        h.btc.advance_time(3_600).await;
        assert_eq!(h.step(&entry).await.unwrap(), StepOutcome::Waiting);
        assert_eq!(entry.phase().await, Phase::AlphaDeployed);

        h.eth.set_withholding(false).await;
        h.eth.mine(1).await;
        assert_eq!(h.eth.funding_count(entry.id(), Side::Alpha).await, 1);
        h.expect_progress(&entry, Phase::AlphaFunded).await;
        assert_eq!(h.step(&entry).await.unwrap(), StepOutcome::Waiting);

        h.eth.advance_time(7_200).await;
        h.expect_progress(&entry, Phase::Refunded).await;
        assert_eq!(
            h.eth.balance("taker-eth", &alpha_htlc.asset).await.unwrap(),
            alpha_htlc.asset.quantity
        );
        assert_eq!(
            h.eth.observe(&alpha_htlc).await.unwrap(),
            HtlcState::Refunded
        );
    }

    #[tokio::test]
    async fn missing_ledger_is_recorded_and_aborts() {
        let h = Harness::new();
        let ctx = ActorContext::new("test", LedgerSet::new().with(h.eth.ledger(), h.eth.clone()));
        let entry = h.accepted(Role::Beta).await;

        let err = h.machine.step(&ctx, &entry).await.unwrap_err();
        assert!(matches!(err, SwapError::LedgerNotConfigured(_)));

        let state = entry.snapshot().await;
        assert_eq!(state.phase, Phase::Aborted);
        assert_eq!(
            state.error.map(|e| e.kind),
            Some(crate::error::ErrorKind::Operational)
        );
        assert_eq!(
            h.machine.step(&ctx, &entry).await.unwrap(),
            StepOutcome::Terminal(Phase::Aborted)
        );
    }

    #[tokio::test]
    async fn abort_after_alpha_funded_is_rejected() {
        let h = Harness::new();
        let alpha_htlc = h.descriptor.htlc(Side::Alpha);
        h.eth
            .credit("taker-eth", &alpha_htlc.asset, alpha_htlc.asset.quantity)
            .await;

        let entry = h.accepted(Role::Alpha).await;
        h.expect_progress(&entry, Phase::AlphaDeployed).await;
        h.expect_progress(&entry, Phase::AlphaFunded).await;

        let err = h.machine.abort(&entry).await.unwrap_err();
        assert_eq!(
            err,
            SwapError::AbortRejected {
                swap_id: entry.id(),
                phase: Phase::AlphaFunded
            }
        );
        assert_eq!(entry.phase().await, Phase::AlphaFunded);
    }

    #[tokio::test]
    async fn abort_before_funding_is_terminal() {
        let h = Harness::new();
        let entry = h.accepted(Role::Beta).await;

        assert_eq!(h.machine.abort(&entry).await.unwrap(), Phase::Aborted);
        assert_eq!(h.machine.abort(&entry).await.unwrap(), Phase::Aborted);
        assert_eq!(
            h.step(&entry).await.unwrap(),
            StepOutcome::Terminal(Phase::Aborted)
        );
    }

    #[tokio::test]
    async fn repeated_unconfirmed_actions_force_abort() {
        let h = Harness::new();
        h.eth.set_withholding(true).await;
        let entry = h.accepted(Role::Alpha).await;

        assert_eq!(h.step(&entry).await.unwrap(), StepOutcome::Waiting);
        assert_eq!(h.step(&entry).await.unwrap(), StepOutcome::Waiting);
        let err = h.step(&entry).await.unwrap_err();

        assert!(matches!(err, SwapError::InvariantViolation(_)));
        let state = entry.snapshot().await;
        assert_eq!(state.phase, Phase::Aborted);
        assert_eq!(state.consecutive_failures, 3);
        assert!(state.error.is_some());
        assert!(state.pending_action.is_none());
        // Resubmissions reuse the original transaction
        assert_eq!(h.eth.mempool_len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_steps_never_overlap_ledger_calls() {
        let h = Harness::new();
        h.eth.set_withholding(true).await;
        let entry = h.accepted(Role::Alpha).await;

        let (first, second) = tokio::join!(h.step(&entry), h.step(&entry));

        assert_eq!(first.unwrap(), StepOutcome::Waiting);
        assert_eq!(second.unwrap(), StepOutcome::Waiting);
        assert_eq!(entry.snapshot().await.consecutive_failures, 2);
        assert_eq!(h.machine.scheduler().in_flight(), 0);
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let h = Harness::new();
        let mut events = h.machine.events().subscribe();
        let entry = h.accepted(Role::Beta).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.swap_id, entry.id());
        assert_eq!(event.from, Some(Phase::Negotiated));
        assert_eq!(event.to, Phase::Accepted);
    }
}
