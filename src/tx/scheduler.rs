//! Action scheduler with retry logic and confirmation polling

use super::{ActionKind, TxRef};
use crate::config::EngineConfig;
use crate::error::{SwapError, SwapResult};
use crate::ledger::LedgerAdapter;
use crate::swap::{HtlcParams, Secret, Side, SwapId};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between confirmation polls
    pub poll_interval: Duration,
    /// How long to wait for confirmation before giving the action back
    pub action_timeout: Duration,
    /// Maximum submission attempts for transient adapter failures
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl SchedulerConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_delay
            .checked_mul(factor)
            .unwrap_or(self.max_retry_delay)
            .min(self.max_retry_delay)
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            action_timeout: Duration::from_millis(config.action_timeout_ms),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_retry_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }
}

/// A ledger action handed to the scheduler
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub kind: ActionKind,
    pub htlc: HtlcParams,
    /// Required for redeem actions
    pub secret: Option<Secret>,
}

impl ActionRequest {
    pub fn new(kind: ActionKind, htlc: HtlcParams) -> Self {
        Self {
            kind,
            htlc,
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: Secret) -> Self {
        self.secret = Some(secret);
        self
    }

    fn slot(&self) -> (SwapId, Side) {
        (self.htlc.swap_id, self.htlc.side)
    }
}

/// Book-keeping for an outstanding ledger action
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub attempts: u32,
    pub tx: Option<TxRef>,
    pub started_at: Instant,
}

/// Result of handing an action to the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Submitted and observed confirmed
    Confirmed(TxRef),
    /// Submitted but not confirmed within the action timeout
    Unconfirmed(TxRef),
    /// Submission kept failing with transient errors
    Failed(String),
}

/// Releases an in-flight slot on every exit path
struct SlotGuard<'a> {
    slots: &'a DashMap<(SwapId, Side), ActionRecord>,
    key: (SwapId, Side),
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots.remove(&self.key);
    }
}

/// Issues ledger actions and polls them to confirmation
///
/// At most one action may be outstanding per (swap, side); a second request
/// for a busy slot is an invariant violation, not something to queue.
pub struct ActionScheduler {
    config: SchedulerConfig,
    in_flight: DashMap<(SwapId, Side), ActionRecord>,
}

impl ActionScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            in_flight: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Number of actions currently outstanding
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_busy(&self, swap_id: SwapId, side: Side) -> bool {
        self.in_flight.contains_key(&(swap_id, side))
    }

    /// Submit `request` through `ledger` and wait for confirmation
    ///
    /// Transient adapter errors are absorbed here; only non-transient errors
    /// are returned as `Err`.
    pub async fn execute(
        &self,
        ledger: &dyn LedgerAdapter,
        request: ActionRequest,
    ) -> SwapResult<ActionOutcome> {
        let _slot = self.claim(&request)?;
        let ledger_name = ledger.name();
        let started = Instant::now();

        let tx = match self.submit_with_retry(ledger, &request).await {
            Ok(tx) => tx,
            Err(e) if e.is_retryable() => {
                crate::metrics::record_action_failed(&ledger_name, request.kind, "retries_exhausted");
                return Ok(ActionOutcome::Failed(e.to_string()));
            }
            Err(e) => {
                crate::metrics::record_action_failed(&ledger_name, request.kind, "rejected");
                return Err(e);
            }
        };

        if let Some(mut record) = self.in_flight.get_mut(&request.slot()) {
            record.tx = Some(tx.clone());
        }
        crate::metrics::record_action_submitted(&ledger_name, request.kind);

        let outcome = self.await_confirmation(ledger, &request, tx).await?;
        match &outcome {
            ActionOutcome::Confirmed(_) => {
                crate::metrics::record_action_confirmed(&ledger_name, request.kind);
                crate::metrics::record_action_latency(
                    &ledger_name,
                    request.kind,
                    started.elapsed().as_secs_f64(),
                );
            }
            _ => crate::metrics::record_action_failed(&ledger_name, request.kind, "unconfirmed"),
        }
        Ok(outcome)
    }

    fn claim(&self, request: &ActionRequest) -> SwapResult<SlotGuard<'_>> {
        let key = request.slot();
        match self.in_flight.entry(key) {
            Entry::Occupied(existing) => Err(SwapError::InvariantViolation(format!(
                "{} on {} ledger of swap {} requested while {} is outstanding",
                request.kind,
                key.1,
                key.0,
                existing.get().kind
            ))),
            Entry::Vacant(slot) => {
                slot.insert(ActionRecord {
                    kind: request.kind,
                    attempts: 0,
                    tx: None,
                    started_at: Instant::now(),
                });
                Ok(SlotGuard {
                    slots: &self.in_flight,
                    key,
                })
            }
        }
    }

    async fn submit_once(
        &self,
        ledger: &dyn LedgerAdapter,
        request: &ActionRequest,
    ) -> SwapResult<TxRef> {
        let htlc = &request.htlc;
        match request.kind {
            ActionKind::Deploy => ledger.deploy_contract(htlc).await,
            ActionKind::Fund => ledger.fund_contract(htlc).await,
            ActionKind::Refund => ledger.refund(htlc).await,
            ActionKind::Redeem => {
                let secret = request.secret.as_ref().ok_or_else(|| {
                    SwapError::InvariantViolation(format!(
                        "redeem requested for swap {} without a secret",
                        htlc.swap_id
                    ))
                })?;
                ledger.redeem(htlc, secret).await
            }
        }
    }

    /// Submit with retry and exponential backoff on transient errors
    async fn submit_with_retry(
        &self,
        ledger: &dyn LedgerAdapter,
        request: &ActionRequest,
    ) -> SwapResult<TxRef> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            if let Some(mut record) = self.in_flight.get_mut(&request.slot()) {
                record.attempts = attempts;
            }

            match self.submit_once(ledger, request).await {
                Ok(tx) => {
                    info!(
                        swap_id = %request.htlc.swap_id,
                        side = %request.htlc.side,
                        kind = %request.kind,
                        tx = %tx,
                        "Action submitted (attempt {}/{})",
                        attempts,
                        max_attempts
                    );
                    return Ok(tx);
                }
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    let delay = self.config.backoff(attempts);
                    warn!(
                        swap_id = %request.htlc.swap_id,
                        kind = %request.kind,
                        "Transient failure submitting action, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll until confirmed or the action timeout elapses
    async fn await_confirmation(
        &self,
        ledger: &dyn LedgerAdapter,
        request: &ActionRequest,
        tx: TxRef,
    ) -> SwapResult<ActionOutcome> {
        let deadline = Instant::now() + self.config.action_timeout;

        loop {
            match ledger.query_confirmed(&tx).await {
                Ok(true) => {
                    debug!(swap_id = %request.htlc.swap_id, tx = %tx, "Action confirmed");
                    return Ok(ActionOutcome::Confirmed(tx));
                }
                Ok(false) => {}
                Err(e) if e.is_retryable() => {
                    debug!(tx = %tx, "Transient failure polling confirmation: {}", e);
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                warn!(
                    swap_id = %request.htlc.swap_id,
                    kind = %request.kind,
                    tx = %tx,
                    "Action not confirmed within {:?}",
                    self.config.action_timeout
                );
                return Ok(ActionOutcome::Unconfirmed(tx));
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
