//! Swap coordination
//!
//! The coordination layer:
//! 1. Observes both ledgers of every accepted swap
//! 2. Decides the local party's next move under the ordering and expiry rules
//! 3. Hands ledger actions to the scheduler and applies their outcome
//! 4. Exposes the operator operations and runs one worker per swap

pub mod engine;
pub mod machine;

pub use engine::SwapEngine;
pub use machine::{decide, Decision, Observation, StepOutcome, SwapStateMachine};
