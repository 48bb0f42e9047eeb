//! Swap Coordinator - cross-chain HTLC atomic swap coordination
//!
//! Drives one party's side of atomic swaps between two ledgers: observes both
//! hash-time-locked contracts, deploys, funds, redeems and refunds in the order
//! that keeps the party safe, and never lets a swap outlive its expiries.

pub mod api;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod pair;
pub mod state;
pub mod swap;
pub mod tx;

pub use coordination::SwapEngine;
pub use error::{SwapError, SwapResult};
