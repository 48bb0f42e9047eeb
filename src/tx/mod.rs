//! Ledger action submission with confirmation polling and bounded backoff

mod scheduler;

pub use scheduler::{ActionOutcome, ActionRecord, ActionRequest, ActionScheduler, SchedulerConfig};

use serde::Serialize;
use std::fmt;

/// Ledger-side operations a party performs on an HTLC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Deploy,
    Fund,
    Redeem,
    Refund,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Deploy => "deploy",
            ActionKind::Fund => "fund",
            ActionKind::Redeem => "redeem",
            ActionKind::Refund => "refund",
        })
    }
}

/// Ledger transaction reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TxRef(String);

impl TxRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
