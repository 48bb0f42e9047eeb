//! Process-wide table of active swaps
//!
//! The registry is the only state shared between swap workers. Locking is per
//! swap: unrelated swaps never contend.

pub mod registry;

pub use registry::{SwapEntry, SwapRegistry};
