//! Swap Pair - a Maker and a Taker swapping over shared simulated ledgers
//!
//! Negotiates the swap described by `[pair]`, accepts it on both sides and
//! reports both parties' balances before and after.

use anyhow::Result;
use tracing::{info, warn};

use swap_coordinator::config::Settings;
use swap_coordinator::ledger::simulated;
use swap_coordinator::logging;
use swap_coordinator::pair::SwapPair;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    info!("Starting Swap Pair v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    let (ledgers, miners) = simulated::from_settings(&settings).await;
    let pair = SwapPair::new(&settings, ledgers)?;

    let outcome = pair.run().await;

    pair.stop().await;
    for miner in miners {
        miner.abort();
    }

    let report = outcome?;
    if !report.completed() {
        warn!(
            swap_id = %report.swap_id,
            taker = %report.taker.phase,
            maker = %report.maker.phase,
            "Swap did not complete"
        );
        anyhow::bail!("swap {} did not complete", report.swap_id);
    }

    info!(swap_id = %report.swap_id, "Swap completed");
    Ok(())
}
