//! Gas-price tracking.
//!
//! The price reacts to block fullness: blocks packed beyond the load
//! threshold push the price up a step, underfull blocks let it decay
//! toward the floor. Prices are persisted per block so the price handed
//! to the execution layer for block N is the one computed at block N-1.

use {
    crate::storage::ChainStorage,
    log::debug,
    strand_types::{BlockId, Result},
};

/// Price adjustment parameters.
#[derive(Debug, Clone)]
pub struct PricingConfig {
    /// Price attached to the genesis hand-off and the lower bound.
    pub min_price: u64,
    /// Fullness (percent of the per-block transaction cap) above which
    /// the price rises.
    pub load_threshold_percent: u64,
    /// Adjustment step, in basis points of the current price.
    pub adjustment_bps: u64,
    /// Transaction cap used to compute fullness.
    pub max_transactions_per_block: usize,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            min_price: 1_000,
            load_threshold_percent: 70,
            adjustment_bps: 500,
            max_transactions_per_block: 4_096,
        }
    }
}

/// Computes and persists per-block gas prices.
pub struct PricingAgent {
    config: PricingConfig,
    storage: ChainStorage,
}

impl PricingAgent {
    pub fn new(config: PricingConfig, storage: ChainStorage) -> Self {
        Self { config, storage }
    }

    /// Compute and persist the price for `block_id` from its fullness.
    pub fn calculate_price(&self, block_id: BlockId, transaction_count: usize) -> Result<u64> {
        let previous = self.read_price(block_id.saturating_sub(1));
        let fullness_percent =
            (transaction_count as u64 * 100) / self.config.max_transactions_per_block.max(1) as u64;

        let step = previous * self.config.adjustment_bps / 10_000;
        let price = if fullness_percent >= self.config.load_threshold_percent {
            previous + step.max(1)
        } else {
            previous.saturating_sub(step).max(self.config.min_price)
        };

        debug!("price for block {block_id}: {price} (fullness {fullness_percent}%)");
        self.storage.save_price(block_id, price)?;
        Ok(price)
    }

    /// Price recorded for `block_id`; the floor when none is stored.
    pub fn read_price(&self, block_id: BlockId) -> u64 {
        self.storage
            .price(block_id)
            .unwrap_or(self.config.min_price)
    }
}
