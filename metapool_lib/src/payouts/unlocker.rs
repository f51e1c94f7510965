// Copyright (C) 2025, 2026 Metapool Developers (see AUTHORS)
//
// This file is part of Metapool
//
// Metapool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Metapool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Metapool. If not, see <https://www.gnu.org/licenses/>.

//! Interval-driven reconciliation of found blocks against the chain.
//!
//! Every tick runs two passes: pass 1 promotes candidates old enough to
//! judge to immature and writes provisional credits, pass 2 promotes
//! immature blocks past full confirmation depth to matured and settles the
//! credits. A failed identity check orphans the block instead. Any store or
//! upstream error latches the halt flag and the unlocker refuses further
//! ticks until restart, preserving store consistency.

use crate::config::{parse_duration, ConfigError, UnlockerConfig};
use crate::payouts::rewards::{block_reward, calculate_rewards, format_reward, RewardSplit};
use crate::store::{BlockData, Store, StoreError};
use mvsdrpc::{GetBlockReply, MvsdRpcClient, MvsdRpcError};
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::Zero;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Floor for the confirmation depths; startup rejects anything shallower.
pub const MIN_DEPTH: u64 = 16;

#[derive(Debug, Error)]
pub enum UnlockerError {
    #[error("upstream error: {0}")]
    Rpc(#[from] MvsdRpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("block {0} not found on node, wrong node height")]
    WrongNodeHeight(u64),
    #[error("block {0} has no coinbase output")]
    MissingCoinbase(u64),
}

#[derive(Debug, Default)]
struct HaltState {
    halt: bool,
    last_fail: Option<String>,
}

/// Result of judging one batch of blocks against the chain.
#[derive(Debug, Default)]
struct UnlockResult {
    unlocked: Vec<BlockData>,
    orphaned: Vec<BlockData>,
    blocks: usize,
    orphans: usize,
}

pub struct BlockUnlocker {
    config: UnlockerConfig,
    store: Arc<Store>,
    rpc: MvsdRpcClient,
    state: Mutex<HaltState>,
}

impl BlockUnlocker {
    pub fn new(
        config: UnlockerConfig,
        store: Arc<Store>,
        rpc: MvsdRpcClient,
    ) -> Result<Self, UnlockerError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            rpc,
            state: Mutex::new(HaltState::default()),
        })
    }

    /// Build the unlocker with its own RPC client against `config.daemon`.
    pub fn from_config(config: UnlockerConfig, store: Arc<Store>) -> Result<Self, UnlockerError> {
        let timeout = parse_duration(&config.timeout)?;
        let rpc = MvsdRpcClient::new(
            "BlockUnlocker",
            &config.daemon,
            &config.account,
            &config.password,
            timeout,
        )?;
        Self::new(config, store, rpc)
    }

    pub fn halted(&self) -> bool {
        self.state.lock().unwrap().halt
    }

    pub fn last_fail(&self) -> Option<String> {
        self.state.lock().unwrap().last_fail.clone()
    }

    /// Run forever on a fixed interval. The first tick fires immediately.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        info!("Set block unlock interval to {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.unlock_pending_blocks().await;
            self.unlock_and_credit_miners().await;
        }
    }

    /// Pass 1: candidates old enough to judge become immature (or orphans).
    pub async fn unlock_pending_blocks(&self) {
        if self.suspended() {
            return;
        }
        if let Err(e) = self.try_unlock_pending().await {
            self.latch(e);
        }
    }

    /// Pass 2: immature blocks past full depth become matured (or orphans).
    pub async fn unlock_and_credit_miners(&self) {
        if self.suspended() {
            return;
        }
        if let Err(e) = self.try_unlock_matured().await {
            self.latch(e);
        }
    }

    async fn try_unlock_pending(&self) -> Result<(), UnlockerError> {
        let current = self.rpc.get_pending_block().await?;
        let candidates = self
            .store
            .get_candidates(current.number.saturating_sub(self.config.immature_depth))?;
        if candidates.is_empty() {
            info!("No block candidates to unlock");
            return Ok(());
        }

        let result = self.reconcile(candidates).await?;
        info!("Immature {} blocks, {} orphans", result.blocks, result.orphans);

        self.store.write_pending_orphans(&result.orphaned)?;

        let mut totals = SessionTotals::default();
        for block in &result.unlocked {
            let split = self.round_split(block)?;
            self.store.write_immature_block(block, &split.credits)?;
            self.log_round("IMMATURE", block, &split);
            totals.add(&split);
        }
        totals.log("IMMATURE SESSION");
        Ok(())
    }

    async fn try_unlock_matured(&self) -> Result<(), UnlockerError> {
        let current = self.rpc.get_pending_block().await?;
        let immature = self
            .store
            .get_immature_blocks(current.number.saturating_sub(self.config.depth))?;
        if immature.is_empty() {
            info!("No immature blocks to credit miners");
            return Ok(());
        }

        let result = self.reconcile(immature).await?;
        info!("Unlocked {} blocks, {} orphans", result.blocks, result.orphans);

        for block in &result.orphaned {
            self.store.write_orphan(block)?;
        }

        let mut totals = SessionTotals::default();
        for block in &result.unlocked {
            let split = self.round_split(block)?;
            self.store.write_matured_block(block, &split.credits)?;
            self.log_round("MATURED", block, &split);
            totals.add(&split);
        }
        totals.log("MATURE SESSION");
        Ok(())
    }

    /// Judge each block against its on-chain counterpart. A missing block
    /// at a height the node must have seen is fatal; a failed identity
    /// check or a missing coinbase output produces an orphan.
    async fn reconcile(&self, blocks: Vec<BlockData>) -> Result<UnlockResult, UnlockerError> {
        let mut result = UnlockResult::default();
        for mut block_data in blocks {
            let height = block_data.height;
            let on_chain = self
                .rpc
                .get_block_by_height(height)
                .await?
                .ok_or(UnlockerError::WrongNodeHeight(height))?;

            if !match_candidate(&on_chain, &block_data, &self.config.address) {
                block_data.orphan = true;
                result.orphans += 1;
                info!(
                    "Orphaned block {}:{}",
                    block_data.round_height, block_data.nonce
                );
                result.orphaned.push(block_data);
                continue;
            }

            match self.enrich_block(&on_chain, &mut block_data).await {
                Ok(()) => {
                    result.blocks += 1;
                    info!("Unlocked block {}, hash: {}", block_data.height, block_data.hash);
                    result.unlocked.push(block_data);
                }
                Err(UnlockerError::MissingCoinbase(height)) => {
                    warn!("Block {height} has no coinbase output, treating as orphan");
                    block_data.orphan = true;
                    result.orphans += 1;
                    result.orphaned.push(block_data);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    /// Fill chain-derived fields on a matched block: final height, hash and
    /// the reward, with the coinbase surplus kept or folded in per config.
    async fn enrich_block(
        &self,
        on_chain: &GetBlockReply,
        block_data: &mut BlockData,
    ) -> Result<(), UnlockerError> {
        let reward = block_reward(on_chain.number);
        let extra = self.extra_reward_for_tx(on_chain.number, &reward).await?;

        if self.config.keep_tx_fees {
            block_data.reward = reward;
            block_data.extra_reward = Some(extra);
        } else {
            block_data.reward = reward + extra;
            block_data.extra_reward = None;
        }
        block_data.height = on_chain.number;
        block_data.orphan = false;
        block_data.hash = on_chain.hash.clone();
        Ok(())
    }

    /// Coinbase surplus over the base subsidy at this height.
    async fn extra_reward_for_tx(
        &self,
        height: u64,
        reward: &BigInt,
    ) -> Result<BigInt, UnlockerError> {
        let block = self.rpc.get_block_txs(height).await?;
        let coinbase_output = block
            .transactions
            .first()
            .and_then(|tx| tx.outputs.first())
            .ok_or(UnlockerError::MissingCoinbase(height))?;
        Ok(BigInt::from(coinbase_output.value) - reward)
    }

    fn round_split(&self, block: &BlockData) -> Result<RewardSplit, UnlockerError> {
        let shares = self
            .store
            .get_round_shares(block.round_height, &block.nonce)?;
        Ok(calculate_rewards(
            block,
            &shares,
            self.config.pool_fee,
            &self.config.pool_fee_address,
        ))
    }

    fn log_round(&self, stage: &str, block: &BlockData, split: &RewardSplit) {
        info!(
            "{} {}: revenue {}, miners profit {}, pool profit: {}",
            stage,
            block.round_key(),
            format_reward(&split.revenue),
            format_reward(&split.miners_profit),
            format_reward(&split.pool_profit),
        );
        for (login, reward) in &split.credits {
            debug!("REWARD {}: {}: {} Shannon", block.round_key(), login, reward);
        }
    }

    fn suspended(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.halt {
            warn!(
                "Unlocking suspended due to last critical error: {}",
                state.last_fail.as_deref().unwrap_or("unknown")
            );
        }
        state.halt
    }

    fn latch(&self, err: UnlockerError) {
        error!("Unlocker tick failed: {err}");
        let mut state = self.state.lock().unwrap();
        state.halt = true;
        state.last_fail = Some(err.to_string());
    }
}

/// On-chain identity check. The coinbase output address, when the node
/// reports one, must be the pool's payout address; a recorded hash must
/// match case-insensitively; the on-chain decimal nonce must equal the
/// recorded hex nonce.
fn match_candidate(block: &GetBlockReply, candidate: &BlockData, pool_address: &str) -> bool {
    if let Some(output) = block
        .transactions
        .first()
        .and_then(|tx| tx.outputs.first())
    {
        if output.address != pool_address {
            return false;
        }
    }

    if !candidate.hash.is_empty() && !candidate.hash.eq_ignore_ascii_case(&block.hash) {
        return false;
    }

    let on_chain_nonce = block.nonce.parse::<i64>().unwrap_or(0);
    let recorded_nonce =
        i64::from_str_radix(candidate.nonce.trim_start_matches("0x"), 16).unwrap_or(0);
    on_chain_nonce == recorded_nonce
}

struct SessionTotals {
    revenue: BigRational,
    miners_profit: BigRational,
    pool_profit: BigRational,
}

impl Default for SessionTotals {
    fn default() -> Self {
        Self {
            revenue: BigRational::zero(),
            miners_profit: BigRational::zero(),
            pool_profit: BigRational::zero(),
        }
    }
}

impl SessionTotals {
    fn add(&mut self, split: &RewardSplit) {
        self.revenue += &split.revenue;
        self.miners_profit += &split.miners_profit;
        self.pool_profit += &split.pool_profit;
    }

    fn log(&self, stage: &str) {
        if self.revenue.is_zero() {
            return;
        }
        info!(
            "{}: revenue {}, miners profit {}, pool profit: {}",
            stage,
            format_reward(&self.revenue),
            format_reward(&self.miners_profit),
            format_reward(&self.pool_profit),
        );
    }
}
