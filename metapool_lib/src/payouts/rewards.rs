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

//! Pure reward arithmetic. Everything intermediate is an exact rational;
//! only the final per-recipient credit is floor-truncated to Shannon, once.

use crate::store::BlockData;
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{Signed, ToPrimitive, Zero};
use std::collections::HashMap;
use stratum::validate::is_valid_address;

/// Base block subsidy in Shannon.
pub const BASE_SUBSIDY: u64 = 300_000_000;
/// The subsidy shrinks by 5% every `SUBSIDY_PERIOD` heights.
pub const SUBSIDY_PERIOD: u64 = 500_000;

/// Subsidy at a height: floor(300000000 * (19/20)^(height / 500000)).
pub fn block_reward(height: u64) -> BigInt {
    let steps = (height / SUBSIDY_PERIOD) as u32;
    let numerator = BigInt::from(BASE_SUBSIDY) * BigInt::from(19u32).pow(steps);
    numerator / BigInt::from(20u32).pow(steps)
}

/// The full split of one round's revenue.
#[derive(Debug, Clone)]
pub struct RewardSplit {
    pub revenue: BigRational,
    pub miners_profit: BigRational,
    pub pool_profit: BigRational,
    pub credits: HashMap<String, i64>,
}

/// Deduct the pool fee: returns (remainder, fee). The percentage is read
/// as the exact decimal it was configured as, not its binary float
/// expansion, so a 1% fee on a round number divides without residue.
pub fn charge_fee(value: &BigRational, fee_percent: f64) -> (BigRational, BigRational) {
    let fee_rate = percent_to_ratio(fee_percent);
    let fee = value * fee_rate;
    (value - &fee, fee)
}

fn percent_to_ratio(fee_percent: f64) -> BigRational {
    if !fee_percent.is_finite() {
        return BigRational::zero();
    }
    // f64 Display renders the shortest decimal form without an exponent.
    let rendered = format!("{fee_percent}");
    let (digits, scale) = match rendered.split_once('.') {
        Some((whole, frac)) => (format!("{whole}{frac}"), frac.len() as u32),
        None => (rendered, 0),
    };
    let numerator: BigInt = match digits.parse() {
        Ok(numerator) => numerator,
        Err(_) => return BigRational::zero(),
    };
    let denominator = BigInt::from(10u32).pow(scale) * BigInt::from(100u32);
    BigRational::new(numerator, denominator)
}

/// Split the miners' cut proportionally to round shares. Logins failing the
/// address check contribute nothing and receive nothing; their shares stay
/// in `total`, so the skipped value remains with the pool as dust.
pub fn rewards_for_shares(
    shares: &HashMap<String, u64>,
    total: u64,
    reward: &BigRational,
) -> HashMap<String, i64> {
    let mut credits = HashMap::new();
    if total == 0 {
        return credits;
    }
    for (login, count) in shares {
        if !is_valid_address(login) {
            continue;
        }
        let cut = reward * BigRational::new(BigInt::from(*count), BigInt::from(total));
        *credits.entry(login.clone()).or_insert(0) += floor_shannon(&cut);
    }
    credits
}

/// Compute the per-address credits for one unlocked block.
pub fn calculate_rewards(
    block: &BlockData,
    shares: &HashMap<String, u64>,
    pool_fee: f64,
    pool_fee_address: &str,
) -> RewardSplit {
    let mut revenue = BigRational::from_integer(block.reward.clone());
    let (miners_profit, mut pool_profit) = charge_fee(&revenue, pool_fee);

    let mut credits = rewards_for_shares(shares, block.total_shares, &miners_profit);

    if let Some(extra) = &block.extra_reward {
        let extra = BigRational::from_integer(extra.clone());
        pool_profit += &extra;
        revenue += &extra;
    }

    if !pool_fee_address.is_empty() {
        *credits.entry(pool_fee_address.to_string()).or_insert(0) +=
            floor_shannon(&pool_profit);
    }

    RewardSplit {
        revenue,
        miners_profit,
        pool_profit,
        credits,
    }
}

/// Floor-truncate a rational Shannon amount to an integer credit.
fn floor_shannon(value: &BigRational) -> i64 {
    value.floor().to_integer().to_i64().unwrap_or(0)
}

/// Render a rational Shannon amount for logs.
pub fn format_reward(value: &BigRational) -> String {
    let scale = BigInt::from(100_000_000u64);
    let scaled = value * BigRational::from_integer(scale.clone());
    let integer = scaled.floor().to_integer();
    let whole = &integer / &scale;
    let frac = (&integer % &scale).abs();
    format!("{whole}.{frac:08}")
}
