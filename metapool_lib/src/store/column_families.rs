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

/// Column family names defined in one place for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    /// Per-address share counts, current round under the "current:" prefix,
    /// closed rounds under "round:{height}:{nonce}:"
    RoundShares,
    /// Share fingerprints for duplicate detection
    ShareIndex,
    /// Timestamped share rows backing hashrate queries
    Hashrate,
    /// Found blocks awaiting their first confirmation check
    Candidates,
    /// Blocks past immature_depth with provisional credits
    Immature,
    /// Fully confirmed blocks with final credits
    Matured,
    /// Blocks that failed the on-chain identity check
    Orphans,
    /// Provisional per-round credit maps, kept for exact compensation
    RoundCredits,
    /// Per-address accounts: immature and settled balances
    Miners,
    /// Counters such as the open round's total share count
    Meta,
}

impl ColumnFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnFamily::RoundShares => "round_shares",
            ColumnFamily::ShareIndex => "share_index",
            ColumnFamily::Hashrate => "hashrate",
            ColumnFamily::Candidates => "candidates",
            ColumnFamily::Immature => "immature",
            ColumnFamily::Matured => "matured",
            ColumnFamily::Orphans => "orphans",
            ColumnFamily::RoundCredits => "round_credits",
            ColumnFamily::Miners => "miners",
            ColumnFamily::Meta => "meta",
        }
    }

    pub fn all() -> [ColumnFamily; 10] {
        [
            ColumnFamily::RoundShares,
            ColumnFamily::ShareIndex,
            ColumnFamily::Hashrate,
            ColumnFamily::Candidates,
            ColumnFamily::Immature,
            ColumnFamily::Matured,
            ColumnFamily::Orphans,
            ColumnFamily::RoundCredits,
            ColumnFamily::Miners,
            ColumnFamily::Meta,
        ]
    }
}

impl std::ops::Deref for ColumnFamily {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for ColumnFamily {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<ColumnFamily> for String {
    fn from(val: ColumnFamily) -> Self {
        val.as_str().to_string()
    }
}
