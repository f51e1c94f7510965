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

use serde::Deserialize;

/// Configuration of one stratum listening endpoint. A pool usually runs
/// several of these at different share difficulties.
#[derive(Debug, Deserialize, Clone)]
pub struct StratumPortConfig {
    /// Display name used in logs, e.g. "stratum-low"
    pub name: String,
    pub enabled: bool,
    /// Listen address, e.g. "0.0.0.0:8008"
    pub listen: String,
    /// Share difficulty enforced on this endpoint
    pub difficulty: u64,
    /// Maximum concurrent connections
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
}

fn default_max_conn() -> usize {
    8192
}
