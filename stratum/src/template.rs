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

use mvsdrpc::GetBlockReply;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Immutable snapshot of the current job, identified by `header_hash`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockTemplate {
    pub header_hash: String,
    pub seed_hash: String,
    pub target: String,
    pub height: u64,
    pub difficulty: BigUint,
}

struct Snapshot {
    template: Arc<BlockTemplate>,
    /// Raw pending-block reply kept alongside the template so RPC handlers
    /// can answer "get block by number" without an upstream round-trip.
    pending: Arc<GetBlockReply>,
}

/// Single-slot atomic reference to the current template. Replacement swaps
/// the whole snapshot, so readers never observe a torn template, and a
/// reader's `Arc` keeps a replaced template alive until its in-flight
/// submission completes.
#[derive(Default)]
pub struct TemplateCache {
    inner: RwLock<Option<Snapshot>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<BlockTemplate>> {
        self.inner
            .read()
            .unwrap()
            .as_ref()
            .map(|snapshot| snapshot.template.clone())
    }

    pub fn pending_block(&self) -> Option<Arc<GetBlockReply>> {
        self.inner
            .read()
            .unwrap()
            .as_ref()
            .map(|snapshot| snapshot.pending.clone())
    }

    pub fn store(&self, template: BlockTemplate, pending: GetBlockReply) {
        let snapshot = Snapshot {
            template: Arc::new(template),
            pending: Arc::new(pending),
        };
        *self.inner.write().unwrap() = Some(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(header: &str, height: u64) -> BlockTemplate {
        BlockTemplate {
            header_hash: header.to_string(),
            seed_hash: "0xseed".to_string(),
            target: "0xtarget".to_string(),
            height,
            difficulty: BigUint::from(1_000_000_000u64),
        }
    }

    #[test]
    fn test_empty_cache_has_no_template() {
        let cache = TemplateCache::new();
        assert!(cache.current().is_none());
        assert!(cache.pending_block().is_none());
    }

    #[test]
    fn test_store_publishes_to_readers() {
        let cache = TemplateCache::new();
        cache.store(template("0xaa", 10), GetBlockReply::default());
        let current = cache.current().unwrap();
        assert_eq!(current.header_hash, "0xaa");
        assert_eq!(current.height, 10);
    }

    #[test]
    fn test_replaced_template_stays_readable_through_held_arc() {
        let cache = TemplateCache::new();
        cache.store(template("0xaa", 10), GetBlockReply::default());
        let held = cache.current().unwrap();

        cache.store(template("0xbb", 11), GetBlockReply::default());
        assert_eq!(cache.current().unwrap().header_hash, "0xbb");
        // The in-flight submission still sees the job it was mining.
        assert_eq!(held.header_hash, "0xaa");
    }

    #[test]
    fn test_pending_block_tracks_template_swap() {
        let cache = TemplateCache::new();
        let mut pending = GetBlockReply::default();
        pending.number = 42;
        cache.store(template("0xaa", 42), pending);
        assert_eq!(cache.pending_block().unwrap().number, 42);
    }

    #[test]
    fn test_template_wire_round_trip() {
        let original = template("0xaa", 123456);
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: BlockTemplate = serde_json::from_str(&encoded).unwrap();
        assert_eq!(original, decoded);
    }
}
