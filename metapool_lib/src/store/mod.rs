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

use crate::store::column_families::ColumnFamily;
use num_bigint::BigInt;
use num_traits::Zero;
use rocksdb::{ColumnFamilyDescriptor, Options as RocksDbOptions, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

pub mod column_families;

const CURRENT_ROUND_PREFIX: &str = "current:";
const ROUND_TOTAL_KEY: &str = "round_total";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    Db(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Codec(String),
    #[error("{0}")]
    Other(String),
}

/// One tracked block, from candidate through maturity or orphanhood.
/// `round_height` and `nonce` form the immutable round key; `height`,
/// `hash` and the rewards are filled in from the chain as the block
/// confirms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockData {
    pub height: u64,
    pub round_height: u64,
    /// Hex nonce exactly as submitted, 0x-prefixed
    pub nonce: String,
    /// On-chain block hash, empty until the immature check
    pub hash: String,
    pub timestamp: u64,
    /// Network difficulty at the time the block was found
    pub difficulty: u64,
    /// Snapshot of the round's share count, taken when the round closed
    pub total_shares: u64,
    /// Base subsidy in Shannon
    pub reward: BigInt,
    /// Coinbase surplus beyond the subsidy, kept separately when the pool
    /// retains tx fees
    pub extra_reward: Option<BigInt>,
    pub orphan: bool,
}

impl BlockData {
    pub fn round_key(&self) -> String {
        format!("{}:{}", self.round_height, self.nonce)
    }
}

/// Per-address credit account. Immature credits are provisional and get
/// compensated when their round matures or orphans.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinerAccount {
    pub immature: i64,
    pub balance: i64,
}

/// One recorded share, kept for hashrate accounting until it expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HashrateEntry {
    login: String,
    worker: String,
    difficulty: u64,
    height: u64,
    timestamp: u64,
    expires_at: u64,
}

/// Rocksdb-backed pool store. One column family per record type so
/// compactions stay independent. Every mutation goes through a single
/// write batch committed under `round_lock`, which serializes round and
/// record transitions: concurrent writers of the same share fingerprint
/// resolve so that exactly one sees `already_exists = false`, and readers
/// never observe a half-promoted block.
pub struct Store {
    path: String,
    db: DB,
    round_lock: Mutex<()>,
}

impl Store {
    pub fn new(path: String) -> Result<Self, StoreError> {
        let cfs: Vec<ColumnFamilyDescriptor> = ColumnFamily::all()
            .into_iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf, RocksDbOptions::default()))
            .collect();

        let mut db_options = RocksDbOptions::default();
        db_options.create_missing_column_families(true);
        db_options.create_if_missing(true);
        let db = DB::open_cf_descriptors(&db_options, path.clone(), cfs)?;
        Ok(Self {
            path,
            db,
            round_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Record one share under the current round. Returns true when the
    /// (nonce, hash_no_nonce, mix_digest) fingerprint was already recorded.
    pub fn write_share(
        &self,
        login: &str,
        worker_id: &str,
        params: &[String],
        share_diff: u64,
        height: u64,
        hashrate_window: Duration,
    ) -> Result<bool, StoreError> {
        let _guard = self.round_lock.lock().unwrap();
        if self.fingerprint_exists(params)? {
            return Ok(true);
        }

        let mut batch = WriteBatch::default();
        self.record_share_locked(
            &mut batch,
            login,
            worker_id,
            params,
            share_diff,
            height,
            hashrate_window,
        )?;
        self.db.write(batch)?;
        Ok(false)
    }

    /// Record the winning share and atomically close the current round into
    /// a candidate keyed by (height, nonce).
    #[allow(clippy::too_many_arguments)]
    pub fn write_block(
        &self,
        login: &str,
        worker_id: &str,
        params: &[String],
        share_diff: u64,
        block_diff: u64,
        height: u64,
        hashrate_window: Duration,
    ) -> Result<bool, StoreError> {
        let _guard = self.round_lock.lock().unwrap();
        if self.fingerprint_exists(params)? {
            return Ok(true);
        }

        let mut batch = WriteBatch::default();
        self.record_share_locked(
            &mut batch,
            login,
            worker_id,
            params,
            share_diff,
            height,
            hashrate_window,
        )?;

        // Re-key the open round to its final (height, nonce) identity. The
        // batch is uncommitted, so the winning share is added by hand.
        let nonce = params[0].clone();
        let round_shares_cf = self.cf(ColumnFamily::RoundShares);
        let total_shares = self.round_total()? + 1;
        let mut shares = self.current_round_shares()?;
        *shares.entry(login.to_string()).or_insert(0) += 1;

        for (address, count) in &shares {
            batch.put_cf(
                &round_shares_cf,
                closed_share_key(height, &nonce, address),
                count.to_be_bytes(),
            );
            batch.delete_cf(
                &round_shares_cf,
                format!("{CURRENT_ROUND_PREFIX}{address}"),
            );
        }
        let meta_cf = self.cf(ColumnFamily::Meta);
        batch.put_cf(&meta_cf, ROUND_TOTAL_KEY, 0u64.to_be_bytes());

        let candidate = BlockData {
            height,
            round_height: height,
            nonce,
            hash: String::new(),
            timestamp: now_secs(),
            difficulty: block_diff,
            total_shares,
            reward: BigInt::zero(),
            extra_reward: None,
            orphan: false,
        };
        batch.put_cf(
            &self.cf(ColumnFamily::Candidates),
            block_key(candidate.round_height, &candidate.nonce),
            encode(&candidate)?,
        );

        self.db.write(batch)?;
        Ok(false)
    }

    /// Candidates whose round height is at most `max_height`.
    pub fn get_candidates(&self, max_height: u64) -> Result<Vec<BlockData>, StoreError> {
        self.blocks_in(ColumnFamily::Candidates, |block| {
            block.round_height <= max_height
        })
    }

    /// Immature blocks whose on-chain height is at most `max_height`.
    pub fn get_immature_blocks(&self, max_height: u64) -> Result<Vec<BlockData>, StoreError> {
        self.blocks_in(ColumnFamily::Immature, |block| block.height <= max_height)
    }

    pub fn get_matured_blocks(&self) -> Result<Vec<BlockData>, StoreError> {
        self.blocks_in(ColumnFamily::Matured, |_| true)
    }

    pub fn get_orphaned_blocks(&self) -> Result<Vec<BlockData>, StoreError> {
        self.blocks_in(ColumnFamily::Orphans, |_| true)
    }

    /// Per-address share counts of a closed round.
    pub fn get_round_shares(
        &self,
        round_height: u64,
        nonce: &str,
    ) -> Result<HashMap<String, u64>, StoreError> {
        let prefix = format!("round:{round_height}:{nonce}:");
        let cf = self.cf(ColumnFamily::RoundShares);
        let mut shares = HashMap::new();
        for entry in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (key, value) = entry?;
            let key = String::from_utf8_lossy(&key).to_string();
            if let Some(address) = key.strip_prefix(&prefix) {
                shares.insert(address.to_string(), decode_u64(&value)?);
            }
        }
        Ok(shares)
    }

    /// Mark candidates that failed the immature identity check as orphans.
    /// Their round shares are released without crediting.
    pub fn write_pending_orphans(&self, blocks: &[BlockData]) -> Result<(), StoreError> {
        let _guard = self.round_lock.lock().unwrap();
        let mut batch = WriteBatch::default();
        for block in blocks {
            let key = block_key(block.round_height, &block.nonce);
            batch.delete_cf(&self.cf(ColumnFamily::Candidates), &key);
            let mut orphaned = block.clone();
            orphaned.orphan = true;
            batch.put_cf(&self.cf(ColumnFamily::Orphans), &key, encode(&orphaned)?);
            self.delete_round_shares(&mut batch, block.round_height, &block.nonce)?;
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Move a candidate to immature and write provisional credits.
    pub fn write_immature_block(
        &self,
        block: &BlockData,
        credits: &HashMap<String, i64>,
    ) -> Result<(), StoreError> {
        let _guard = self.round_lock.lock().unwrap();
        let key = block_key(block.round_height, &block.nonce);
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(ColumnFamily::Candidates), &key);
        batch.put_cf(&self.cf(ColumnFamily::Immature), &key, encode(block)?);
        batch.put_cf(&self.cf(ColumnFamily::RoundCredits), &key, encode(credits)?);
        for (address, amount) in credits {
            let mut account = self.load_account(address)?;
            account.immature += amount;
            batch.put_cf(&self.cf(ColumnFamily::Miners), address, encode(&account)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Move an immature block to matured and write final credits,
    /// compensating the earlier provisional ones so the net per-address
    /// effect equals `credits`.
    pub fn write_matured_block(
        &self,
        block: &BlockData,
        credits: &HashMap<String, i64>,
    ) -> Result<(), StoreError> {
        let _guard = self.round_lock.lock().unwrap();
        let key = block_key(block.round_height, &block.nonce);
        let provisional = self.load_round_credits(&key)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(ColumnFamily::Immature), &key);
        batch.put_cf(&self.cf(ColumnFamily::Matured), &key, encode(block)?);
        batch.delete_cf(&self.cf(ColumnFamily::RoundCredits), &key);

        let mut addresses: Vec<&String> = provisional.keys().chain(credits.keys()).collect();
        addresses.sort();
        addresses.dedup();
        for address in addresses {
            let mut account = self.load_account(address)?;
            if let Some(amount) = provisional.get(address) {
                account.immature -= amount;
            }
            if let Some(amount) = credits.get(address) {
                account.balance += amount;
            }
            batch.put_cf(&self.cf(ColumnFamily::Miners), address, encode(&account)?);
        }
        self.delete_round_shares(&mut batch, block.round_height, &block.nonce)?;
        self.db.write(batch)?;
        Ok(())
    }

    /// Move an immature block to orphans and reverse its provisional credits.
    pub fn write_orphan(&self, block: &BlockData) -> Result<(), StoreError> {
        let _guard = self.round_lock.lock().unwrap();
        let key = block_key(block.round_height, &block.nonce);
        let provisional = self.load_round_credits(&key)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(ColumnFamily::Immature), &key);
        let mut orphaned = block.clone();
        orphaned.orphan = true;
        batch.put_cf(&self.cf(ColumnFamily::Orphans), &key, encode(&orphaned)?);
        batch.delete_cf(&self.cf(ColumnFamily::RoundCredits), &key);

        for (address, amount) in &provisional {
            let mut account = self.load_account(address)?;
            account.immature -= amount;
            batch.put_cf(&self.cf(ColumnFamily::Miners), address, encode(&account)?);
        }
        self.delete_round_shares(&mut batch, block.round_height, &block.nonce)?;
        self.db.write(batch)?;
        Ok(())
    }

    pub fn get_miner_account(&self, login: &str) -> Result<MinerAccount, StoreError> {
        self.load_account(login)
    }

    /// Total share count of the open round.
    pub fn round_total(&self) -> Result<u64, StoreError> {
        let cf = self.cf(ColumnFamily::Meta);
        match self.db.get_cf(&cf, ROUND_TOTAL_KEY)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Drop expired hashrate rows and share fingerprints. Returns how many
    /// rows went away.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_secs();
        let mut batch = WriteBatch::default();
        let mut purged = 0;

        let hashrate_cf = self.cf(ColumnFamily::Hashrate);
        for entry in self.db.iterator_cf(&hashrate_cf, rocksdb::IteratorMode::Start) {
            let (key, value) = entry?;
            let entry: HashrateEntry = decode(&value)?;
            if entry.expires_at <= now {
                batch.delete_cf(&hashrate_cf, key);
                purged += 1;
            }
        }

        let index_cf = self.cf(ColumnFamily::ShareIndex);
        for entry in self.db.iterator_cf(&index_cf, rocksdb::IteratorMode::Start) {
            let (key, value) = entry?;
            if decode_u64(&value)? <= now {
                batch.delete_cf(&index_cf, key);
                purged += 1;
            }
        }

        self.db.write(batch)?;
        Ok(purged)
    }

    /// Hashrate rows recorded for one login that have not expired yet.
    pub fn get_hashrate_entries(&self, login: &str) -> Result<Vec<(String, u64)>, StoreError> {
        let now = now_secs();
        let cf = self.cf(ColumnFamily::Hashrate);
        let mut entries = Vec::new();
        for entry in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (_, value) = entry?;
            let entry: HashrateEntry = decode(&value)?;
            if entry.login == login && entry.expires_at > now {
                entries.push((entry.worker, entry.difficulty));
            }
        }
        Ok(entries)
    }

    fn cf(&self, cf: ColumnFamily) -> &rocksdb::ColumnFamily {
        // Column families are created in `new`; a missing handle is a
        // programming error, not a runtime condition.
        self.db
            .cf_handle(&cf)
            .unwrap_or_else(|| panic!("missing column family {}", cf.as_str()))
    }

    fn fingerprint_exists(&self, params: &[String]) -> Result<bool, StoreError> {
        let cf = self.cf(ColumnFamily::ShareIndex);
        Ok(self.db.get_cf(&cf, fingerprint(params))?.is_some())
    }

    /// Shared tail of `write_share` / `write_block`: fingerprint, round
    /// counters and the hashrate row. Caller holds the round lock.
    fn record_share_locked(
        &self,
        batch: &mut WriteBatch,
        login: &str,
        worker_id: &str,
        params: &[String],
        share_diff: u64,
        height: u64,
        hashrate_window: Duration,
    ) -> Result<(), StoreError> {
        let now = now_secs();
        let expires_at = now + hashrate_window.as_secs();

        batch.put_cf(
            &self.cf(ColumnFamily::ShareIndex),
            fingerprint(params),
            expires_at.to_be_bytes(),
        );

        let round_shares_cf = self.cf(ColumnFamily::RoundShares);
        let current_key = format!("{CURRENT_ROUND_PREFIX}{login}");
        let count = match self.db.get_cf(&round_shares_cf, &current_key)? {
            Some(bytes) => decode_u64(&bytes)? + 1,
            None => 1,
        };
        batch.put_cf(&round_shares_cf, &current_key, count.to_be_bytes());

        let total = self.round_total()? + 1;
        batch.put_cf(
            &self.cf(ColumnFamily::Meta),
            ROUND_TOTAL_KEY,
            total.to_be_bytes(),
        );

        let entry = HashrateEntry {
            login: login.to_string(),
            worker: worker_id.to_string(),
            difficulty: share_diff,
            height,
            timestamp: now,
            expires_at,
        };
        let mut hashrate_key = now_micros().to_be_bytes().to_vec();
        hashrate_key.extend_from_slice(login.as_bytes());
        hashrate_key.push(b':');
        hashrate_key.extend_from_slice(params[0].as_bytes());
        batch.put_cf(&self.cf(ColumnFamily::Hashrate), hashrate_key, encode(&entry)?);
        Ok(())
    }

    fn current_round_shares(&self) -> Result<HashMap<String, u64>, StoreError> {
        let cf = self.cf(ColumnFamily::RoundShares);
        let mut shares = HashMap::new();
        for entry in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (key, value) = entry?;
            let key = String::from_utf8_lossy(&key).to_string();
            if let Some(login) = key.strip_prefix(CURRENT_ROUND_PREFIX) {
                shares.insert(login.to_string(), decode_u64(&value)?);
            }
        }
        Ok(shares)
    }

    fn delete_round_shares(
        &self,
        batch: &mut WriteBatch,
        round_height: u64,
        nonce: &str,
    ) -> Result<(), StoreError> {
        let prefix = format!("round:{round_height}:{nonce}:");
        let cf = self.cf(ColumnFamily::RoundShares);
        for entry in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (key, _) = entry?;
            if key.starts_with(prefix.as_bytes()) {
                batch.delete_cf(&cf, key);
            }
        }
        Ok(())
    }

    fn blocks_in(
        &self,
        family: ColumnFamily,
        keep: impl Fn(&BlockData) -> bool,
    ) -> Result<Vec<BlockData>, StoreError> {
        let cf = self.cf(family);
        let mut blocks = Vec::new();
        for entry in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (_, value) = entry?;
            match decode::<BlockData>(&value) {
                Ok(block) if keep(&block) => blocks.push(block),
                Ok(_) => {}
                Err(e) => {
                    warn!("Error deserializing stored block. Database corrupted? {e}");
                }
            }
        }
        Ok(blocks)
    }

    fn load_account(&self, address: &str) -> Result<MinerAccount, StoreError> {
        let cf = self.cf(ColumnFamily::Miners);
        match self.db.get_cf(&cf, address)? {
            Some(bytes) => decode(&bytes),
            None => Ok(MinerAccount::default()),
        }
    }

    fn load_round_credits(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        let cf = self.cf(ColumnFamily::RoundCredits);
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => decode(&bytes),
            None => Ok(HashMap::new()),
        }
    }
}

fn fingerprint(params: &[String]) -> String {
    params.join(":")
}

fn block_key(round_height: u64, nonce: &str) -> String {
    format!("{round_height:020}:{nonce}")
}

fn closed_share_key(round_height: u64, nonce: &str, address: &str) -> String {
    format!("round:{round_height}:{nonce}:{address}")
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| StoreError::Codec(e.to_string()))?;
    Ok(buf)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    ciborium::de::from_reader(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    Ok(u64::from_be_bytes(bytes.try_into().map_err(|_| {
        StoreError::Codec("invalid u64 counter".to_string())
    })?))
}

/// The stratum share processor reaches the store through this seam.
impl stratum::processor::ShareWriter for Store {
    fn write_share(
        &self,
        login: &str,
        worker_id: &str,
        params: &[String],
        share_diff: u64,
        height: u64,
        hashrate_window: Duration,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        Store::write_share(self, login, worker_id, params, share_diff, height, hashrate_window)
            .map_err(|e| Box::new(e) as _)
    }

    fn write_block(
        &self,
        login: &str,
        worker_id: &str,
        params: &[String],
        share_diff: u64,
        block_diff: u64,
        height: u64,
        hashrate_window: Duration,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        Store::write_block(
            self,
            login,
            worker_id,
            params,
            share_diff,
            block_diff,
            height,
            hashrate_window,
        )
        .map_err(|e| Box::new(e) as _)
    }
}
