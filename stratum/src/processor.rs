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

use crate::config::StratumPortConfig;
use crate::pow::{PowVerifier, ProofOfWork};
use crate::template::BlockTemplate;
use mvsdrpc::MvsdRpcClient;
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Sink for accepted shares and found blocks. Implemented by the pool's
/// persistent store; the stratum crate only depends on this seam.
pub trait ShareWriter: Send + Sync {
    /// Record a share under the current round. Returns true if the same
    /// (nonce, hash_no_nonce, mix_digest) fingerprint was already recorded.
    fn write_share(
        &self,
        login: &str,
        worker_id: &str,
        params: &[String],
        share_diff: u64,
        height: u64,
        hashrate_window: Duration,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>>;

    /// As `write_share`, and atomically close the current round into a
    /// block candidate keyed by (height, nonce).
    #[allow(clippy::too_many_arguments)]
    fn write_block(
        &self,
        login: &str,
        worker_id: &str,
        params: &[String],
        share_diff: u64,
        block_diff: u64,
        height: u64,
        hashrate_window: Duration,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>>;
}

/// Outcome triple of one submission. Encodes one of five cases:
/// stale, invalid, valid share, valid block, duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareOutcome {
    pub exists: bool,
    pub valid: bool,
    pub stale: bool,
}

impl ShareOutcome {
    /// Submission's hash does not match the current template.
    pub fn stale() -> Self {
        Self {
            exists: false,
            valid: false,
            stale: true,
        }
    }

    /// PoW failed at share difficulty, or the upstream rejected or errored
    /// on a submitted block.
    pub fn invalid() -> Self {
        Self {
            exists: false,
            valid: false,
            stale: false,
        }
    }

    /// Share or block fingerprint was already recorded.
    pub fn duplicate() -> Self {
        Self {
            exists: true,
            valid: true,
            stale: false,
        }
    }

    /// Valid share or valid block, recorded.
    pub fn accepted() -> Self {
        Self {
            exists: false,
            valid: true,
            stale: false,
        }
    }
}

/// Classifies each submission against the template it was mined on, records
/// it, and pushes full solutions to the upstream node.
pub struct ShareProcessor<P: PowVerifier, W: ShareWriter> {
    upstream: Arc<MvsdRpcClient>,
    writer: Arc<W>,
    verifier: P,
    ports: Vec<StratumPortConfig>,
    hashrate_window: Duration,
    refresh_tx: mpsc::Sender<()>,
}

impl<P: PowVerifier, W: ShareWriter> ShareProcessor<P, W> {
    pub fn new(
        upstream: Arc<MvsdRpcClient>,
        writer: Arc<W>,
        verifier: P,
        ports: Vec<StratumPortConfig>,
        hashrate_window: Duration,
        refresh_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            upstream,
            writer,
            verifier,
            ports,
            hashrate_window,
            refresh_tx,
        }
    }

    pub fn ports(&self) -> &[StratumPortConfig] {
        &self.ports
    }

    /// Process one submission. `params` is [nonce, hash_no_nonce, mix_digest],
    /// already pattern-checked by the handler. The template is the snapshot
    /// the caller read at entry; a swap mid-processing does not retroactively
    /// invalidate the submission.
    pub async fn process(
        &self,
        login: &str,
        worker_id: &str,
        ip: &str,
        template: &BlockTemplate,
        params: &[String],
        stratum_index: usize,
    ) -> ShareOutcome {
        let share_diff = match self.ports.get(stratum_index) {
            Some(port) => port.difficulty,
            None => {
                error!("Submission for unknown stratum endpoint {stratum_index}");
                return ShareOutcome::invalid();
            }
        };

        let nonce_hex = &params[0];
        let hash_no_nonce = &params[1];
        let mix_digest = &params[2];

        if !template.header_hash.eq_ignore_ascii_case(hash_no_nonce) {
            return ShareOutcome::stale();
        }

        let nonce = u64::from_str_radix(nonce_hex.trim_start_matches("0x"), 16).unwrap_or_default();
        let (hash_bytes, mix_bytes) = match (decode_hash(hash_no_nonce), decode_hash(mix_digest)) {
            (Some(hash), Some(mix)) => (hash, mix),
            _ => return ShareOutcome::invalid(),
        };

        let share = ProofOfWork {
            height: template.height,
            hash_no_nonce: hash_bytes,
            difficulty: BigUint::from(share_diff),
            nonce,
            mix_digest: mix_bytes,
        };
        let block = ProofOfWork {
            difficulty: template.difficulty.clone(),
            ..share.clone()
        };

        if !self.verifier.verify(&share) {
            return ShareOutcome::invalid();
        }

        if self.verifier.verify(&block) {
            match self.upstream.submit_work(params).await {
                Err(e) => {
                    error!(
                        "Block submission failure at height {} for {}: {}",
                        template.height, template.header_hash, e
                    );
                    return ShareOutcome::invalid();
                }
                Ok(false) => {
                    warn!(
                        "Block rejected at height {} for {}",
                        template.height, template.header_hash
                    );
                    return ShareOutcome::invalid();
                }
                Ok(true) => {
                    // The chain advanced; ask the refresher for new work now
                    // instead of waiting out the poll interval.
                    let _ = self.refresh_tx.try_send(());
                    let block_diff = template.difficulty.to_u64().unwrap_or(u64::MAX);
                    match self.writer.write_block(
                        login,
                        worker_id,
                        params,
                        share_diff,
                        block_diff,
                        template.height,
                        self.hashrate_window,
                    ) {
                        Ok(true) => return ShareOutcome::duplicate(),
                        Ok(false) => {
                            info!("Inserted block candidate at height {}", template.height)
                        }
                        Err(e) => {
                            error!("Failed to insert block candidate into backend: {e}")
                        }
                    }
                    info!(
                        "Block found by miner {}@{} at height {}",
                        login, ip, template.height
                    );
                }
            }
        } else {
            match self.writer.write_share(
                login,
                worker_id,
                params,
                share_diff,
                template.height,
                self.hashrate_window,
            ) {
                Ok(true) => return ShareOutcome::duplicate(),
                Ok(false) => {}
                Err(e) => error!("Failed to insert share data into backend: {e}"),
            }
        }

        ShareOutcome::accepted()
    }
}

fn decode_hash(s: &str) -> Option<[u8; 32]> {
    hex::decode(s.trim_start_matches("0x"))
        .ok()?
        .try_into()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow::EthashSeal;
    use mvsdrpc::test_utils::{mock_method_any_params, setup_mock_rpc};
    use std::sync::Mutex;

    /// In-memory writer recording calls, mirroring the store contract.
    #[derive(Default)]
    struct RecordingWriter {
        shares: Mutex<Vec<String>>,
        blocks: Mutex<Vec<(u64, String)>>,
        seen: Mutex<std::collections::HashSet<String>>,
        fail: bool,
    }

    impl ShareWriter for RecordingWriter {
        fn write_share(
            &self,
            login: &str,
            _worker_id: &str,
            params: &[String],
            _share_diff: u64,
            _height: u64,
            _hashrate_window: Duration,
        ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
            if self.fail {
                return Err("store down".into());
            }
            let fingerprint = params.join(":");
            if !self.seen.lock().unwrap().insert(fingerprint) {
                return Ok(true);
            }
            self.shares.lock().unwrap().push(login.to_string());
            Ok(false)
        }

        fn write_block(
            &self,
            _login: &str,
            _worker_id: &str,
            params: &[String],
            _share_diff: u64,
            _block_diff: u64,
            height: u64,
            _hashrate_window: Duration,
        ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
            if self.fail {
                return Err("store down".into());
            }
            let fingerprint = params.join(":");
            if !self.seen.lock().unwrap().insert(fingerprint) {
                return Ok(true);
            }
            self.blocks.lock().unwrap().push((height, params[0].clone()));
            Ok(false)
        }
    }

    fn port(difficulty: u64) -> StratumPortConfig {
        StratumPortConfig {
            name: "stratum-test".to_string(),
            enabled: true,
            listen: "127.0.0.1:0".to_string(),
            difficulty,
            max_conn: 16,
        }
    }

    fn template(difficulty: u64) -> BlockTemplate {
        BlockTemplate {
            header_hash: format!("0x{}", "aa".repeat(32)),
            seed_hash: format!("0x{}", "bb".repeat(32)),
            target: "0x1".to_string(),
            height: 1000,
            difficulty: BigUint::from(difficulty),
        }
    }

    fn params() -> Vec<String> {
        vec![
            "0x00112233aabbccdd".to_string(),
            format!("0x{}", "aa".repeat(32)),
            format!("0x{}", "cc".repeat(32)),
        ]
    }

    async fn processor(
        upstream: Arc<MvsdRpcClient>,
        writer: Arc<RecordingWriter>,
    ) -> ShareProcessor<EthashSeal, RecordingWriter> {
        let (refresh_tx, _refresh_rx) = mpsc::channel(1);
        ShareProcessor::new(
            upstream,
            writer,
            EthashSeal,
            vec![port(1)],
            Duration::from_secs(600),
            refresh_tx,
        )
    }

    /// Block difficulty nothing can meet, so submissions stay plain shares.
    fn unreachable_difficulty() -> u64 {
        u64::MAX
    }

    #[tokio::test]
    async fn test_valid_share_not_a_block() {
        let (_server, client) = setup_mock_rpc().await;
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(Arc::new(client), writer.clone()).await;

        let template = template(unreachable_difficulty());
        let outcome = processor
            .process("login", "0", "1.2.3.4", &template, &params(), 0)
            .await;

        assert_eq!(outcome, ShareOutcome::accepted());
        assert_eq!(writer.shares.lock().unwrap().len(), 1);
        assert!(writer.blocks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_share_when_header_differs() {
        let (_server, client) = setup_mock_rpc().await;
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(Arc::new(client), writer.clone()).await;

        let mut template = template(unreachable_difficulty());
        template.header_hash = format!("0x{}", "bb".repeat(32));
        let outcome = processor
            .process("login", "0", "1.2.3.4", &template, &params(), 0)
            .await;

        assert_eq!(outcome, ShareOutcome::stale());
        assert!(writer.shares.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_share_reports_exists() {
        let (_server, client) = setup_mock_rpc().await;
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(Arc::new(client), writer.clone()).await;

        let template = template(unreachable_difficulty());
        let first = processor
            .process("login", "0", "1.2.3.4", &template, &params(), 0)
            .await;
        let second = processor
            .process("login", "0", "1.2.3.4", &template, &params(), 0)
            .await;

        assert_eq!(first, ShareOutcome::accepted());
        assert_eq!(second, ShareOutcome::duplicate());
        assert_eq!(writer.shares.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_valid_block_submits_and_writes_candidate() {
        let (server, client) = setup_mock_rpc().await;
        mock_method_any_params(&server, "submitwork", serde_json::json!(true)).await;
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(Arc::new(client), writer.clone()).await;

        // Block difficulty 1: the share meets both tiers.
        let template = template(1);
        let outcome = processor
            .process("login", "0", "1.2.3.4", &template, &params(), 0)
            .await;

        assert_eq!(outcome, ShareOutcome::accepted());
        let blocks = writer.blocks.lock().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0], (1000, "0x00112233aabbccdd".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_block_is_invalid() {
        let (server, client) = setup_mock_rpc().await;
        mock_method_any_params(&server, "submitwork", serde_json::json!(false)).await;
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(Arc::new(client), writer.clone()).await;

        let template = template(1);
        let outcome = processor
            .process("login", "0", "1.2.3.4", &template, &params(), 0)
            .await;

        assert_eq!(outcome, ShareOutcome::invalid());
        assert!(writer.blocks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_transport_error_is_invalid() {
        // No submitwork mock mounted: the wiremock server answers 404.
        let (_server, client) = setup_mock_rpc().await;
        let writer = Arc::new(RecordingWriter::default());
        let processor = processor(Arc::new(client), writer.clone()).await;

        let template = template(1);
        let outcome = processor
            .process("login", "0", "1.2.3.4", &template, &params(), 0)
            .await;

        assert_eq!(outcome, ShareOutcome::invalid());
        assert!(writer.blocks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_block_submission_triggers_refresh() {
        let (server, client) = setup_mock_rpc().await;
        mock_method_any_params(&server, "submitwork", serde_json::json!(true)).await;
        let writer = Arc::new(RecordingWriter::default());
        let (refresh_tx, mut refresh_rx) = mpsc::channel(1);
        let processor = ShareProcessor::new(
            Arc::new(client),
            writer,
            EthashSeal,
            vec![port(1)],
            Duration::from_secs(600),
            refresh_tx,
        );

        let template = template(1);
        processor
            .process("login", "0", "1.2.3.4", &template, &params(), 0)
            .await;

        assert!(refresh_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_store_error_still_accepts_share() {
        let (_server, client) = setup_mock_rpc().await;
        let writer = Arc::new(RecordingWriter {
            fail: true,
            ..Default::default()
        });
        let processor = processor(Arc::new(client), writer).await;

        let template = template(unreachable_difficulty());
        let outcome = processor
            .process("login", "0", "1.2.3.4", &template, &params(), 0)
            .await;

        // A backend failure must not bounce the miner.
        assert_eq!(outcome, ShareOutcome::accepted());
    }
}
