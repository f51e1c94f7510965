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

use crate::messages::ErrorReply;
use crate::pow::{target_hex, PowVerifier};
use crate::processor::{ShareProcessor, ShareWriter};
use crate::session::MinerSession;
use crate::template::TemplateCache;
use crate::validate::{is_valid_address, is_valid_hash, is_valid_nonce, is_valid_worker_id};
use mvsdrpc::{GetBlockReply, MvsdRpcClient};
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

/// Seam to the abuse-policy component that tracks misbehaving IPs. The
/// implementation is external to the core.
#[cfg_attr(test, automock)]
pub trait Policy: Send + Sync {
    /// Record a malformed request from this IP.
    fn apply_malformed_policy(&self, ip: &str);
    /// Returns false when the login/IP pair is banned.
    fn apply_login_policy(&self, login: &str, ip: &str) -> bool;
    /// Record a share result; returns false when the IP exceeded its
    /// invalid-share quota and should be rate-limited.
    fn apply_share_policy(&self, ip: &str, valid_share: bool) -> bool;
}

/// Policy that tracks nothing and bans nobody.
pub struct AllowAllPolicy;

impl Policy for AllowAllPolicy {
    fn apply_malformed_policy(&self, _ip: &str) {}
    fn apply_login_policy(&self, _login: &str, _ip: &str) -> bool {
        true
    }
    fn apply_share_policy(&self, _ip: &str, _valid_share: bool) -> bool {
        true
    }
}

/// Miner-facing request handlers. The listener parses frames and calls in
/// here; everything protocol-visible (error codes, worker-id fallback)
/// lives in this type.
pub struct PoolHandler<P: PowVerifier, W: ShareWriter, A: Policy> {
    processor: ShareProcessor<P, W>,
    cache: Arc<TemplateCache>,
    upstream: Arc<MvsdRpcClient>,
    policy: A,
    /// Per-endpoint share target hex, precomputed from the port difficulty.
    port_targets: Vec<String>,
}

impl<P: PowVerifier, W: ShareWriter, A: Policy> PoolHandler<P, W, A> {
    pub fn new(
        processor: ShareProcessor<P, W>,
        cache: Arc<TemplateCache>,
        upstream: Arc<MvsdRpcClient>,
        policy: A,
    ) -> Self {
        let port_targets = processor
            .ports()
            .iter()
            .map(|port| target_hex(port.difficulty))
            .collect();
        Self {
            processor,
            cache,
            upstream,
            policy,
            port_targets,
        }
    }

    /// Login with a payout address. The address must pass the syntactic
    /// check and be accepted by the node as a mainnet address.
    pub async fn handle_login(
        &self,
        session: &mut MinerSession,
        params: &[String],
    ) -> Result<bool, ErrorReply> {
        if params.is_empty() {
            return Err(ErrorReply::new(-1, "Invalid params"));
        }
        let login = &params[0];

        if !is_valid_address(login) {
            self.policy.apply_malformed_policy(&session.ip);
            return Err(ErrorReply::new(-1, "Invalid login format."));
        }

        let reply = self.upstream.validate_address(login).await;
        let usable = matches!(&reply, Ok(reply) if reply.valid());
        if !usable {
            self.policy.apply_malformed_policy(&session.ip);
            return Err(ErrorReply::new(0, "Invalid login."));
        }

        if !self.policy.apply_login_policy(login, &session.ip) {
            return Err(ErrorReply::new(-1, "You are blacklisted"));
        }

        session.login = Some(login.clone());
        info!("Stratum miner connected from {}: {}", session.ip, login);
        Ok(true)
    }

    /// Hand out the current job: [header, seed, share-difficulty target].
    pub fn handle_get_work(&self, session: &MinerSession) -> Result<[String; 3], ErrorReply> {
        let template = match self.cache.current() {
            Some(template) if !template.header_hash.is_empty() => template,
            _ => return Err(ErrorReply::new(0, "Work not ready")),
        };
        if self.upstream.is_sick() {
            return Err(ErrorReply::new(0, "Work not ready"));
        }
        let target = self
            .port_targets
            .get(session.stratum_index)
            .cloned()
            .unwrap_or_else(|| "0x0".to_string());
        Ok([
            template.header_hash.clone(),
            template.seed_hash.clone(),
            target,
        ])
    }

    /// Submit a PoW result: [nonce, hash_no_nonce, mix_digest].
    pub async fn handle_submit(
        &self,
        session: &MinerSession,
        worker_id: &str,
        params: &[String],
    ) -> Result<bool, ErrorReply> {
        let login = match &session.login {
            Some(login) if session.subscribed() => login.clone(),
            _ => return Err(ErrorReply::new(25, "Not subscribed")),
        };

        let worker_id = if is_valid_worker_id(worker_id) {
            worker_id
        } else {
            "0"
        };

        if params.len() != 3 {
            self.policy.apply_malformed_policy(&session.ip);
            warn!(
                "Malformed params from {}: {} {:?}",
                session.ip, login, params
            );
            return Err(ErrorReply::new(-1, "Invalid params"));
        }

        if !is_valid_nonce(&params[0]) || !is_valid_hash(&params[1]) || !is_valid_hash(&params[2]) {
            self.policy.apply_malformed_policy(&session.ip);
            warn!(
                "Malformed PoW result from {}: {} {:?}",
                session.ip, login, params
            );
            return Err(ErrorReply::new(-1, "Malformed PoW result"));
        }

        let template = match self.cache.current() {
            Some(template) => template,
            None => return Err(ErrorReply::new(0, "Work not ready")),
        };

        let outcome = self
            .processor
            .process(
                &login,
                worker_id,
                &session.ip,
                &template,
                params,
                session.stratum_index,
            )
            .await;
        let within_quota = self
            .policy
            .apply_share_policy(&session.ip, !outcome.exists && outcome.valid);

        if outcome.exists && outcome.valid {
            warn!("Duplicate share from {}: {} {:?}", session.ip, login, params);
            return Err(ErrorReply::new(22, "Duplicate share"));
        }

        if outcome.stale {
            info!("Stale share from {}: {}", session.ip, login);
            return Ok(false);
        }

        if !outcome.valid {
            info!("Invalid share from {}: {}", session.ip, login);
            if !within_quota {
                return Err(ErrorReply::new(23, "Invalid share"));
            }
            return Ok(false);
        }

        if !within_quota {
            return Err(ErrorReply::new(-1, "High rate of invalid or stale shares"));
        }
        Ok(true)
    }

    /// Answer "latest block" queries from the cached pending-block reply,
    /// without an upstream round-trip.
    pub fn handle_get_pending_block(&self) -> Option<Arc<GetBlockReply>> {
        self.cache.pending_block()
    }

    pub fn handle_unknown(&self, session: &MinerSession, method: &str) -> ErrorReply {
        warn!("Unknown request method from {}: {}", session.ip, method);
        self.policy.apply_malformed_policy(&session.ip);
        ErrorReply::new(-3, "Method not found")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StratumPortConfig;
    use crate::pow::EthashSeal;
    use crate::template::BlockTemplate;
    use mvsdrpc::test_utils::{mock_method, setup_mock_rpc};
    use num_bigint::BigUint;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const LOGIN: &str = "MVaJ6MDd8fg45bbXzqQSojgjcBPJ2dBvox";

    #[derive(Default)]
    struct MemWriter {
        seen: Mutex<std::collections::HashSet<String>>,
        shares: Mutex<usize>,
    }

    impl ShareWriter for MemWriter {
        fn write_share(
            &self,
            _login: &str,
            _worker_id: &str,
            params: &[String],
            _share_diff: u64,
            _height: u64,
            _hashrate_window: Duration,
        ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
            if !self.seen.lock().unwrap().insert(params.join(":")) {
                return Ok(true);
            }
            *self.shares.lock().unwrap() += 1;
            Ok(false)
        }

        fn write_block(
            &self,
            login: &str,
            worker_id: &str,
            params: &[String],
            share_diff: u64,
            _block_diff: u64,
            height: u64,
            hashrate_window: Duration,
        ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
            self.write_share(login, worker_id, params, share_diff, height, hashrate_window)
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

    fn handler(
        upstream: MvsdRpcClient,
        cache: Arc<TemplateCache>,
        policy: MockPolicy,
    ) -> PoolHandler<EthashSeal, MemWriter, MockPolicy> {
        handler_with_share_difficulty(upstream, cache, policy, 1)
    }

    fn handler_with_share_difficulty(
        upstream: MvsdRpcClient,
        cache: Arc<TemplateCache>,
        policy: MockPolicy,
        difficulty: u64,
    ) -> PoolHandler<EthashSeal, MemWriter, MockPolicy> {
        let upstream = Arc::new(upstream);
        let (refresh_tx, _refresh_rx) = mpsc::channel(1);
        let processor = ShareProcessor::new(
            upstream.clone(),
            Arc::new(MemWriter::default()),
            EthashSeal,
            vec![port(difficulty)],
            Duration::from_secs(600),
            refresh_tx,
        );
        PoolHandler::new(processor, cache, upstream, policy)
    }

    fn stored_template(cache: &TemplateCache, difficulty: u64) {
        cache.store(
            BlockTemplate {
                header_hash: format!("0x{}", "aa".repeat(32)),
                seed_hash: format!("0x{}", "bb".repeat(32)),
                target: "0x1".to_string(),
                height: 1000,
                difficulty: BigUint::from(difficulty),
            },
            GetBlockReply::default(),
        );
    }

    fn share_params() -> Vec<String> {
        vec![
            "0x00112233aabbccdd".to_string(),
            format!("0x{}", "aa".repeat(32)),
            format!("0x{}", "cc".repeat(32)),
        ]
    }

    #[tokio::test]
    async fn test_login_accepts_mainnet_address() {
        let (server, client) = setup_mock_rpc().await;
        mock_method(
            &server,
            "validateaddress",
            json!([LOGIN]),
            json!({"is_valid": true, "testnet": false}),
        )
        .await;
        let mut policy = MockPolicy::new();
        policy.expect_apply_login_policy().return_const(true);
        let handler = handler(client, Arc::new(TemplateCache::new()), policy);

        let mut session = MinerSession::new("1.2.3.4".to_string(), 0);
        let accepted = handler
            .handle_login(&mut session, &[LOGIN.to_string()])
            .await
            .unwrap();
        assert!(accepted);
        assert_eq!(session.login.as_deref(), Some(LOGIN));
    }

    #[tokio::test]
    async fn test_login_rejects_bad_format_and_applies_policy() {
        let (_server, client) = setup_mock_rpc().await;
        let mut policy = MockPolicy::new();
        // The policy fires before the error goes back to the miner.
        policy
            .expect_apply_malformed_policy()
            .times(1)
            .return_const(());
        let handler = handler(client, Arc::new(TemplateCache::new()), policy);

        let mut session = MinerSession::new("1.2.3.4".to_string(), 0);
        let err = handler
            .handle_login(&mut session, &["nonsense".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code, -1);
        assert!(session.login.is_none());
    }

    #[tokio::test]
    async fn test_login_rejects_testnet_address_with_code_zero() {
        let (server, client) = setup_mock_rpc().await;
        mock_method(
            &server,
            "validateaddress",
            json!([LOGIN]),
            json!({"is_valid": true, "testnet": true}),
        )
        .await;
        let mut policy = MockPolicy::new();
        policy
            .expect_apply_malformed_policy()
            .times(1)
            .return_const(());
        let handler = handler(client, Arc::new(TemplateCache::new()), policy);

        let mut session = MinerSession::new("1.2.3.4".to_string(), 0);
        let err = handler
            .handle_login(&mut session, &[LOGIN.to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code, 0);
    }

    #[tokio::test]
    async fn test_login_blacklist() {
        let (server, client) = setup_mock_rpc().await;
        mock_method(
            &server,
            "validateaddress",
            json!([LOGIN]),
            json!({"is_valid": true, "testnet": false}),
        )
        .await;
        let mut policy = MockPolicy::new();
        policy.expect_apply_login_policy().return_const(false);
        let handler = handler(client, Arc::new(TemplateCache::new()), policy);

        let mut session = MinerSession::new("1.2.3.4".to_string(), 0);
        let err = handler
            .handle_login(&mut session, &[LOGIN.to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code, -1);
        assert_eq!(err.message, "You are blacklisted");
    }

    #[tokio::test]
    async fn test_get_work_requires_template() {
        let (_server, client) = setup_mock_rpc().await;
        let handler = handler(client, Arc::new(TemplateCache::new()), MockPolicy::new());
        let session = MinerSession::new("1.2.3.4".to_string(), 0);

        let err = handler.handle_get_work(&session).unwrap_err();
        assert_eq!(err.code, 0);
        assert_eq!(err.message, "Work not ready");
    }

    #[tokio::test]
    async fn test_get_work_returns_header_seed_target() {
        let (_server, client) = setup_mock_rpc().await;
        let cache = Arc::new(TemplateCache::new());
        stored_template(&cache, 1_000_000_000);
        let handler = handler(client, cache, MockPolicy::new());
        let session = MinerSession::new("1.2.3.4".to_string(), 0);

        let work = handler.handle_get_work(&session).unwrap();
        assert_eq!(work[0], format!("0x{}", "aa".repeat(32)));
        assert_eq!(work[1], format!("0x{}", "bb".repeat(32)));
        assert_eq!(work[2], target_hex(1));
    }

    #[tokio::test]
    async fn test_submit_before_login_is_not_subscribed() {
        let (_server, client) = setup_mock_rpc().await;
        let handler = handler(client, Arc::new(TemplateCache::new()), MockPolicy::new());
        let session = MinerSession::new("1.2.3.4".to_string(), 0);

        let err = handler
            .handle_submit(&session, "0", &share_params())
            .await
            .unwrap_err();
        assert_eq!(err.code, 25);
    }

    #[tokio::test]
    async fn test_submit_malformed_pow_result() {
        let (_server, client) = setup_mock_rpc().await;
        let mut policy = MockPolicy::new();
        policy
            .expect_apply_malformed_policy()
            .times(1)
            .return_const(());
        let handler = handler(client, Arc::new(TemplateCache::new()), policy);
        let mut session = MinerSession::new("1.2.3.4".to_string(), 0);
        session.login = Some(LOGIN.to_string());

        let params = vec![
            "0xNONSENSE".to_string(),
            format!("0x{}", "aa".repeat(32)),
            format!("0x{}", "cc".repeat(32)),
        ];
        let err = handler
            .handle_submit(&session, "0", &params)
            .await
            .unwrap_err();
        assert_eq!(err.code, -1);
        assert_eq!(err.message, "Malformed PoW result");
    }

    #[tokio::test]
    async fn test_submit_valid_share_with_worker_fallback() {
        let (_server, client) = setup_mock_rpc().await;
        let cache = Arc::new(TemplateCache::new());
        stored_template(&cache, u64::MAX);
        let mut policy = MockPolicy::new();
        policy.expect_apply_share_policy().return_const(true);
        let handler = handler(client, cache, policy);
        let mut session = MinerSession::new("1.2.3.4".to_string(), 0);
        session.login = Some(LOGIN.to_string());

        // Worker id longer than 8 chars falls back to "0" instead of a reject.
        let accepted = handler
            .handle_submit(&session, "far-too-long-rig-name", &share_params())
            .await
            .unwrap();
        assert!(accepted);
    }

    #[tokio::test]
    async fn test_submit_duplicate_share_code_22() {
        let (_server, client) = setup_mock_rpc().await;
        let cache = Arc::new(TemplateCache::new());
        stored_template(&cache, u64::MAX);
        let mut policy = MockPolicy::new();
        policy.expect_apply_share_policy().return_const(true);
        let handler = handler(client, cache, policy);
        let mut session = MinerSession::new("1.2.3.4".to_string(), 0);
        session.login = Some(LOGIN.to_string());

        handler
            .handle_submit(&session, "0", &share_params())
            .await
            .unwrap();
        let err = handler
            .handle_submit(&session, "0", &share_params())
            .await
            .unwrap_err();
        assert_eq!(err.code, 22);
    }

    #[tokio::test]
    async fn test_submit_stale_share_is_ok_false() {
        let (_server, client) = setup_mock_rpc().await;
        let cache = Arc::new(TemplateCache::new());
        let mut policy = MockPolicy::new();
        policy.expect_apply_share_policy().return_const(true);
        // Template header differs from the submitted hash_no_nonce.
        cache.store(
            BlockTemplate {
                header_hash: format!("0x{}", "bb".repeat(32)),
                seed_hash: format!("0x{}", "bb".repeat(32)),
                target: "0x1".to_string(),
                height: 1001,
                difficulty: BigUint::from(u64::MAX),
            },
            GetBlockReply::default(),
        );
        let handler = handler(client, cache, policy);
        let mut session = MinerSession::new("1.2.3.4".to_string(), 0);
        session.login = Some(LOGIN.to_string());

        let accepted = handler
            .handle_submit(&session, "0", &share_params())
            .await
            .unwrap();
        assert!(!accepted);
    }

    #[tokio::test]
    async fn test_submit_rate_limited_invalid_share_code_23() {
        let (_server, client) = setup_mock_rpc().await;
        let cache = Arc::new(TemplateCache::new());
        let mut policy = MockPolicy::new();
        policy.expect_apply_share_policy().return_const(false);
        cache.store(
            BlockTemplate {
                header_hash: format!("0x{}", "bb".repeat(32)),
                seed_hash: format!("0x{}", "bb".repeat(32)),
                target: "0x1".to_string(),
                height: 1001,
                difficulty: BigUint::from(u64::MAX),
            },
            GetBlockReply::default(),
        );
        // Share difficulty nothing can meet, so the submission is invalid
        // rather than stale.
        let handler = handler_with_share_difficulty(client, cache, policy, u64::MAX);
        let mut session = MinerSession::new("1.2.3.4".to_string(), 0);
        session.login = Some(LOGIN.to_string());

        let mut params = share_params();
        params[1] = format!("0x{}", "bb".repeat(32));
        let err = handler
            .handle_submit(&session, "0", &params)
            .await
            .unwrap_err();
        assert_eq!(err.code, 23);
    }

    #[tokio::test]
    async fn test_unknown_method_code_minus_three() {
        let (_server, client) = setup_mock_rpc().await;
        let mut policy = MockPolicy::new();
        policy
            .expect_apply_malformed_policy()
            .times(1)
            .return_const(());
        let handler = handler(client, Arc::new(TemplateCache::new()), policy);
        let session = MinerSession::new("1.2.3.4".to_string(), 0);

        let err = handler.handle_unknown(&session, "eth_mystery");
        assert_eq!(err.code, -3);
    }
}
