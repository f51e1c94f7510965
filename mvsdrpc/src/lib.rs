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

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::error;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// Consecutive failures before the client flips to sick.
const SICK_THRESHOLD: u32 = 5;
/// Consecutive successes before sickness clears and both counters reset.
const ALIVE_THRESHOLD: u32 = 5;

/// JSON-RPC 2.0 request envelope as the mvsd node expects it.
/// The node ignores the id, so we always send 0.
#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Vec<serde_json::Value>,
    id: u64,
}

/// JSON-RPC response envelope. A non-null `error` field is failure,
/// otherwise `result` carries the typed reply (possibly null).
#[derive(Deserialize, Debug)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    #[serde(default)]
    code: i32,
    message: String,
}

/// Error type for the MvsdRpcClient
#[derive(Debug)]
pub enum MvsdRpcError {
    Transport { message: String },
    Http { status_code: u16, message: String },
    Parse { message: String },
    Rpc { code: i32, message: String },
    Other(String),
}

impl Error for MvsdRpcError {}

impl fmt::Display for MvsdRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MvsdRpcError::Transport { message } => write!(f, "Transport error: {message}"),
            MvsdRpcError::Http {
                status_code,
                message,
            } => write!(f, "HTTP error {status_code}: {message}"),
            MvsdRpcError::Parse { message } => write!(f, "Parse error: {message}"),
            MvsdRpcError::Rpc { code, message } => write!(f, "RPC error {code}: {message}"),
            MvsdRpcError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct MvsdRpcConfig {
    pub name: String,
    pub url: String,
    pub account: String,
    pub password: String,
    /// Per-call timeout, e.g. "10s"
    pub timeout: String,
}

/// Custom Debug to redact the account password
impl fmt::Debug for MvsdRpcConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MvsdRpcConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("account", &self.account)
            .field("password", &"[redacted]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Reply to `fetch-balance`
#[derive(Deserialize, Debug, Clone)]
pub struct GetBalanceReply {
    #[serde(default)]
    pub unspent: i64,
}

/// Reply to `validateaddress`
#[derive(Deserialize, Debug, Clone)]
pub struct ValidateAddressReply {
    #[serde(default)]
    pub is_valid: bool,
    #[serde(default)]
    pub testnet: bool,
}

impl ValidateAddressReply {
    /// An address is usable iff the node accepts it and it is not a testnet address.
    pub fn valid(&self) -> bool {
        self.is_valid && !self.testnet
    }
}

/// Block header or full block as returned by `getblockheader`, `getblock`
/// and `fetchheaderext`. Header replies leave `transactions` empty.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct GetBlockReply {
    /// Decimal block difficulty. The node reports it under "bits".
    #[serde(rename = "bits", default)]
    pub difficulty: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub merkle_tree_hash: String,
    #[serde(default)]
    pub mixhash: String,
    /// Decimal nonce string
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub number: u64,
    #[serde(rename = "previous_block_hash", default)]
    pub prev_hash: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub transaction_count: u64,
    #[serde(default)]
    pub transactions: Vec<MvsTx>,
}

impl GetBlockReply {
    pub fn confirmed(&self) -> bool {
        !self.hash.is_empty()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct MvsTx {
    #[serde(default)]
    pub hash: String,
    #[serde(rename = "lock_time", default)]
    pub lock_time: String,
    #[serde(default)]
    pub outputs: Vec<MvsTxOutput>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct MvsTxOutput {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub value: i64,
}

/// Health counter pair. Both counters live under one lock so they always
/// reset together when the client leaves sickness.
#[derive(Debug, Default)]
struct Health {
    sick: bool,
    sick_count: u32,
    success_count: u32,
}

/// JSON-RPC client for the mvsd node.
///
/// The client tracks upstream health: every failed call (transport, decode
/// or RPC error) counts against the node, every successful call counts for
/// it. Sickness is advisory; callers consult `is_sick` to stop serving work
/// while the upstream is degraded. The client never retries internally.
pub struct MvsdRpcClient {
    client: reqwest::Client,
    pub name: String,
    url: String,
    account: String,
    password: String,
    health: Mutex<Health>,
}

impl MvsdRpcClient {
    pub fn new(
        name: &str,
        url: &str,
        account: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, MvsdRpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MvsdRpcError::Other(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            name: name.to_string(),
            url: url.to_string(),
            account: account.to_string(),
            password: password.to_string(),
            health: Mutex::new(Health::default()),
        })
    }

    /// Issue a single JSON-RPC call. Returns the raw `result` value, with
    /// JSON null mapped to `None`. Updates the health counters.
    pub async fn request(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, MvsdRpcError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 0,
        };

        let response = match self.client.post(&self.url).json(&request).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!("{}: request {} failed: {}", self.name, method, e);
                self.mark_sick();
                return Err(MvsdRpcError::Transport {
                    message: e.to_string(),
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!("{}: node returned HTTP {} for {}", self.name, status, method);
            self.mark_sick();
            return Err(MvsdRpcError::Http {
                status_code: status.as_u16(),
                message,
            });
        }

        let rpc_response: JsonRpcResponse = match response.json().await {
            Ok(decoded) => decoded,
            Err(e) => {
                self.mark_sick();
                return Err(MvsdRpcError::Parse {
                    message: format!("Failed to parse response: {e}"),
                });
            }
        };

        if let Some(rpc_error) = rpc_response.error {
            self.mark_sick();
            return Err(MvsdRpcError::Rpc {
                code: rpc_error.code,
                message: rpc_error.message,
            });
        }

        self.mark_alive();
        match rpc_response.result {
            Some(value) if !value.is_null() => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// As `request`, but decodes a non-null result into `T`. A null result
    /// is a protocol violation for the methods routed through here.
    async fn request_typed<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, MvsdRpcError> {
        match self.request(method, params).await? {
            Some(value) => serde_json::from_value(value).map_err(|e| MvsdRpcError::Parse {
                message: format!("Unexpected {method} reply: {e}"),
            }),
            None => Err(MvsdRpcError::Parse {
                message: format!("Null result for {method}"),
            }),
        }
    }

    /// `getwork` -> [header_hex, seed_hex, target_hex]
    pub async fn get_work(&self) -> Result<Vec<String>, MvsdRpcError> {
        self.request_typed("getwork", vec![]).await
    }

    /// `submitwork [nonce_hex, hash_no_nonce_hex, mix_digest_hex]`
    pub async fn submit_work(&self, params: &[String]) -> Result<bool, MvsdRpcError> {
        let params = params
            .iter()
            .map(|p| serde_json::Value::String(p.clone()))
            .collect();
        self.request_typed("submitwork", params).await
    }

    /// `setminingaccount [account, password, address]`
    pub async fn set_mining_account(&self, address: &str) -> Result<Vec<String>, MvsdRpcError> {
        let params = vec![
            self.account.clone().into(),
            self.password.clone().into(),
            address.into(),
        ];
        self.request_typed("setminingaccount", params).await
    }

    /// `validateaddress [address]`
    pub async fn validate_address(
        &self,
        address: &str,
    ) -> Result<ValidateAddressReply, MvsdRpcError> {
        self.request_typed("validateaddress", vec![address.into()])
            .await
    }

    /// `getheight []`
    pub async fn get_height(&self) -> Result<u64, MvsdRpcError> {
        self.request_typed("getheight", vec![]).await
    }

    /// Pending block header via `fetchheaderext [account, password, "pending"]`
    pub async fn get_pending_block(&self) -> Result<GetBlockReply, MvsdRpcError> {
        let params = vec![
            self.account.clone().into(),
            self.password.clone().into(),
            "pending".into(),
        ];
        self.request_typed("fetchheaderext", params).await
    }

    /// `getblockheader ["-t", height]`. A null reply means the node has not
    /// seen the height and is surfaced as `None`.
    pub async fn get_block_by_height(
        &self,
        height: u64,
    ) -> Result<Option<GetBlockReply>, MvsdRpcError> {
        self.get_block_by("getblockheader", vec!["-t".into(), height.into()])
            .await
    }

    /// `getblockheader ["-s", hash]`
    pub async fn get_block_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<GetBlockReply>, MvsdRpcError> {
        self.get_block_by("getblockheader", vec!["-s".into(), hash.into()])
            .await
    }

    async fn get_block_by(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<Option<GetBlockReply>, MvsdRpcError> {
        match self.request(method, params).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| MvsdRpcError::Parse {
                    message: format!("Unexpected {method} reply: {e}"),
                }),
            None => Ok(None),
        }
    }

    /// Full block including transactions via `getblock [height]`
    pub async fn get_block_txs(&self, height: u64) -> Result<GetBlockReply, MvsdRpcError> {
        self.request_typed("getblock", vec![height.into()]).await
    }

    /// `sendfrom [account, password, from, to, value]`, returns the tx hash
    pub async fn send_transaction(
        &self,
        from: &str,
        to: &str,
        value: &str,
    ) -> Result<String, MvsdRpcError> {
        let params = vec![
            self.account.clone().into(),
            self.password.clone().into(),
            from.into(),
            to.into(),
            value.into(),
        ];
        let tx: MvsTx = self.request_typed("sendfrom", params).await?;
        Ok(tx.hash)
    }

    /// `fetch-balance [address]`
    pub async fn get_balance(&self, address: &str) -> Result<GetBalanceReply, MvsdRpcError> {
        self.request_typed("fetch-balance", vec![address.into()])
            .await
    }

    /// `getpeerinfo []`, reduced to the peer count
    pub async fn get_peer_count(&self) -> Result<usize, MvsdRpcError> {
        let peers: Vec<String> = self.request_typed("getpeerinfo", vec![]).await?;
        Ok(peers.len())
    }

    /// Probe the node with a `getwork` and report overall health.
    pub async fn check(&self) -> bool {
        if self.get_work().await.is_err() {
            return false;
        }
        !self.is_sick()
    }

    pub fn is_sick(&self) -> bool {
        self.health.lock().unwrap().sick
    }

    fn mark_sick(&self) {
        let mut health = self.health.lock().unwrap();
        health.sick_count += 1;
        health.success_count = 0;
        if health.sick_count >= SICK_THRESHOLD {
            health.sick = true;
        }
    }

    fn mark_alive(&self) {
        let mut health = self.health.lock().unwrap();
        health.success_count += 1;
        if health.success_count >= ALIVE_THRESHOLD {
            health.sick = false;
            health.sick_count = 0;
            health.success_count = 0;
        }
    }
}
