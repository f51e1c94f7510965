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

/// A request from a miner. Stock ethash miners speak the eth_ namespace
/// (eth_submitLogin, eth_getWork, eth_submitWork, eth_submitHashrate) with
/// string params; the worker id rides in a separate field.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Request {
    #[serde(default)]
    pub id: serde_json::Value,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub worker: String,
}

impl Request {
    /// Decode params as the list of strings every miner method carries.
    pub fn string_params(&self) -> Option<Vec<String>> {
        serde_json::from_value(self.params.clone()).ok()
    }
}

/// Error payload surfaced to miners. The codes are part of the protocol:
/// -1 malformed/invalid params, -3 unknown method, 0 invalid login or work
/// not ready, 22 duplicate share, 23 invalid share when rate-limited,
/// 25 not subscribed.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: i32,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: i32, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Response {
    pub id: serde_json::Value,
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReply>,
}

impl Response {
    pub fn ok(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: serde_json::Value, error: ErrorReply) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
        }
    }
}
