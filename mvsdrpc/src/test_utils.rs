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

use crate::MvsdRpcClient;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Start a wiremock server and a client pointed at it. The client uses the
/// test account "pool"/"secret" so callers can match account-bearing params.
pub async fn setup_mock_rpc() -> (MockServer, MvsdRpcClient) {
    let mock_server = MockServer::start().await;
    let client = MvsdRpcClient::new(
        "test",
        &mock_server.uri(),
        "pool",
        "secret",
        Duration::from_secs(5),
    )
    .expect("Failed to create test client");
    (mock_server, client)
}

/// Mount a mock for one JSON-RPC method with exact params matching.
pub async fn mock_method(
    mock_server: &MockServer,
    api_method: &str,
    params: serde_json::Value,
    result: serde_json::Value,
) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_json(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": api_method,
            "params": params,
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "result": result, "error": null, "id": 0 })),
        )
        .mount(mock_server)
        .await;
}

/// Mount a mock that answers one method with any params.
pub async fn mock_method_any_params(
    mock_server: &MockServer,
    api_method: &str,
    result: serde_json::Value,
) {
    let api_method = api_method.to_string();
    Mock::given(method("POST"))
        .and(path("/"))
        .and(move |request: &wiremock::Request| {
            serde_json::from_slice::<serde_json::Value>(&request.body)
                .ok()
                .and_then(|body| body.get("method").cloned())
                .is_some_and(|m| m == serde_json::Value::String(api_method.clone()))
        })
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "result": result, "error": null, "id": 0 })),
        )
        .mount(mock_server)
        .await;
}

/// Mount a mock that fails one method with a JSON-RPC error.
pub async fn mock_rpc_error(mock_server: &MockServer, api_method: &str, code: i32, message: &str) {
    let api_method = api_method.to_string();
    Mock::given(method("POST"))
        .and(path("/"))
        .and(move |request: &wiremock::Request| {
            serde_json::from_slice::<serde_json::Value>(&request.body)
                .ok()
                .and_then(|body| body.get("method").cloned())
                .is_some_and(|m| m == serde_json::Value::String(api_method.clone()))
        })
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": null,
            "error": { "code": code, "message": message },
            "id": 0,
        })))
        .mount(mock_server)
        .await;
}
