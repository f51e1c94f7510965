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
use crate::handlers::{Policy, PoolHandler};
use crate::messages::{ErrorReply, Request, Response};
use crate::pow::PowVerifier;
use crate::processor::ShareWriter;
use crate::session::MinerSession;
use crate::template::BlockTemplate;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot, Semaphore};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info};

/// Prevents DoS via unbounded request lines.
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// One listening stratum endpoint. Frames newline-delimited JSON requests,
/// keeps a session per connection and pushes new jobs to logged-in miners.
pub struct StratumServer<P: PowVerifier, W: ShareWriter, A: Policy> {
    config: StratumPortConfig,
    stratum_index: usize,
    handler: Arc<PoolHandler<P, W, A>>,
    shutdown_rx: oneshot::Receiver<()>,
    jobs_tx: broadcast::Sender<Arc<BlockTemplate>>,
}

impl<P, W, A> StratumServer<P, W, A>
where
    P: PowVerifier + 'static,
    W: ShareWriter + 'static,
    A: Policy + 'static,
{
    pub fn new(
        config: StratumPortConfig,
        stratum_index: usize,
        handler: Arc<PoolHandler<P, W, A>>,
        shutdown_rx: oneshot::Receiver<()>,
        jobs_tx: broadcast::Sender<Arc<BlockTemplate>>,
    ) -> Self {
        Self {
            config,
            stratum_index,
            handler,
            shutdown_rx,
            jobs_tx,
        }
    }

    pub async fn start(
        &mut self,
        ready_tx: Option<oneshot::Sender<()>>,
    ) -> Result<(), Box<dyn std::error::Error + Send>> {
        info!(
            "Starting stratum endpoint {} at {}",
            self.config.name, self.config.listen
        );
        let listener = match TcpListener::bind(&self.config.listen).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind to {}: {}", self.config.listen, e);
                return Err(Box::new(e));
            }
        };
        if let Some(ready_tx) = ready_tx {
            ready_tx.send(()).ok();
        }

        let conn_limit = Arc::new(Semaphore::new(self.config.max_conn));
        loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    info!("Shutdown signal received for {}", self.config.name);
                    break;
                }
                connection = listener.accept() => {
                    let (stream, addr) = match connection {
                        Ok(connection) => connection,
                        Err(e) => {
                            info!("Connection failed: {}", e);
                            continue;
                        }
                    };
                    let permit = match conn_limit.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            info!("Connection limit reached, dropping {}", addr);
                            continue;
                        }
                    };
                    debug!("New connection from: {}", addr);
                    let handler = self.handler.clone();
                    let jobs_rx = self.jobs_tx.subscribe();
                    let session = MinerSession::new(addr.ip().to_string(), self.stratum_index);
                    let (reader, writer) = stream.into_split();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let _ = handle_connection(reader, writer, session, handler, jobs_rx).await;
                    });
                }
            }
        }
        Ok(())
    }
}

/// Serve a single miner connection until it closes, misbehaves or the
/// server shuts down.
async fn handle_connection<R, Wr, P, W, A>(
    reader: R,
    mut writer: Wr,
    mut session: MinerSession,
    handler: Arc<PoolHandler<P, W, A>>,
    mut jobs_rx: broadcast::Receiver<Arc<BlockTemplate>>,
) -> Result<(), crate::error::Error>
where
    R: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
    P: PowVerifier,
    W: ShareWriter,
    A: Policy,
{
    let mut framed = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        tokio::select! {
            job = jobs_rx.recv() => {
                match job {
                    Ok(_) => {}
                    // A lagged receiver just misses a job.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    // Channel closed: the server is shutting down.
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if !session.subscribed() {
                    continue;
                }
                if let Ok(work) = handler.handle_get_work(&session) {
                    let push = Response::ok(json!(0), json!(work));
                    write_response(&mut writer, &push).await?;
                }
            }
            line = framed.next() => {
                match line {
                    Some(Ok(line)) => {
                        if line.is_empty() {
                            continue;
                        }
                        let request: Request = serde_json::from_str(&line).map_err(|e| {
                            crate::error::Error::InvalidRequest(e.to_string())
                        })?;
                        let response = dispatch(&handler, &mut session, request).await;
                        write_response(&mut writer, &response).await?;
                    }
                    Some(Err(e)) => {
                        debug!("Error reading line from {}: {}", session.ip, e);
                        return Err(crate::error::Error::InvalidRequest(e.to_string()));
                    }
                    None => {
                        debug!("Connection closed by client: {}", session.ip);
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn write_response<Wr: AsyncWrite + Unpin>(
    writer: &mut Wr,
    response: &Response,
) -> Result<(), crate::error::Error> {
    let encoded = serde_json::to_string(response)
        .map_err(|e| crate::error::Error::InvalidRequest(e.to_string()))?;
    writer.write_all(format!("{}\n", encoded).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Route one request to its handler and wrap the outcome in a response.
async fn dispatch<P, W, A>(
    handler: &PoolHandler<P, W, A>,
    session: &mut MinerSession,
    request: Request,
) -> Response
where
    P: PowVerifier,
    W: ShareWriter,
    A: Policy,
{
    let id = request.id.clone();
    match request.method.as_str() {
        "eth_submitLogin" => {
            let params = match request.string_params() {
                Some(params) => params,
                None => return Response::err(id, ErrorReply::new(-1, "Invalid params")),
            };
            match handler.handle_login(session, &params).await {
                Ok(accepted) => Response::ok(id, json!(accepted)),
                Err(reply) => Response::err(id, reply),
            }
        }
        "eth_getWork" => match handler.handle_get_work(session) {
            Ok(work) => Response::ok(id, json!(work)),
            Err(reply) => Response::err(id, reply),
        },
        "eth_submitWork" => {
            let params = match request.string_params() {
                Some(params) => params,
                None => return Response::err(id, ErrorReply::new(-1, "Invalid params")),
            };
            match handler.handle_submit(session, &request.worker, &params).await {
                Ok(accepted) => Response::ok(id, json!(accepted)),
                Err(reply) => Response::err(id, reply),
            }
        }
        // Hashrate is derived from recorded shares; acknowledge and move on.
        "eth_submitHashrate" => Response::ok(id, json!(true)),
        "eth_getBlockByNumber" => {
            let pending = handler
                .handle_get_pending_block()
                .and_then(|reply| serde_json::to_value(reply.as_ref()).ok())
                .unwrap_or(serde_json::Value::Null);
            Response::ok(id, pending)
        }
        method => Response::err(id, handler.handle_unknown(session, method)),
    }
}

#[cfg(test)]
mod stratum_server_tests {
    use super::*;
    use crate::handlers::AllowAllPolicy;
    use crate::pow::EthashSeal;
    use crate::processor::ShareProcessor;
    use mvsdrpc::test_utils::{mock_method, setup_mock_rpc};
    use mvsdrpc::MvsdRpcClient;
    use num_bigint::BigUint;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const LOGIN: &str = "MVaJ6MDd8fg45bbXzqQSojgjcBPJ2dBvox";

    struct NullWriter;

    impl ShareWriter for NullWriter {
        fn write_share(
            &self,
            _login: &str,
            _worker_id: &str,
            _params: &[String],
            _share_diff: u64,
            _height: u64,
            _hashrate_window: Duration,
        ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
            Ok(false)
        }

        fn write_block(
            &self,
            _login: &str,
            _worker_id: &str,
            _params: &[String],
            _share_diff: u64,
            _block_diff: u64,
            _height: u64,
            _hashrate_window: Duration,
        ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
            Ok(false)
        }
    }

    fn test_handler(
        client: MvsdRpcClient,
    ) -> Arc<PoolHandler<EthashSeal, NullWriter, AllowAllPolicy>> {
        let upstream = Arc::new(client);
        let (refresh_tx, _refresh_rx) = mpsc::channel(1);
        let cache = Arc::new(crate::template::TemplateCache::new());
        cache.store(
            BlockTemplate {
                header_hash: format!("0x{}", "aa".repeat(32)),
                seed_hash: format!("0x{}", "bb".repeat(32)),
                target: "0x1".to_string(),
                height: 77,
                difficulty: BigUint::from(u64::MAX),
            },
            mvsdrpc::GetBlockReply::default(),
        );
        let processor = ShareProcessor::new(
            upstream.clone(),
            Arc::new(NullWriter),
            EthashSeal,
            vec![StratumPortConfig {
                name: "stratum-test".to_string(),
                enabled: true,
                listen: "127.0.0.1:0".to_string(),
                difficulty: 1000,
                max_conn: 4,
            }],
            Duration::from_secs(600),
            refresh_tx,
        );
        Arc::new(PoolHandler::new(processor, cache, upstream, AllowAllPolicy))
    }

    fn session() -> MinerSession {
        MinerSession::new("127.0.0.1".to_string(), 0)
    }

    #[tokio::test]
    async fn test_connection_login_then_getwork() {
        let (server, client) = setup_mock_rpc().await;
        mock_method(
            &server,
            "validateaddress",
            serde_json::json!([LOGIN]),
            serde_json::json!({"is_valid": true, "testnet": false}),
        )
        .await;
        let handler = test_handler(client);

        let input = format!(
            "{}\n{}\n",
            serde_json::json!({"id": 1, "method": "eth_submitLogin", "params": [LOGIN]}),
            serde_json::json!({"id": 2, "method": "eth_getWork", "params": []}),
        );
        let mut output = Vec::new();
        let (jobs_tx, _) = broadcast::channel(1);

        handle_connection(
            input.as_bytes(),
            &mut output,
            session(),
            handler,
            jobs_tx.subscribe(),
        )
        .await
        .unwrap();

        let written = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);

        let login: Response = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(login.result, Some(serde_json::json!(true)));

        let work: Response = serde_json::from_str(lines[1]).unwrap();
        let work = work.result.unwrap();
        assert_eq!(work[0], format!("0x{}", "aa".repeat(32)));
    }

    #[tokio::test]
    async fn test_submit_before_login_gets_code_25() {
        let (_server, client) = setup_mock_rpc().await;
        let handler = test_handler(client);

        let input = format!(
            "{}\n",
            serde_json::json!({
                "id": 1,
                "method": "eth_submitWork",
                "params": ["0x0011223344556677", format!("0x{}", "aa".repeat(32)), format!("0x{}", "cc".repeat(32))],
            }),
        );
        let mut output = Vec::new();
        let (jobs_tx, _) = broadcast::channel(1);

        handle_connection(
            input.as_bytes(),
            &mut output,
            session(),
            handler,
            jobs_tx.subscribe(),
        )
        .await
        .unwrap();

        let response: Response = serde_json::from_str(String::from_utf8(output).unwrap().trim())
            .unwrap();
        assert_eq!(response.error.unwrap().code, 25);
    }

    #[tokio::test]
    async fn test_invalid_json_closes_connection() {
        let (_server, client) = setup_mock_rpc().await;
        let handler = test_handler(client);

        let mut output = Vec::new();
        let (jobs_tx, _) = broadcast::channel(1);

        let result = handle_connection(
            &b"not valid json\n"[..],
            &mut output,
            session(),
            handler,
            jobs_tx.subscribe(),
        )
        .await;

        assert!(result.is_err());
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_gets_code_minus_3() {
        let (_server, client) = setup_mock_rpc().await;
        let handler = test_handler(client);

        let input = format!(
            "{}\n",
            serde_json::json!({"id": 9, "method": "eth_mystery", "params": []}),
        );
        let mut output = Vec::new();
        let (jobs_tx, _) = broadcast::channel(1);

        handle_connection(
            input.as_bytes(),
            &mut output,
            session(),
            handler,
            jobs_tx.subscribe(),
        )
        .await
        .unwrap();

        let response: Response = serde_json::from_str(String::from_utf8(output).unwrap().trim())
            .unwrap();
        assert_eq!(response.error.unwrap().code, -3);
    }

    #[tokio::test]
    async fn test_server_binds_and_shuts_down() {
        let (_server, client) = setup_mock_rpc().await;
        let handler = test_handler(client);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (jobs_tx, _) = broadcast::channel(1);

        let mut server = StratumServer::new(
            StratumPortConfig {
                name: "stratum-test".to_string(),
                enabled: true,
                listen: "127.0.0.1:0".to_string(),
                difficulty: 1000,
                max_conn: 4,
            },
            0,
            handler,
            shutdown_rx,
            jobs_tx,
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(async move { server.start(Some(ready_tx)).await });

        ready_rx.await.expect("server should signal readiness");
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
