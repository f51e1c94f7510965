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

use crate::template::{BlockTemplate, TemplateCache};
use mvsdrpc::{MvsdRpcClient, MvsdRpcError};
use num_bigint::BigUint;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

/// Fetch the pending block and current work and, if the work moved on,
/// publish a fresh template. Returns the new template, or None when the
/// upstream still serves the cached header.
pub async fn refresh_template(
    upstream: &MvsdRpcClient,
    cache: &TemplateCache,
) -> Result<Option<Arc<BlockTemplate>>, MvsdRpcError> {
    let pending = upstream.get_pending_block().await?;
    let difficulty = BigUint::parse_bytes(pending.difficulty.as_bytes(), 10).ok_or_else(|| {
        MvsdRpcError::Parse {
            message: format!("Can't parse pending block difficulty {:?}", pending.difficulty),
        }
    })?;

    let work = upstream.get_work().await?;
    if work.len() < 3 {
        return Err(MvsdRpcError::Parse {
            message: format!("getwork returned {} elements, expected 3", work.len()),
        });
    }

    if let Some(current) = cache.current() {
        if current.header_hash == work[0] {
            return Ok(None);
        }
    }

    let template = BlockTemplate {
        header_hash: work[0].clone(),
        seed_hash: work[1].clone(),
        target: work[2].clone(),
        height: pending.number,
        difficulty,
    };
    info!(
        "New block to mine on {} at height {} / {}",
        upstream.name, template.height, template.header_hash
    );
    cache.store(template, pending);
    Ok(cache.current())
}

/// Poll the upstream for new work on a fixed interval, and immediately when
/// the share processor reports a submitted block. New templates go out on
/// the broadcast channel; the transport layer decides fan-out.
pub async fn run_refresher(
    upstream: Arc<MvsdRpcClient>,
    cache: Arc<TemplateCache>,
    poll_interval: Duration,
    mut refresh_rx: mpsc::Receiver<()>,
    jobs_tx: broadcast::Sender<Arc<BlockTemplate>>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            trigger = refresh_rx.recv() => {
                if trigger.is_none() {
                    // All submitters dropped; nothing left to refresh for.
                    return;
                }
            }
        }
        match refresh_template(&upstream, &cache).await {
            Ok(Some(template)) => {
                let _ = jobs_tx.send(template);
            }
            Ok(None) => {}
            Err(e) => error!("Error while refreshing block template: {e}"),
        }
    }
}
