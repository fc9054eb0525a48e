/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Server-side query handling: admission control, entry sequence execution
//! and reply synthesis.
//!
//! Per query the client observes exactly one of: a valid response, SERVFAIL,
//! REFUSED, or nothing at all (silent drop).

use crate::core::context::{ContextStatus, QueryContext};
use crate::core::dns_utils::build_response_from_request;
use crate::core::error::Result;
use crate::core::limiter::{ClientQueryLimiter, ConcurrentLimiter};
use crate::plugin::executor::sequence::{walker, ExecutableCmdSequence};
use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Writes one reply back to the client. At most one call per query.
#[async_trait]
pub trait ResponseWriter: Send {
    async fn write(&mut self, msg: &Message) -> Result<usize>;
}

#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// Process one query and write the reply (if any) to `w`. `ctx` carries
    /// the query deadline.
    async fn serve_dns(
        &self,
        ctx: &CancellationToken,
        qctx: &mut QueryContext,
        w: &mut dyn ResponseWriter,
    );
}

pub struct ServerHandlerConfig {
    /// Entry command sequence driven for every admitted query.
    pub entry: ExecutableCmdSequence,
    /// Max concurrent queries overall. 0 disables the global gate.
    pub concurrent_limit: usize,
    /// Max concurrent queries per client address. 0 disables the gate.
    pub per_client_limit: usize,
}

pub struct DefaultServerHandler {
    entry: ExecutableCmdSequence,
    limiter: Option<ConcurrentLimiter>,
    client_limiter: Option<ClientQueryLimiter>,
}

impl DefaultServerHandler {
    pub fn new(config: ServerHandlerConfig) -> Self {
        Self {
            entry: config.entry,
            limiter: (config.concurrent_limit > 0)
                .then(|| ConcurrentLimiter::new(config.concurrent_limit)),
            client_limiter: (config.per_client_limit > 0)
                .then(|| ClientQueryLimiter::new(config.per_client_limit)),
        }
    }

    async fn handle_admitted(
        &self,
        ctx: &CancellationToken,
        qctx: &mut QueryContext,
        w: &mut dyn ResponseWriter,
    ) {
        // Queries wait on the global FIFO gate; a deadline hit while waiting
        // drops the query without a reply.
        let _permit = match &self.limiter {
            Some(limiter) => {
                tokio::select! {
                    permit = limiter.acquire() => Some(permit),
                    _ = ctx.cancelled() => {
                        debug!("query dropped while waiting for global token ({})", qctx.info());
                        return;
                    }
                }
            }
            None => None,
        };

        let walk_result = walker::walk(ctx, qctx, &self.entry).await;
        // deferred actions run exactly once, also when the walk errored
        qctx.exec_defer(ctx).await;

        match &walk_result {
            Err(e) => warn!("entry returned an error: {} ({})", e, qctx.info()),
            Ok(()) => debug!("entry returned, status {} ({})", qctx.status(), qctx.info()),
        }

        let reply = if walk_result.is_err() || qctx.status() == ContextStatus::ServerFailed {
            Some(build_response_from_request(qctx.q(), ResponseCode::ServFail))
        } else {
            qctx.r().cloned()
        };

        if let Some(reply) = reply {
            write_reply(&reply, qctx, w).await;
        }
    }
}

#[async_trait]
impl ServerHandler for DefaultServerHandler {
    async fn serve_dns(
        &self,
        ctx: &CancellationToken,
        qctx: &mut QueryContext,
        w: &mut dyn ResponseWriter,
    ) {
        if let (Some(client_limiter), Some(from)) = (&self.client_limiter, qctx.from()) {
            let key = from.to_string();
            if !client_limiter.acquire(&key) {
                let refused = build_response_from_request(qctx.q(), ResponseCode::Refused);
                write_reply(&refused, qctx, w).await;
                return;
            }
            self.handle_admitted(ctx, qctx, w).await;
            client_limiter.done(&key);
            return;
        }

        self.handle_admitted(ctx, qctx, w).await;
    }
}

async fn write_reply(reply: &Message, qctx: &QueryContext, w: &mut dyn ResponseWriter) {
    if let Err(e) = w.write(reply).await {
        warn!("write response failed: {} ({})", e, qctx.info());
    }
}
