/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! UDP DNS server plugin
//!
//! Listens for DNS queries over UDP and runs each one through the server
//! handler (admission control, entry sequence, reply synthesis). Handler
//! tasks are spawned per datagram and reaped without blocking the accept
//! loop.

use crate::config::types::PluginConfig;
use crate::core::context::QueryContext;
use crate::core::error::{DnsError, Result};
use crate::core::handler::{
    DefaultServerHandler, ResponseWriter, ServerHandler, ServerHandlerConfig,
};
use crate::plugin::executor::sequence::{build_cmd_sequence, CmdConfig};
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use futures::StreamExt;
use hickory_proto::op::Message;
use hickory_proto::runtime::TokioRuntimeProvider;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use hickory_proto::udp::UdpStream;
use hickory_proto::xfer::SerialMessage;
use hickory_proto::{BufDnsStreamHandle, DnsStreamHandle};
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5000;

/// UDP server configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UdpServerConfig {
    /// UDP listen address (e.g., "0.0.0.0:53")
    pub listen: String,

    /// Entry plugin tag processing incoming queries
    pub entry: String,

    /// Per-query deadline in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Max concurrent queries overall (0 = unlimited)
    #[serde(default)]
    pub concurrent_limit: usize,

    /// Max concurrent queries per client address (0 = unlimited)
    #[serde(default)]
    pub per_client_limit: usize,
}

pub struct UdpServer {
    tag: String,
    listen: String,
    timeout: Duration,
    handler: Arc<DefaultServerHandler>,
}

#[async_trait]
impl Plugin for UdpServer {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn init(&mut self) {
        let listen = self.listen.clone();
        let handler = self.handler.clone();
        let timeout = self.timeout;

        info!("starting UDP server on {}", listen);
        tokio::spawn(run_server(listen, handler, timeout));
    }
}

/// Main UDP server loop
///
/// Creates a UDP stream, listens for incoming DNS queries, and spawns
/// handler tasks for each request. Performs periodic cleanup of finished
/// tasks.
async fn run_server(addr: String, handler: Arc<DefaultServerHandler>, timeout: Duration) {
    let socket = match build_udp_socket(&addr) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to bind UDP socket to {}: {}", addr, e);
            return;
        }
    };

    let (mut stream, stream_handle) =
        UdpStream::<TokioRuntimeProvider>::with_bound(socket, ([127, 255, 255, 254], 0).into());

    let mut inner_join_set = JoinSet::new();
    debug!("UDP server event loop started on {}", addr);

    loop {
        let message = match stream.next().await {
            None => break,
            Some(message) => message,
        };

        let message = match message {
            Err(error) => {
                warn!(%error, "error receiving message on UDP socket");
                continue;
            }
            Ok(message) => message,
        };

        inner_join_set.spawn(handle_message(
            handler.clone(),
            stream_handle.with_remote_addr(message.addr()),
            message,
            timeout,
        ));

        reap_tasks(&mut inner_join_set);
    }
}

/// Handle a single DNS query message
///
/// Decodes the message, builds a query context with a deadline, and hands
/// both to the server handler.
async fn handle_message(
    handler: Arc<DefaultServerHandler>,
    stream_handle: BufDnsStreamHandle,
    message: SerialMessage,
    timeout: Duration,
) {
    let (bytes, src_addr) = message.into_parts();

    let request = match Message::from_bytes(&bytes) {
        Ok(request) => request,
        Err(e) => {
            debug!("dropping undecodable message from {}: {}", src_addr, e);
            return;
        }
    };

    let mut qctx = QueryContext::new(request, Some(src_addr));
    let mut writer = UdpResponseWriter {
        handle: stream_handle,
        dst: src_addr,
    };

    // query deadline: the context is cancelled when the timer fires
    let ctx = CancellationToken::new();
    let deadline = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            ctx.cancel();
        })
    };

    handler.serve_dns(&ctx, &mut qctx, &mut writer).await;
    deadline.abort();
}

struct UdpResponseWriter {
    handle: BufDnsStreamHandle,
    dst: SocketAddr,
}

#[async_trait]
impl ResponseWriter for UdpResponseWriter {
    async fn write(&mut self, msg: &Message) -> Result<usize> {
        let bytes = msg.to_bytes()?;
        let len = bytes.len();
        self.handle
            .send(SerialMessage::new(bytes, self.dst))
            .map_err(DnsError::Protocol)?;
        Ok(len)
    }
}

/// Reap completed tasks from the join set without blocking.
fn reap_tasks(join_set: &mut JoinSet<()>) {
    while join_set.try_join_next().is_some() {}
}

/// Build a UDP socket with reuse_address and reuse_port options
fn build_udp_socket(addr: &str) -> std::io::Result<UdpSocket> {
    let addr = SocketAddr::from_str(addr)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let sock = if addr.is_ipv4() {
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?
    } else {
        Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?
    };

    let _ = sock.set_nonblocking(true);
    let _ = sock.set_reuse_address(true);
    #[cfg(not(target_os = "windows"))]
    let _ = sock.set_reuse_port(true);

    sock.bind(&addr.into())?;

    UdpSocket::from_std(sock.into())
}

/// Factory for creating UDP server plugin instances
#[derive(Debug, Clone)]
pub struct UdpServerFactory;

impl PluginFactory for UdpServerFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let cfg = parse_config(plugin_config)?;
        if SocketAddr::from_str(&cfg.listen).is_err() {
            return Err(DnsError::config(format!(
                "invalid listen address: {}",
                cfg.listen
            )));
        }
        if cfg.entry.trim().is_empty() {
            return Err(DnsError::config("udp_server 'entry' cannot be empty"));
        }
        Ok(())
    }

    fn get_dependencies(&self, plugin_config: &PluginConfig) -> Vec<String> {
        parse_config(plugin_config)
            .map(|cfg| vec![cfg.entry])
            .unwrap_or_default()
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let cfg = parse_config(plugin_config)?;
        self.validate_config(plugin_config)?;

        // the entry tag becomes a one-command sequence
        let entry = build_cmd_sequence(&[CmdConfig::Ref(cfg.entry.clone())], &registry).map_err(
            |e| {
                DnsError::config(format!(
                    "udp_server '{}' entry '{}': {}",
                    plugin_config.tag, cfg.entry, e
                ))
            },
        )?;

        let handler = Arc::new(DefaultServerHandler::new(ServerHandlerConfig {
            entry,
            concurrent_limit: cfg.concurrent_limit,
            per_client_limit: cfg.per_client_limit,
        }));

        Ok(UninitializedPlugin::Server(Box::new(UdpServer {
            tag: plugin_config.tag.clone(),
            listen: cfg.listen,
            timeout: Duration::from_millis(
                cfg.timeout_ms.unwrap_or(DEFAULT_QUERY_TIMEOUT_MS).max(1),
            ),
            handler,
        })))
    }
}

fn parse_config(plugin_config: &PluginConfig) -> Result<UdpServerConfig> {
    serde_yml::from_value(
        plugin_config
            .args
            .clone()
            .ok_or_else(|| DnsError::config("udp_server requires 'listen' and 'entry'"))?,
    )
    .map_err(|e| DnsError::config(format!("failed to parse udp_server config: {}", e)))
}
