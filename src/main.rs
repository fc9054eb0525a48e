/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

mod config;
mod core;
mod plugin;

use crate::plugin::PluginRegistry;
use std::sync::Arc;
use tokio::runtime;
use tracing::info;

fn main() -> Result<(), String> {
    let runtime = core::init();
    let options = runtime.options;

    let config = config::init(&options.config)
        .map_err(|e| format!("failed to load {}: {}", options.config.display(), e))?;

    let mut log_config = config.log.clone();
    if let Some(level) = options.log_level {
        log_config.level = level;
    }
    let _log_guard = core::init_log(log_config);

    let mut tokio_runtime = runtime::Builder::new_multi_thread();
    tokio_runtime.enable_all().thread_name("steerdns-worker");
    let tokio_runtime = tokio_runtime
        .build()
        .map_err(|err| format!("failed to initialize Tokio runtime: {err}"))?;
    tokio_runtime.block_on(async_run(config))
}

async fn async_run(config: config::types::Config) -> Result<(), String> {
    info!("SteerDNS {} starting...", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(PluginRegistry::with_builtins());
    registry
        .clone()
        .init_plugins(config.plugins)
        .await
        .map_err(|e| e.to_string())?;

    info!("all plugins initialized, serving");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to wait for shutdown signal: {e}"))?;
    info!("shutdown signal received, exiting");
    Ok(())
}
