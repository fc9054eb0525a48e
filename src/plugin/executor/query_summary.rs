/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `query_summary` executor stage.
//!
//! Defers a single info line per query, logged once the rest of the
//! pipeline (including any fallback/parallel winners) has settled.

use crate::config::types::PluginConfig;
use crate::core::context::{DeferredExec, QueryContext};
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::Executable;
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct QuerySummary {
    tag: String,
}

struct SummaryAction;

#[async_trait]
impl DeferredExec for SummaryAction {
    async fn exec_deferred(
        &self,
        _ctx: &CancellationToken,
        qctx: &mut QueryContext,
    ) -> Result<()> {
        let answers = qctx.r().map(|r| r.answers().len()).unwrap_or(0);
        info!(
            "query finished: {} status={} answers={}",
            qctx.info(),
            qctx.status(),
            answers
        );
        Ok(())
    }
}

#[async_trait]
impl Plugin for QuerySummary {
    fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl Executable for QuerySummary {
    async fn exec(&self, _ctx: &CancellationToken, qctx: &mut QueryContext) -> Result<()> {
        qctx.defer_exec(Arc::new(SummaryAction));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct QuerySummaryFactory;

impl PluginFactory for QuerySummaryFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        if plugin_config.args.is_some() {
            return Err(DnsError::plugin("query_summary does not accept args"));
        }
        Ok(())
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        Ok(UninitializedPlugin::Executable(Box::new(QuerySummary {
            tag: plugin_config.tag.clone(),
        })))
    }
}
