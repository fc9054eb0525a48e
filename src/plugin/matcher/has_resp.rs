/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `has_resp` matcher plugin.
//!
//! Returns true when the context already carries a response.

use crate::config::types::PluginConfig;
use crate::core::context::QueryContext;
use crate::core::error::{DnsError, Result};
use crate::plugin::matcher::Matcher;
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct HasRespFactory;

impl PluginFactory for HasRespFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        if plugin_config.args.is_some() {
            return Err(DnsError::plugin("has_resp does not accept args"));
        }
        Ok(())
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        Ok(UninitializedPlugin::Matcher(Box::new(HasRespMatcher {
            tag: plugin_config.tag.clone(),
        })))
    }
}

#[derive(Debug)]
struct HasRespMatcher {
    tag: String,
}

#[async_trait]
impl Plugin for HasRespMatcher {
    fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl Matcher for HasRespMatcher {
    async fn is_match(&self, qctx: &QueryContext) -> bool {
        qctx.r().is_some()
    }
}
