/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Plugin system: base trait, capability kinds and factories.
//!
//! Every pipeline stage, matcher and server is a plugin registered by type
//! tag. A factory decodes the plugin's `args` tree and produces an
//! uninitialized instance; the registry initializes plugins in dependency
//! order and stores them wrapped in their capability kind.

use crate::config::types::PluginConfig;
use crate::core::error::Result;
use crate::plugin::executor::{EsExecutable, Executable, PipelinedExecutable};
use crate::plugin::matcher::Matcher;
use async_trait::async_trait;
use serde_yml::Value;
use std::fmt::Debug;
use std::sync::Arc;

pub mod dependency;
pub mod executor;
pub mod matcher;
pub mod registry;
pub mod server;

pub use registry::PluginRegistry;

/// Common plugin lifecycle.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn tag(&self) -> &str;

    async fn init(&mut self) {}

    async fn destroy(&self) {}
}

/// A plugin created by a factory but not yet initialized.
///
/// The variant fixes the capability the plugin exposes to sequences; a
/// pipelined stage also carries the early-stop capability through its
/// supertrait.
pub enum UninitializedPlugin {
    Executable(Box<dyn Executable>),
    EsExecutable(Box<dyn EsExecutable>),
    Pipelined(Box<dyn PipelinedExecutable>),
    Matcher(Box<dyn Matcher>),
    Server(Box<dyn Plugin>),
}

impl UninitializedPlugin {
    /// Run the plugin's `init` hook and wrap it for shared use.
    pub async fn init_and_wrap(self) -> PluginKind {
        match self {
            UninitializedPlugin::Executable(mut p) => {
                p.init().await;
                PluginKind::Executable(Arc::from(p))
            }
            UninitializedPlugin::EsExecutable(mut p) => {
                p.init().await;
                PluginKind::EsExecutable(Arc::from(p))
            }
            UninitializedPlugin::Pipelined(mut p) => {
                p.init().await;
                PluginKind::Pipelined(Arc::from(p))
            }
            UninitializedPlugin::Matcher(mut p) => {
                p.init().await;
                PluginKind::Matcher(Arc::from(p))
            }
            UninitializedPlugin::Server(mut p) => {
                p.init().await;
                PluginKind::Server(Arc::from(p))
            }
        }
    }
}

/// Initialized plugin wrapped by capability.
#[derive(Clone)]
pub enum PluginKind {
    Executable(Arc<dyn Executable>),
    EsExecutable(Arc<dyn EsExecutable>),
    Pipelined(Arc<dyn PipelinedExecutable>),
    Matcher(Arc<dyn Matcher>),
    Server(Arc<dyn Plugin>),
}

impl Debug for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind_name())
    }
}

impl PluginKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            PluginKind::Executable(_) => "executable",
            PluginKind::EsExecutable(_) => "es_executable",
            PluginKind::Pipelined(_) => "pipelined",
            PluginKind::Matcher(_) => "matcher",
            PluginKind::Server(_) => "server",
        }
    }
}

/// Registered plugin instance.
#[derive(Debug)]
pub struct PluginInfo {
    /// Plugin tag (unique instance identifier)
    pub tag: String,
    /// Initialized plugin wrapped by capability
    pub kind: PluginKind,
    /// Raw configuration arguments
    pub args: Option<Value>,
}

impl PluginInfo {
    pub fn to_matcher(&self) -> Option<Arc<dyn Matcher>> {
        match &self.kind {
            PluginKind::Matcher(m) => Some(m.clone()),
            _ => None,
        }
    }
}

/// Plugin construction factory, one per plugin type tag.
pub trait PluginFactory: Debug + Send + Sync + 'static {
    /// Validate the plugin configuration without building the plugin.
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()>;

    /// Tags of plugins this plugin must be initialized after.
    fn get_dependencies(&self, _plugin_config: &PluginConfig) -> Vec<String> {
        Vec::new()
    }

    /// Build an uninitialized plugin instance. Tag references in the
    /// configuration are resolved against `registry` here, at load time.
    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin>;
}
