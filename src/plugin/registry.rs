/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Plugin registry for managing plugin factories and instances
//!
//! Provides a centralized registry for managing plugin lifecycle,
//! enabling better testability and support for multiple server instances.

use crate::config::types::PluginConfig;
use crate::core::error::{DnsError, Result};
use crate::plugin::{dependency, PluginFactory, PluginInfo};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Plugin registry that manages plugin factories and instances
#[derive(Debug)]
pub struct PluginRegistry {
    /// Map of plugin type names to their factory implementations
    factories: HashMap<String, Box<dyn PluginFactory>>,

    /// Map of plugin tags to their runtime instances
    ///
    /// Uses DashMap for interior mutability, allowing plugins to be registered
    /// even when the registry is behind an Arc.
    plugins: DashMap<String, Arc<PluginInfo>>,
}

impl PluginRegistry {
    /// Create a new empty plugin registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            plugins: DashMap::new(),
        }
    }

    /// Create a registry with all built-in plugin factories registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_factory("sequence", Box::new(super::executor::sequence::SequenceFactory));
        registry.register_factory("hosts", Box::new(super::executor::hosts::HostsFactory));
        registry.register_factory("fallback", Box::new(super::executor::fallback::FallbackFactory));
        registry.register_factory(
            "query_summary",
            Box::new(super::executor::query_summary::QuerySummaryFactory),
        );
        registry.register_factory("qtype", Box::new(super::matcher::qtype::QtypeFactory));
        registry.register_factory("qname", Box::new(super::matcher::qname::QnameFactory));
        registry.register_factory("has_resp", Box::new(super::matcher::has_resp::HasRespFactory));
        registry.register_factory("udp_server", Box::new(super::server::udp::UdpServerFactory));
        registry
    }

    /// Register a plugin factory under its type name.
    pub fn register_factory(&mut self, plugin_type: &str, factory: Box<dyn PluginFactory>) {
        self.factories.insert(plugin_type.to_string(), factory);
    }

    /// Initialize all plugins from configuration
    ///
    /// Validates every configuration, resolves declared dependencies and
    /// initializes plugins in topological order so that tag references
    /// always resolve at load time.
    pub async fn init_plugins(self: Arc<Self>, configs: Vec<PluginConfig>) -> Result<()> {
        for config in &configs {
            let factory = self.factory_for(&config.plugin_type)?;
            factory.validate_config(config).map_err(|e| {
                DnsError::config(format!("plugin '{}' ({}): {}", config.tag, config.plugin_type, e))
            })?;
        }

        let get_deps = |config: &PluginConfig| {
            self.factories
                .get(&config.plugin_type)
                .map(|f| f.get_dependencies(config))
                .unwrap_or_default()
        };
        let sorted_plugins = dependency::resolve_dependencies(configs, &get_deps)?;

        info!("initializing {} plugins in dependency order", sorted_plugins.len());
        for plugin_config in &sorted_plugins {
            let factory = self.factory_for(&plugin_config.plugin_type)?;
            let uninitialized = factory.create(plugin_config, self.clone())?;
            let kind = uninitialized.init_and_wrap().await;
            info!(
                "plugin '{}' initialized (type: {}, kind: {})",
                plugin_config.tag,
                plugin_config.plugin_type,
                kind.kind_name()
            );

            self.plugins.insert(
                plugin_config.tag.clone(),
                Arc::new(PluginInfo {
                    tag: plugin_config.tag.clone(),
                    kind,
                    args: plugin_config.args.clone(),
                }),
            );
        }

        Ok(())
    }

    fn factory_for(&self, plugin_type: &str) -> Result<&Box<dyn PluginFactory>> {
        self.factories
            .get(plugin_type)
            .ok_or_else(|| DnsError::config(format!("unknown plugin type: {}", plugin_type)))
    }

    /// Get a plugin instance by tag
    pub fn get_plugin(&self, tag: &str) -> Option<Arc<PluginInfo>> {
        self.plugins.get(tag).map(|entry| entry.clone())
    }

    /// Insert an already-built plugin instance. Used by tests.
    #[allow(unused)]
    pub fn set_plugin(&self, info: Arc<PluginInfo>) {
        self.plugins.insert(info.tag.clone(), info);
    }

    /// Get the number of registered plugins
    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_starts_empty() {
        let registry = PluginRegistry::new();
        assert_eq!(registry.plugin_count(), 0);
        assert!(registry.get_plugin("nonexistent").is_none());
    }

    #[tokio::test]
    async fn unknown_plugin_type_is_a_config_error() {
        let registry = Arc::new(PluginRegistry::with_builtins());
        let configs = vec![PluginConfig {
            tag: "x".to_string(),
            plugin_type: "no_such_type".to_string(),
            args: None,
        }];
        let err = registry.init_plugins(configs).await.unwrap_err();
        assert!(err.to_string().contains("unknown plugin type"));
    }

    #[tokio::test]
    async fn configured_pipeline_answers_hosts_queries_end_to_end() {
        use crate::config::types::Config;
        use crate::core::context::{ContextStatus, QueryContext};
        use crate::core::handler::{
            DefaultServerHandler, ResponseWriter, ServerHandler, ServerHandlerConfig,
        };
        use crate::plugin::executor::sequence::{build_cmd_sequence, CmdConfig};
        use async_trait::async_trait;
        use hickory_proto::op::{Message, Query, ResponseCode};
        use hickory_proto::rr::{Name, RecordType};
        use tokio_util::sync::CancellationToken;

        let config: Config = serde_yml::from_str(
            r#"
plugins:
  - tag: local_hosts
    type: hosts
    args:
      entries:
        - "example.com 1.2.3.4 5.6.7.8"
  - tag: only_a
    type: qtype
    args: ["A"]
  - tag: main
    type: sequence
    args:
      - if: ["only_a"]
        exec:
          - local_hosts
"#,
        )
        .unwrap();
        config.validate().unwrap();

        let registry = Arc::new(PluginRegistry::with_builtins());
        registry.clone().init_plugins(config.plugins).await.unwrap();
        assert_eq!(registry.plugin_count(), 3);

        let entry =
            build_cmd_sequence(&[CmdConfig::Ref("main".to_string())], &registry).unwrap();
        let handler = DefaultServerHandler::new(ServerHandlerConfig {
            entry,
            concurrent_limit: 4,
            per_client_limit: 2,
        });

        struct CollectWriter(Vec<Message>);

        #[async_trait]
        impl ResponseWriter for CollectWriter {
            async fn write(&mut self, msg: &Message) -> crate::core::error::Result<usize> {
                self.0.push(msg.clone());
                Ok(0)
            }
        }

        let mut request = Message::new();
        request.set_id(1400);
        request.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
        let mut qctx = QueryContext::new(request, Some("127.0.0.1:7000".parse().unwrap()));
        let mut writer = CollectWriter(Vec::new());
        handler
            .serve_dns(&CancellationToken::new(), &mut qctx, &mut writer)
            .await;

        assert_eq!(qctx.status(), ContextStatus::Responded);
        assert_eq!(writer.0.len(), 1);
        let reply = &writer.0[0];
        assert_eq!(reply.id(), 1400);
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 2);
    }
}
