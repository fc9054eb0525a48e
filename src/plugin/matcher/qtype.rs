/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `qtype` matcher plugin.
//!
//! Matches DNS question types in request queries.

use crate::config::types::PluginConfig;
use crate::core::context::QueryContext;
use crate::core::error::{DnsError, Result};
use crate::plugin::matcher::Matcher;
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use ahash::AHashSet;
use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct QtypeFactory;

impl PluginFactory for QtypeFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let _ = parse_qtypes(plugin_config)?;
        Ok(())
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let qtypes = parse_qtypes(plugin_config)?;
        Ok(UninitializedPlugin::Matcher(Box::new(QtypeMatcher {
            tag: plugin_config.tag.clone(),
            qtypes,
        })))
    }
}

fn parse_qtypes(plugin_config: &PluginConfig) -> Result<AHashSet<u16>> {
    let rules: Vec<String> = serde_yml::from_value(
        plugin_config
            .args
            .clone()
            .ok_or_else(|| DnsError::plugin("qtype requires a list of record types"))?,
    )
    .map_err(|e| DnsError::plugin(format!("failed to parse qtype config: {}", e)))?;

    if rules.is_empty() {
        return Err(DnsError::plugin("qtype requires at least one record type"));
    }

    let mut qtypes = AHashSet::with_capacity(rules.len());
    for raw in &rules {
        let raw = raw.trim();
        if let Ok(code) = raw.parse::<u16>() {
            qtypes.insert(code);
            continue;
        }
        let rtype = RecordType::from_str(&raw.to_ascii_uppercase())
            .map_err(|_| DnsError::plugin(format!("invalid qtype rule '{}'", raw)))?;
        qtypes.insert(u16::from(rtype));
    }
    Ok(qtypes)
}

#[derive(Debug)]
struct QtypeMatcher {
    tag: String,
    qtypes: AHashSet<u16>,
}

#[async_trait]
impl Plugin for QtypeMatcher {
    fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl Matcher for QtypeMatcher {
    async fn is_match(&self, qctx: &QueryContext) -> bool {
        qctx.q()
            .queries()
            .iter()
            .any(|q| self.qtypes.contains(&u16::from(q.query_type())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::Name;

    fn make_context(qtype: RecordType) -> QueryContext {
        let mut request = Message::new();
        request.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            qtype,
        ));
        QueryContext::new(request, None)
    }

    #[tokio::test]
    async fn matches_configured_types_only() {
        let matcher = QtypeMatcher {
            tag: "qtype".into(),
            qtypes: [u16::from(RecordType::AAAA)].into_iter().collect(),
        };
        assert!(!matcher.is_match(&make_context(RecordType::A)).await);
        assert!(matcher.is_match(&make_context(RecordType::AAAA)).await);
    }

    #[test]
    fn parses_names_and_numbers() {
        let cfg = PluginConfig {
            tag: "t".into(),
            plugin_type: "qtype".into(),
            args: Some(serde_yml::from_str("[\"A\", \"aaaa\", \"65\"]").unwrap()),
        };
        let qtypes = parse_qtypes(&cfg).unwrap();
        assert!(qtypes.contains(&u16::from(RecordType::A)));
        assert!(qtypes.contains(&u16::from(RecordType::AAAA)));
        assert!(qtypes.contains(&65));
    }

    #[test]
    fn rejects_garbage_rules() {
        let cfg = PluginConfig {
            tag: "t".into(),
            plugin_type: "qtype".into(),
            args: Some(serde_yml::from_str("[\"no-such-type\"]").unwrap()),
        };
        assert!(parse_qtypes(&cfg).is_err());
    }
}
