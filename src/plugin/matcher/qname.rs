/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `qname` matcher plugin.
//!
//! Matches the question name against a compiled pattern set. Patterns use
//! the same grammar as hosts rules: `full:` (exact, the default), `domain:`
//! (suffix on label boundary), `keyword:` (substring), `regexp:`.

use crate::config::types::PluginConfig;
use crate::core::context::QueryContext;
use crate::core::error::{DnsError, Result};
use crate::plugin::matcher::Matcher;
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use ahash::AHashSet;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use async_trait::async_trait;
use regex::{RegexSet, RegexSetBuilder};
use smallvec::SmallVec;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct DomainPatternSet {
    full: AHashSet<Box<str>>,
    domain: AHashSet<Box<str>>,
    keyword_patterns: Vec<String>,
    keyword: Option<AhoCorasick>,
    regexp_patterns: Vec<String>,
    regexp: Option<RegexSet>,
}

impl DomainPatternSet {
    /// Add one pattern expression, e.g. `domain:example.com`.
    pub(crate) fn add_pattern(&mut self, raw: &str) -> std::result::Result<(), String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty domain pattern".to_string());
        }

        if let Some(v) = raw.strip_prefix("domain:") {
            self.domain.insert(normalize_name(v).into_boxed_str());
        } else if let Some(v) = raw.strip_prefix("keyword:") {
            self.keyword_patterns.push(v.to_ascii_lowercase());
        } else if let Some(v) = raw.strip_prefix("regexp:") {
            regex::Regex::new(v).map_err(|e| format!("invalid regexp '{}': {}", v, e))?;
            self.regexp_patterns.push(v.to_string());
        } else {
            let v = raw.strip_prefix("full:").unwrap_or(raw);
            self.full.insert(normalize_name(v).into_boxed_str());
        }
        Ok(())
    }

    /// Compile the keyword and regexp pattern groups.
    pub(crate) fn finalize(&mut self) -> std::result::Result<(), String> {
        if !self.keyword_patterns.is_empty() {
            self.keyword = Some(
                AhoCorasickBuilder::new()
                    .ascii_case_insensitive(false)
                    .build(&self.keyword_patterns)
                    .map_err(|e| format!("failed to build keyword matcher: {}", e))?,
            );
        }
        if !self.regexp_patterns.is_empty() {
            self.regexp = Some(
                RegexSetBuilder::new(&self.regexp_patterns)
                    .build()
                    .map_err(|e| format!("failed to build regexp matcher: {}", e))?,
            );
        }
        Ok(())
    }

    /// Match a normalized (lowercase, no trailing dot) name.
    pub(crate) fn is_match(&self, name: &str) -> bool {
        if self.full.contains(name) {
            return true;
        }

        if !self.domain.is_empty() {
            let mut suffixes: SmallVec<[&str; 8]> = SmallVec::new();
            split_label_suffixes(name, &mut suffixes);
            if suffixes.iter().any(|suffix| self.domain.contains(*suffix)) {
                return true;
            }
        }

        if self.keyword.as_ref().is_some_and(|m| m.is_match(name)) {
            return true;
        }
        self.regexp.as_ref().is_some_and(|m| m.is_match(name))
    }
}

pub(crate) fn normalize_name(raw: &str) -> String {
    raw.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Collect every label-boundary suffix of a name, most specific first,
/// e.g. `a.b.example` => [`a.b.example`, `b.example`, `example`].
#[inline]
pub(crate) fn split_label_suffixes<'a>(domain: &'a str, suffixes: &mut SmallVec<[&'a str; 8]>) {
    suffixes.clear();
    let mut rest = domain;
    loop {
        suffixes.push(rest);
        match rest.find('.') {
            Some(dot) => rest = &rest[dot + 1..],
            None => break,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QnameFactory;

impl PluginFactory for QnameFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let _ = build_pattern_set(plugin_config)?;
        Ok(())
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let patterns = build_pattern_set(plugin_config)?;
        Ok(UninitializedPlugin::Matcher(Box::new(QnameMatcher {
            tag: plugin_config.tag.clone(),
            patterns,
        })))
    }
}

fn build_pattern_set(plugin_config: &PluginConfig) -> Result<DomainPatternSet> {
    let rules: Vec<String> = serde_yml::from_value(
        plugin_config
            .args
            .clone()
            .ok_or_else(|| DnsError::plugin("qname requires a list of domain patterns"))?,
    )
    .map_err(|e| DnsError::plugin(format!("failed to parse qname config: {}", e)))?;

    if rules.is_empty() {
        return Err(DnsError::plugin("qname requires at least one pattern"));
    }

    let mut patterns = DomainPatternSet::default();
    for rule in &rules {
        patterns
            .add_pattern(rule)
            .map_err(|e| DnsError::plugin(format!("invalid qname rule '{}': {}", rule, e)))?;
    }
    patterns
        .finalize()
        .map_err(DnsError::plugin)?;
    Ok(patterns)
}

#[derive(Debug)]
struct QnameMatcher {
    tag: String,
    patterns: DomainPatternSet,
}

#[async_trait]
impl Plugin for QnameMatcher {
    fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl Matcher for QnameMatcher {
    async fn is_match(&self, qctx: &QueryContext) -> bool {
        qctx.q().queries().iter().any(|q| {
            let name = normalize_name(&q.name().to_string());
            self.patterns.is_match(&name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(rules: &[&str]) -> DomainPatternSet {
        let mut s = DomainPatternSet::default();
        for rule in rules {
            s.add_pattern(rule).unwrap();
        }
        s.finalize().unwrap();
        s
    }

    #[test]
    fn full_is_the_default_and_exact() {
        let s = set(&["example.com", "full:other.org"]);
        assert!(s.is_match("example.com"));
        assert!(s.is_match("other.org"));
        assert!(!s.is_match("sub.example.com"));
    }

    #[test]
    fn domain_matches_on_label_boundary() {
        let s = set(&["domain:example.com"]);
        assert!(s.is_match("example.com"));
        assert!(s.is_match("a.b.example.com"));
        assert!(!s.is_match("notexample.com"));
    }

    #[test]
    fn keyword_is_a_substring_match() {
        let s = set(&["keyword:tracker"]);
        assert!(s.is_match("ads.tracker-cdn.net"));
        assert!(!s.is_match("example.com"));
    }

    #[test]
    fn regexp_rules_compile_and_match() {
        let s = set(&["regexp:^ads[0-9]+\\."]);
        assert!(s.is_match("ads01.example.com"));
        assert!(!s.is_match("ads.example.com"));
    }

    #[test]
    fn invalid_regexp_is_rejected() {
        let mut s = DomainPatternSet::default();
        assert!(s.add_pattern("regexp:(").is_err());
    }

    #[test]
    fn suffixes_walk_label_boundaries_most_specific_first() {
        let mut suffixes: SmallVec<[&str; 8]> = SmallVec::new();
        split_label_suffixes("a.b.example.com", &mut suffixes);
        assert_eq!(
            suffixes.as_slice(),
            ["a.b.example.com", "b.example.com", "example.com", "com"]
        );

        split_label_suffixes("localhost", &mut suffixes);
        assert_eq!(suffixes.as_slice(), ["localhost"]);
    }
}
