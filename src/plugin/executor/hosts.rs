/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `hosts` responder stage.
//!
//! Maps domain patterns to static A/AAAA answers. On a hit it synthesizes
//! the response and stops its sequence; otherwise the query falls through to
//! the next stage. The same logic backs the context-pipelined form: a hit
//! terminates the pipe, a miss chains into the remaining commands.

use crate::config::types::PluginConfig;
use crate::core::context::{ContextStatus, QueryContext};
use crate::core::dns_utils::build_response_from_request;
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::sequence::walker::PipeContext;
use crate::plugin::executor::{EsExecutable, PipelinedExecutable};
use crate::plugin::matcher::qname::{normalize_name, split_label_suffixes};
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use ahash::AHashMap;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use regex::{Regex, RegexSet, RegexSetBuilder};
use serde::Deserialize;
use smallvec::SmallVec;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const HOSTS_TTL: u32 = 3600;

#[derive(Debug, Clone, Deserialize, Default)]
struct HostsConfig {
    /// Inline hosts lines.
    #[serde(default)]
    entries: Vec<String>,
    /// Hosts files, loaded in order.
    #[serde(default)]
    files: Vec<String>,
}

/// Addresses recorded under one pattern. Entries under the same pattern
/// merge by appending in load order; duplicates are kept.
#[derive(Debug, Clone, Default)]
struct IpRecord {
    ipv4: Vec<Ipv4Addr>,
    ipv6: Vec<Ipv6Addr>,
}

impl IpRecord {
    fn append(&mut self, other: IpRecord) {
        self.ipv4.extend(other.ipv4);
        self.ipv6.extend(other.ipv6);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostsPattern {
    Full(String),
    Domain(String),
    Keyword(String),
    Regexp(String),
}

/// Pattern-indexed record table. Lookup precedence: full, domain (most
/// specific suffix first), keyword, regexp.
#[derive(Debug, Default)]
struct HostsTable {
    records: Vec<IpRecord>,
    full: AHashMap<Box<str>, usize>,
    domain: AHashMap<Box<str>, usize>,
    keyword_patterns: Vec<String>,
    keyword_records: Vec<usize>,
    keyword: Option<AhoCorasick>,
    regexp_patterns: Vec<String>,
    regexp_records: Vec<usize>,
    regexp: Option<RegexSet>,
}

impl HostsTable {
    fn add(&mut self, pattern: HostsPattern, record: IpRecord) {
        match pattern {
            HostsPattern::Full(v) => {
                let idx = *self
                    .full
                    .entry(v.into_boxed_str())
                    .or_insert_with(|| push_record(&mut self.records));
                self.records[idx].append(record);
            }
            HostsPattern::Domain(v) => {
                let idx = *self
                    .domain
                    .entry(v.into_boxed_str())
                    .or_insert_with(|| push_record(&mut self.records));
                self.records[idx].append(record);
            }
            HostsPattern::Keyword(v) => {
                let idx = match self.keyword_patterns.iter().position(|p| *p == v) {
                    Some(pos) => self.keyword_records[pos],
                    None => {
                        let idx = push_record(&mut self.records);
                        self.keyword_patterns.push(v);
                        self.keyword_records.push(idx);
                        idx
                    }
                };
                self.records[idx].append(record);
            }
            HostsPattern::Regexp(v) => {
                let idx = match self.regexp_patterns.iter().position(|p| *p == v) {
                    Some(pos) => self.regexp_records[pos],
                    None => {
                        let idx = push_record(&mut self.records);
                        self.regexp_patterns.push(v);
                        self.regexp_records.push(idx);
                        idx
                    }
                };
                self.records[idx].append(record);
            }
        }
    }

    fn finalize(&mut self) -> Result<()> {
        if !self.keyword_patterns.is_empty() {
            self.keyword = Some(
                AhoCorasickBuilder::new()
                    .ascii_case_insensitive(false)
                    .build(&self.keyword_patterns)
                    .map_err(|e| {
                        DnsError::plugin(format!("failed to build hosts keyword matcher: {}", e))
                    })?,
            );
        }
        if !self.regexp_patterns.is_empty() {
            self.regexp = Some(
                RegexSetBuilder::new(&self.regexp_patterns)
                    .build()
                    .map_err(|e| {
                        DnsError::plugin(format!("failed to build hosts regexp matcher: {}", e))
                    })?,
            );
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<&IpRecord> {
        if let Some(idx) = self.full.get(name) {
            return Some(&self.records[*idx]);
        }

        if !self.domain.is_empty() {
            let mut suffixes: SmallVec<[&str; 8]> = SmallVec::new();
            split_label_suffixes(name, &mut suffixes);
            for suffix in &suffixes {
                if let Some(idx) = self.domain.get(*suffix) {
                    return Some(&self.records[*idx]);
                }
            }
        }

        if let Some(matcher) = &self.keyword {
            if let Some(m) = matcher.find_iter(name).next() {
                return Some(&self.records[self.keyword_records[m.pattern().as_usize()]]);
            }
        }

        if let Some(matcher) = &self.regexp {
            if let Some(pid) = matcher.matches(name).iter().next() {
                return Some(&self.records[self.regexp_records[pid]]);
            }
        }

        None
    }
}

fn push_record(records: &mut Vec<IpRecord>) -> usize {
    records.push(IpRecord::default());
    records.len() - 1
}

pub struct HostsStage {
    tag: String,
    table: HostsTable,
}

impl HostsStage {
    /// Match the single question against the table and, for a hit with
    /// addresses of the queried family, set the response. Returns whether a
    /// response was set.
    fn match_and_set(&self, qctx: &mut QueryContext) -> bool {
        if qctx.q().queries().len() != 1 {
            return false;
        }
        let query = &qctx.q().queries()[0];
        if query.query_class() != DNSClass::IN {
            return false;
        }
        let qtype = query.query_type();
        if qtype != RecordType::A && qtype != RecordType::AAAA {
            return false;
        }

        let qname_wire = query.name().clone();
        let name = normalize_name(&qname_wire.to_string());
        let Some(record) = self.table.lookup(&name) else {
            return false;
        };

        let mut response = build_response_from_request(qctx.q(), ResponseCode::NoError);
        match qtype {
            RecordType::A => {
                if record.ipv4.is_empty() {
                    return false;
                }
                for ip in &record.ipv4 {
                    response.answers_mut().push(Record::from_rdata(
                        qname_wire.clone(),
                        HOSTS_TTL,
                        RData::A(A(*ip)),
                    ));
                }
            }
            RecordType::AAAA => {
                if record.ipv6.is_empty() {
                    return false;
                }
                for ip in &record.ipv6 {
                    response.answers_mut().push(Record::from_rdata(
                        qname_wire.clone(),
                        HOSTS_TTL,
                        RData::AAAA(AAAA(*ip)),
                    ));
                }
            }
            _ => unreachable!("qtype checked above"),
        }

        qctx.set_response(Some(response), ContextStatus::Responded);
        true
    }
}

#[async_trait]
impl Plugin for HostsStage {
    fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl EsExecutable for HostsStage {
    async fn exec_es(&self, _ctx: &CancellationToken, qctx: &mut QueryContext) -> Result<bool> {
        Ok(self.match_and_set(qctx))
    }
}

#[async_trait]
impl PipelinedExecutable for HostsStage {
    async fn connect(
        &self,
        ctx: &CancellationToken,
        qctx: &mut QueryContext,
        mut pipe: PipeContext,
    ) -> Result<()> {
        if self.match_and_set(qctx) {
            return Ok(());
        }
        pipe.exec_next(ctx, qctx).await
    }
}

#[derive(Debug, Clone)]
pub struct HostsFactory;

impl PluginFactory for HostsFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let cfg = parse_config(plugin_config)?;
        if cfg.entries.is_empty() && cfg.files.is_empty() {
            return Err(DnsError::plugin("hosts requires 'entries' or 'files'"));
        }
        // inline entries can be checked without touching the filesystem
        for (idx, entry) in cfg.entries.iter().enumerate() {
            parse_hosts_line(entry).map_err(|e| {
                DnsError::plugin(format!("invalid hosts entry #{} '{}': {}", idx, entry, e))
            })?;
        }
        Ok(())
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let cfg = parse_config(plugin_config)?;
        if cfg.entries.is_empty() && cfg.files.is_empty() {
            return Err(DnsError::plugin("hosts requires 'entries' or 'files'"));
        }
        let table = build_table(&cfg)?;
        Ok(UninitializedPlugin::Pipelined(Box::new(HostsStage {
            tag: plugin_config.tag.clone(),
            table,
        })))
    }
}

fn parse_config(plugin_config: &PluginConfig) -> Result<HostsConfig> {
    let Some(args) = plugin_config.args.clone() else {
        return Ok(HostsConfig::default());
    };
    serde_yml::from_value(args)
        .map_err(|e| DnsError::plugin(format!("failed to parse hosts config: {}", e)))
}

fn build_table(cfg: &HostsConfig) -> Result<HostsTable> {
    let mut table = HostsTable::default();

    for (idx, entry) in cfg.entries.iter().enumerate() {
        let (pattern, record) = parse_hosts_line(entry).map_err(|e| {
            DnsError::plugin(format!("invalid hosts entry #{} '{}': {}", idx, entry, e))
        })?;
        table.add(pattern, record);
    }

    for file in &cfg.files {
        load_file(&mut table, file)?;
    }

    table.finalize()?;
    Ok(table)
}

fn load_file(table: &mut HostsTable, path: &str) -> Result<()> {
    let file = File::open(path)
        .map_err(|e| DnsError::plugin(format!("failed to open hosts file '{}': {}", path, e)))?;
    let reader = BufReader::new(file);

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| {
            DnsError::plugin(format!(
                "failed to read hosts file '{}' at line {}: {}",
                path,
                line_no + 1,
                e
            ))
        })?;

        let raw = line.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }
        let raw = raw.split_once('#').map(|(left, _)| left).unwrap_or(raw).trim();
        if raw.is_empty() {
            continue;
        }

        let (pattern, record) = parse_hosts_line(raw).map_err(|e| {
            DnsError::plugin(format!(
                "invalid hosts file '{}' line {} '{}': {}",
                path,
                line_no + 1,
                raw,
                e
            ))
        })?;
        table.add(pattern, record);
    }
    Ok(())
}

fn parse_hosts_line(raw: &str) -> std::result::Result<(HostsPattern, IpRecord), String> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() < 2 {
        return Err("hosts line must be 'pattern ip [ip...]'".to_string());
    }

    let pattern = parse_pattern(fields[0])?;

    let mut record = IpRecord::default();
    for token in &fields[1..] {
        match token.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => record.ipv4.push(v4),
            Ok(IpAddr::V6(v6)) => record.ipv6.push(v6),
            Err(e) => return Err(format!("invalid ip addr '{}': {}", token, e)),
        }
    }

    Ok((pattern, record))
}

fn parse_pattern(raw: &str) -> std::result::Result<HostsPattern, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty hosts pattern".to_string());
    }

    if let Some(v) = raw.strip_prefix("full:") {
        return Ok(HostsPattern::Full(normalize_name(v)));
    }
    if let Some(v) = raw.strip_prefix("domain:") {
        return Ok(HostsPattern::Domain(normalize_name(v)));
    }
    if let Some(v) = raw.strip_prefix("keyword:") {
        return Ok(HostsPattern::Keyword(v.to_ascii_lowercase()));
    }
    if let Some(v) = raw.strip_prefix("regexp:") {
        Regex::new(v).map_err(|e| format!("invalid regexp '{}': {}", v, e))?;
        return Ok(HostsPattern::Regexp(v.to_string()));
    }

    // a bare pattern defaults to an exact match
    Ok(HostsPattern::Full(normalize_name(raw)))
}
