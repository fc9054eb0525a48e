/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Executable command sequences: the pipeline programs stages run in.
//!
//! A sequence is an ordered list of commands built from configuration at
//! load time. Commands reference stages by tag (resolved against the plugin
//! registry, so a dangling tag is a load error, never a runtime one),
//! conditionally execute nested sequences, or fan out into parallel
//! branches. Sequences are immutable after construction and cheap to clone.

pub mod walker;

use crate::config::types::PluginConfig;
use crate::core::context::QueryContext;
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::{EsExecutable, Executable, PipelinedExecutable};
use crate::plugin::matcher::Matcher;
use crate::plugin::{Plugin, PluginFactory, PluginKind, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One command of a sequence, as written in configuration.
///
/// A plain string references a stage by tag; a block holds one of the
/// structured command forms.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CmdConfig {
    Ref(String),
    Block(Box<CmdBlockConfig>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CmdBlockConfig {
    /// Conditions joined by logical OR.
    #[serde(rename = "if", default)]
    pub if_any: Option<Vec<String>>,

    /// Conditions joined by logical AND.
    #[serde(default)]
    pub if_and: Option<Vec<String>>,

    /// Commands executed when the conditions hold.
    #[serde(default)]
    pub exec: Option<Vec<CmdConfig>>,

    /// Branch sequences executed concurrently.
    #[serde(default)]
    pub parallel: Option<Vec<Vec<CmdConfig>>>,

    /// Stage reference marked as a pipeline root.
    #[serde(default)]
    pub pipeline: Option<String>,
}

/// A stage reference resolved to its capability.
#[derive(Clone)]
pub enum StageBinding {
    Exec(Arc<dyn Executable>),
    EarlyStop(Arc<dyn EsExecutable>),
    Pipelined(Arc<dyn PipelinedExecutable>),
}

/// A condition over the query context: a matcher tag, optionally negated
/// with a leading `!`.
#[derive(Clone)]
pub struct Condition {
    pub(crate) tag: String,
    pub(crate) matcher: Arc<dyn Matcher>,
    pub(crate) negate: bool,
}

impl Condition {
    pub(crate) async fn eval(&self, qctx: &QueryContext) -> bool {
        self.matcher.is_match(qctx).await != self.negate
    }
}

pub enum ExecutableCmd {
    Stage {
        tag: String,
        binding: StageBinding,
        pipeline_root: bool,
    },
    If {
        conditions: Vec<Condition>,
        then_seq: ExecutableCmdSequence,
    },
    IfAnd {
        conditions: Vec<Condition>,
        then_seq: ExecutableCmdSequence,
    },
    Parallel(Vec<ExecutableCmdSequence>),
}

/// Immutable, shareable command sequence.
#[derive(Clone)]
pub struct ExecutableCmdSequence {
    cmds: Arc<Vec<ExecutableCmd>>,
}

impl std::fmt::Debug for ExecutableCmdSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableCmdSequence")
            .field("len", &self.cmds.len())
            .finish()
    }
}

impl ExecutableCmdSequence {
    pub fn from_cmds(cmds: Vec<ExecutableCmd>) -> Self {
        Self {
            cmds: Arc::new(cmds),
        }
    }

    #[inline]
    pub(crate) fn cmds(&self) -> &[ExecutableCmd] {
        &self.cmds
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }
}

/// Build a command sequence from configuration, resolving every stage and
/// matcher tag against the registry.
pub fn build_cmd_sequence(
    cfgs: &[CmdConfig],
    registry: &Arc<PluginRegistry>,
) -> Result<ExecutableCmdSequence> {
    let mut cmds = Vec::with_capacity(cfgs.len());
    for cfg in cfgs {
        cmds.push(build_cmd(cfg, registry)?);
    }
    Ok(ExecutableCmdSequence::from_cmds(cmds))
}

fn build_cmd(cfg: &CmdConfig, registry: &Arc<PluginRegistry>) -> Result<ExecutableCmd> {
    match cfg {
        CmdConfig::Ref(tag) => resolve_stage(tag, registry, false),
        CmdConfig::Block(block) => build_block_cmd(block, registry),
    }
}

fn build_block_cmd(
    block: &CmdBlockConfig,
    registry: &Arc<PluginRegistry>,
) -> Result<ExecutableCmd> {
    let forms = [
        block.if_any.is_some(),
        block.if_and.is_some(),
        block.parallel.is_some(),
        block.pipeline.is_some(),
    ];
    if forms.iter().filter(|set| **set).count() != 1 {
        return Err(DnsError::config(
            "sequence command must be exactly one of: if/exec, if_and/exec, parallel, pipeline",
        ));
    }

    if let Some(tag) = &block.pipeline {
        if block.exec.is_some() {
            return Err(DnsError::config("pipeline command takes no exec block"));
        }
        return resolve_stage(tag, registry, true);
    }

    if let Some(branches) = &block.parallel {
        if block.exec.is_some() {
            return Err(DnsError::config("parallel command takes no exec block"));
        }
        if branches.len() < 2 {
            return Err(DnsError::config("parallel requires at least two branches"));
        }
        let mut seqs = Vec::with_capacity(branches.len());
        for branch in branches {
            if branch.is_empty() {
                return Err(DnsError::config("parallel branch cannot be empty"));
            }
            seqs.push(build_cmd_sequence(branch, registry)?);
        }
        return Ok(ExecutableCmd::Parallel(seqs));
    }

    // if / if_and
    let (raw_conditions, and) = match (&block.if_any, &block.if_and) {
        (Some(c), None) => (c, false),
        (None, Some(c)) => (c, true),
        _ => unreachable!("exactly one form checked above"),
    };
    if raw_conditions.is_empty() {
        return Err(DnsError::config("if/if_and requires at least one condition"));
    }
    let exec = block
        .exec
        .as_ref()
        .ok_or_else(|| DnsError::config("if/if_and requires an exec block"))?;
    if exec.is_empty() {
        return Err(DnsError::config("if/if_and exec block cannot be empty"));
    }

    let conditions = resolve_conditions(raw_conditions, registry)?;
    let then_seq = build_cmd_sequence(exec, registry)?;
    Ok(if and {
        ExecutableCmd::IfAnd {
            conditions,
            then_seq,
        }
    } else {
        ExecutableCmd::If {
            conditions,
            then_seq,
        }
    })
}

fn resolve_stage(
    tag: &str,
    registry: &Arc<PluginRegistry>,
    pipeline_root: bool,
) -> Result<ExecutableCmd> {
    let tag = tag.trim();
    if tag.is_empty() {
        return Err(DnsError::config("empty stage reference"));
    }

    let info = registry
        .get_plugin(tag)
        .ok_or_else(|| DnsError::config(format!("stage '{}' does not exist", tag)))?;

    let binding = match &info.kind {
        PluginKind::Executable(p) => StageBinding::Exec(p.clone()),
        PluginKind::EsExecutable(p) => StageBinding::EarlyStop(p.clone()),
        PluginKind::Pipelined(p) => StageBinding::Pipelined(p.clone()),
        other => {
            return Err(DnsError::config(format!(
                "stage '{}' is a {} plugin and cannot be executed",
                tag,
                other.kind_name()
            )));
        }
    };

    if pipeline_root && !matches!(binding, StageBinding::Pipelined(_)) {
        return Err(DnsError::config(format!(
            "stage '{}' cannot be a pipeline root: it is not context-pipelined",
            tag
        )));
    }

    Ok(ExecutableCmd::Stage {
        tag: tag.to_string(),
        binding,
        pipeline_root,
    })
}

fn resolve_conditions(
    raw: &[String],
    registry: &Arc<PluginRegistry>,
) -> Result<Vec<Condition>> {
    let mut out = Vec::with_capacity(raw.len());
    for expr in raw {
        let expr = expr.trim();
        let (negate, tag) = match expr.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, expr),
        };
        if tag.is_empty() {
            return Err(DnsError::config(format!("invalid condition: '{}'", expr)));
        }
        let info = registry
            .get_plugin(tag)
            .ok_or_else(|| DnsError::config(format!("matcher '{}' does not exist", tag)))?;
        let matcher = info.to_matcher().ok_or_else(|| {
            DnsError::config(format!(
                "condition '{}' references a {} plugin, expected a matcher",
                tag,
                info.kind.kind_name()
            ))
        })?;
        out.push(Condition {
            tag: tag.to_string(),
            matcher,
            negate,
        });
    }
    Ok(out)
}

/// Collect every tag a command list references, for dependency ordering.
pub fn collect_cmd_dependencies(cfgs: &[CmdConfig], out: &mut Vec<String>) {
    for cfg in cfgs {
        match cfg {
            CmdConfig::Ref(tag) => out.push(tag.trim().to_string()),
            CmdConfig::Block(block) => {
                for conds in [&block.if_any, &block.if_and].into_iter().flatten() {
                    for cond in conds {
                        let tag = cond.trim().trim_start_matches('!').trim();
                        if !tag.is_empty() {
                            out.push(tag.to_string());
                        }
                    }
                }
                if let Some(exec) = &block.exec {
                    collect_cmd_dependencies(exec, out);
                }
                if let Some(branches) = &block.parallel {
                    for branch in branches {
                        collect_cmd_dependencies(branch, out);
                    }
                }
                if let Some(tag) = &block.pipeline {
                    out.push(tag.trim().to_string());
                }
            }
        }
    }
}

/// Named sequence plugin: makes a command sequence referenceable by tag.
pub struct Sequence {
    tag: String,
    seq: ExecutableCmdSequence,
}

#[async_trait]
impl Plugin for Sequence {
    fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl Executable for Sequence {
    async fn exec(&self, ctx: &CancellationToken, qctx: &mut QueryContext) -> Result<()> {
        walker::walk(ctx, qctx, &self.seq).await
    }
}

#[derive(Debug, Clone)]
pub struct SequenceFactory;

impl PluginFactory for SequenceFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let cmds = parse_args(plugin_config)?;
        if cmds.is_empty() {
            return Err(DnsError::config("sequence requires at least one command"));
        }
        Ok(())
    }

    fn get_dependencies(&self, plugin_config: &PluginConfig) -> Vec<String> {
        let mut deps = Vec::new();
        if let Ok(cmds) = parse_args(plugin_config) {
            collect_cmd_dependencies(&cmds, &mut deps);
        }
        deps
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let cmds = parse_args(plugin_config)?;
        let seq = build_cmd_sequence(&cmds, &registry)?;
        Ok(UninitializedPlugin::Executable(Box::new(Sequence {
            tag: plugin_config.tag.clone(),
            seq,
        })))
    }
}

fn parse_args(plugin_config: &PluginConfig) -> Result<Vec<CmdConfig>> {
    let args = plugin_config
        .args
        .clone()
        .ok_or_else(|| DnsError::config("sequence requires a command list"))?;
    serde_yml::from_value(args)
        .map_err(|e| DnsError::config(format!("failed to parse sequence commands: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Vec<CmdConfig> {
        serde_yml::from_str(yaml).unwrap()
    }

    #[test]
    fn parses_plain_refs_and_blocks() {
        let cmds = parse(
            r#"
- hosts_cn
- if: ["qtype_a", "!cn_domains"]
  exec:
    - forward_local
- parallel:
    - [up_a]
    - [up_b]
- pipeline: hosts_cn
"#,
        );
        assert_eq!(cmds.len(), 4);
        assert!(matches!(&cmds[0], CmdConfig::Ref(tag) if tag == "hosts_cn"));
        match &cmds[1] {
            CmdConfig::Block(b) => {
                assert_eq!(b.if_any.as_ref().unwrap().len(), 2);
                assert_eq!(b.exec.as_ref().unwrap().len(), 1);
            }
            _ => panic!("expected block"),
        }
        match &cmds[3] {
            CmdConfig::Block(b) => assert_eq!(b.pipeline.as_deref(), Some("hosts_cn")),
            _ => panic!("expected block"),
        }
    }

    #[test]
    fn collects_all_referenced_tags() {
        let cmds = parse(
            r#"
- a
- if_and: ["m1", "!m2"]
  exec:
    - b
    - parallel:
        - [c]
        - [d]
"#,
        );
        let mut deps = Vec::new();
        collect_cmd_dependencies(&cmds, &mut deps);
        assert_eq!(deps, vec!["a", "m1", "m2", "b", "c", "d"]);
    }

    #[test]
    fn unknown_tag_fails_at_build_time() {
        let registry = Arc::new(PluginRegistry::new());
        let cmds = parse("- no_such_stage");
        let err = build_cmd_sequence(&cmds, &registry).unwrap_err();
        assert!(err.to_string().contains("no_such_stage"));
    }

    #[test]
    fn block_with_two_forms_is_rejected() {
        let registry = Arc::new(PluginRegistry::new());
        let cmds = parse(
            r#"
- if: ["m"]
  exec: [a]
  parallel:
    - [b]
    - [c]
"#,
        );
        assert!(build_cmd_sequence(&cmds, &registry).is_err());
    }

    #[test]
    fn parallel_needs_two_branches() {
        let registry = Arc::new(PluginRegistry::new());
        let cmds = parse(
            r#"
- parallel:
    - [a]
"#,
        );
        let err = build_cmd_sequence(&cmds, &registry).unwrap_err();
        assert!(err.to_string().contains("two branches"));
    }
}
