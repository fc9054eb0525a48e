/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Plugin dependency resolution
//!
//! Orders plugin configurations so that every tag reference points at an
//! already-initialized plugin, regardless of declaration order in the
//! configuration file.

use crate::config::types::PluginConfig;
use crate::core::error::{DnsError, Result};
use std::collections::{HashMap, VecDeque};

/// Resolve plugin dependencies and return plugins in initialization order
///
/// Plugins are indexed by position and processed ready-first: a plugin
/// becomes ready once all of its declared dependencies have been emitted.
/// Anything still pending at the end sits on a dependency cycle, which is
/// reported with the tags involved. Dependencies on tags that are not
/// declared at all are skipped here; the owning factory reports those with
/// a precise error at creation time.
pub fn resolve_dependencies(
    configs: Vec<PluginConfig>,
    get_deps: &dyn Fn(&PluginConfig) -> Vec<String>,
) -> Result<Vec<PluginConfig>> {
    let order = {
        let index: HashMap<&str, usize> = configs
            .iter()
            .enumerate()
            .map(|(idx, config)| (config.tag.as_str(), idx))
            .collect();

        // dependents[d] lists plugins waiting on d; pending[p] counts how
        // many of p's dependencies have not been emitted yet
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); configs.len()];
        let mut pending: Vec<usize> = vec![0; configs.len()];
        for (idx, config) in configs.iter().enumerate() {
            for dep in get_deps(config) {
                let Some(&dep_idx) = index.get(dep.as_str()) else {
                    continue;
                };
                dependents[dep_idx].push(idx);
                pending[idx] += 1;
            }
        }

        let mut ready: VecDeque<usize> = pending
            .iter()
            .enumerate()
            .filter(|(_, unmet)| **unmet == 0)
            .map(|(idx, _)| idx)
            .collect();

        let mut order = Vec::with_capacity(configs.len());
        while let Some(idx) = ready.pop_front() {
            order.push(idx);
            for &dependent in &dependents[idx] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }

        if order.len() != configs.len() {
            let stuck: Vec<&str> = pending
                .iter()
                .enumerate()
                .filter(|(_, unmet)| **unmet > 0)
                .map(|(idx, _)| configs[idx].tag.as_str())
                .collect();
            return Err(DnsError::dependency(format!(
                "circular dependency between plugins: {}",
                stuck.join(", ")
            )));
        }

        order
    };

    let mut slots: Vec<Option<PluginConfig>> = configs.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .map(|idx| slots[idx].take().expect("each index emitted exactly once"))
        .collect())
}
