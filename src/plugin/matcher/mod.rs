/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::core::context::QueryContext;
use crate::plugin::Plugin;
use async_trait::async_trait;

pub mod has_resp;
pub mod qname;
pub mod qtype;

/// Condition plugins used in `if` / `if_and` commands.
///
/// Matchers observe the context but never mutate it; the walker only uses
/// their truth value.
#[async_trait]
pub trait Matcher: Plugin {
    async fn is_match(&self, qctx: &QueryContext) -> bool;
}
