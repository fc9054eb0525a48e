/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Stage capability traits consumed by the sequence walker.
//!
//! A stage exposes exactly one of three invocation contracts:
//! - [`Executable`]: plain execution, the sequence continues unless the
//!   context reached a terminal status or an error was returned.
//! - [`EsExecutable`]: like `Executable` but may additionally halt the
//!   enclosing sequence by returning `true`.
//! - [`PipelinedExecutable`]: owns the continuation into the remaining
//!   commands of its sequence. Pipelined stages also carry the early-stop
//!   contract so they stay usable outside a pipeline root position.

use crate::core::context::QueryContext;
use crate::core::error::Result;
use crate::plugin::executor::sequence::walker::PipeContext;
use crate::plugin::Plugin;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub mod fallback;
pub mod hosts;
pub mod query_summary;
pub mod sequence;

#[async_trait]
pub trait Executable: Plugin {
    async fn exec(&self, ctx: &CancellationToken, qctx: &mut QueryContext) -> Result<()>;
}

#[async_trait]
pub trait EsExecutable: Plugin {
    /// Execute the stage. Returning `true` ends the enclosing sequence
    /// (not its parent).
    async fn exec_es(&self, ctx: &CancellationToken, qctx: &mut QueryContext) -> Result<bool>;
}

#[async_trait]
pub trait PipelinedExecutable: EsExecutable {
    /// Take ownership of the pipe: either terminate it or call
    /// `pipe.exec_next` to chain into the remaining commands.
    async fn connect(
        &self,
        ctx: &CancellationToken,
        qctx: &mut QueryContext,
        pipe: PipeContext,
    ) -> Result<()>;
}
