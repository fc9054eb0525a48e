/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Sequence evaluation: drives commands in declaration order, honoring
//! early-stop, terminal status, pipeline hand-off and parallel fan-out.

use crate::core::context::{ContextStatus, QueryContext};
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::sequence::{ExecutableCmd, ExecutableCmdSequence, StageBinding};
use futures::future::{BoxFuture, FutureExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Evaluate `seq` against `qctx` in declaration order.
///
/// Returns the first error a command produced. The sequence also ends when
/// a non-pipelined command leaves the context in a terminal status, or when
/// an early-stop stage says so; neither of these is an error.
pub async fn walk(
    ctx: &CancellationToken,
    qctx: &mut QueryContext,
    seq: &ExecutableCmdSequence,
) -> Result<()> {
    walk_from(ctx, qctx, seq, 0).await
}

fn walk_from<'a>(
    ctx: &'a CancellationToken,
    qctx: &'a mut QueryContext,
    seq: &'a ExecutableCmdSequence,
    start: usize,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let cmds = seq.cmds();
        let mut idx = start;
        while idx < cmds.len() {
            match &cmds[idx] {
                ExecutableCmd::Stage {
                    tag,
                    binding,
                    pipeline_root,
                } => match binding {
                    StageBinding::Pipelined(stage) if *pipeline_root => {
                        // the pipelined stage owns the remaining commands
                        let pipe = PipeContext::new(seq.clone(), idx + 1);
                        return stage.connect(ctx, qctx, pipe).await;
                    }
                    StageBinding::Pipelined(stage) => {
                        if stage.exec_es(ctx, qctx).await? {
                            debug!("stage '{}' stopped the sequence", tag);
                            return Ok(());
                        }
                    }
                    StageBinding::EarlyStop(stage) => {
                        if stage.exec_es(ctx, qctx).await? {
                            debug!("stage '{}' stopped the sequence", tag);
                            return Ok(());
                        }
                    }
                    StageBinding::Exec(stage) => stage.exec(ctx, qctx).await?,
                },
                ExecutableCmd::If {
                    conditions,
                    then_seq,
                } => {
                    let mut hit = false;
                    for cond in conditions {
                        if cond.eval(qctx).await {
                            debug!("condition '{}' matched", cond.tag);
                            hit = true;
                            break;
                        }
                    }
                    if hit {
                        walk_from(ctx, qctx, then_seq, 0).await?;
                    }
                }
                ExecutableCmd::IfAnd {
                    conditions,
                    then_seq,
                } => {
                    let mut hit = true;
                    for cond in conditions {
                        if !cond.eval(qctx).await {
                            hit = false;
                            break;
                        }
                    }
                    if hit {
                        walk_from(ctx, qctx, then_seq, 0).await?;
                    }
                }
                ExecutableCmd::Parallel(branches) => {
                    exec_parallel(ctx, qctx, branches).await?;
                }
            }

            if qctx.status().is_terminal() {
                debug!("sequence ended with terminal status {}", qctx.status());
                return Ok(());
            }
            idx += 1;
        }
        Ok(())
    }
    .boxed()
}

/// Run branch sequences concurrently on independent context clones.
///
/// The first branch to reach `Responded` wins: its response and deferred
/// stack are adopted by the parent; the other branches get a derived
/// cancellation and their clean-up (deferred actions, error logging) is
/// finished off the query path.
async fn exec_parallel(
    ctx: &CancellationToken,
    qctx: &mut QueryContext,
    branches: &[ExecutableCmdSequence],
) -> Result<()> {
    let child = ctx.child_token();
    let mut join_set = JoinSet::new();
    for (idx, branch) in branches.iter().enumerate() {
        let branch = branch.clone();
        let token = child.clone();
        let mut bctx = qctx.copy_no_response();
        join_set.spawn(async move {
            let result = walk(&token, &mut bctx, &branch).await;
            (idx, bctx, result)
        });
    }

    let mut last_err: Option<DnsError> = None;
    while let Some(joined) = join_set.join_next().await {
        let (idx, mut bctx, result) = match joined {
            Ok(v) => v,
            Err(e) => {
                last_err = Some(DnsError::runtime(format!(
                    "parallel branch join error: {}",
                    e
                )));
                continue;
            }
        };
        match result {
            Ok(()) if bctx.status() == ContextStatus::Responded => {
                child.cancel();
                qctx.adopt(bctx);
                drain_branches(join_set, child, "parallel");
                return Ok(());
            }
            Ok(()) => {
                debug!(
                    "parallel branch {} finished without response (status {})",
                    idx,
                    bctx.status()
                );
                bctx.exec_defer_discard(&child).await;
            }
            Err(e) => {
                debug!("parallel branch {} failed: {}", idx, e);
                bctx.exec_defer_discard(&child).await;
                last_err = Some(e);
            }
        }
    }

    // no branch responded: surface the last error, leave the status alone
    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Finish losing branches off the query path: await them, run their
/// deferred actions on the loser clone, log their errors at debug.
fn drain_branches(
    mut join_set: JoinSet<(usize, QueryContext, Result<()>)>,
    token: CancellationToken,
    what: &'static str,
) {
    if join_set.is_empty() {
        return;
    }
    tokio::spawn(async move {
        while let Some(joined) = join_set.join_next().await {
            let Ok((idx, mut bctx, result)) = joined else {
                continue;
            };
            if let Err(e) = result {
                debug!("{} losing branch {} failed: {}", what, idx, e);
            }
            bctx.exec_defer_discard(&token).await;
        }
    });
}

/// Continuation handle given to a pipeline-root stage: the remaining
/// commands of its enclosing sequence.
pub struct PipeContext {
    seq: ExecutableCmdSequence,
    next: usize,
}

impl PipeContext {
    pub(crate) fn new(seq: ExecutableCmdSequence, next: usize) -> Self {
        Self { seq, next }
    }

    /// Number of commands left in the pipe.
    pub fn remaining(&self) -> usize {
        self.seq.len().saturating_sub(self.next)
    }

    /// Execute the remaining commands. Subsequent calls are no-ops.
    pub async fn exec_next(
        &mut self,
        ctx: &CancellationToken,
        qctx: &mut QueryContext,
    ) -> Result<()> {
        if self.next >= self.seq.len() {
            return Ok(());
        }
        let start = self.next;
        self.next = self.seq.len();
        let seq = self.seq.clone();
        walk_from(ctx, qctx, &seq, start).await
    }
}
