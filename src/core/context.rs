/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Per-query context flowing through the pipeline.
//!
//! A [`QueryContext`] is created by the server front-end when a query arrives
//! and destroyed after the reply (or SERVFAIL) has been written and all
//! deferred actions have run. Stages communicate exclusively through it;
//! stage instances themselves hold no per-query state.

use crate::core::error::Result;
use async_trait::async_trait;
use hickory_proto::op::Message;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Processing status of a query context.
///
/// `Unhandled` is the only non-terminal status. Once a terminal status is
/// set, only the response body may still be touched (by deferred actions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    Unhandled,
    Responded,
    Rejected,
    Dropped,
    ServerFailed,
}

impl ContextStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        !matches!(self, ContextStatus::Unhandled)
    }
}

impl Display for ContextStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContextStatus::Unhandled => "unhandled",
            ContextStatus::Responded => "responded",
            ContextStatus::Rejected => "rejected",
            ContextStatus::Dropped => "dropped",
            ContextStatus::ServerFailed => "server_failed",
        };
        f.write_str(s)
    }
}

/// An action queued during pipeline execution and run LIFO after the
/// outermost walk returns.
///
/// Actions receive the server handler's cancellation context, not a private
/// one; if the query deadline already fired when they run they will observe
/// cancellation.
#[async_trait]
pub trait DeferredExec: Send + Sync {
    async fn exec_deferred(&self, ctx: &CancellationToken, qctx: &mut QueryContext)
        -> Result<()>;
}

#[derive(Clone)]
pub struct QueryContext {
    question: Message,
    response: Option<Message>,
    status: ContextStatus,
    from: Option<SocketAddr>,
    deferred: Vec<Arc<dyn DeferredExec>>,
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("question", &self.question)
            .field("response", &self.response)
            .field("status", &self.status)
            .field("from", &self.from)
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

impl QueryContext {
    pub fn new(question: Message, from: Option<SocketAddr>) -> Self {
        Self {
            question,
            response: None,
            status: ContextStatus::Unhandled,
            from,
            deferred: Vec::new(),
        }
    }

    /// The decoded request message.
    #[inline]
    pub fn q(&self) -> &Message {
        &self.question
    }

    /// Mutable access to the question. Reserved for branch clones (ECS
    /// attachment); the original context's question must stay untouched.
    #[inline]
    pub fn question_mut(&mut self) -> &mut Message {
        &mut self.question
    }

    /// The current response, if any stage has set one.
    #[inline]
    pub fn r(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    #[inline]
    pub fn response_mut(&mut self) -> Option<&mut Message> {
        self.response.as_mut()
    }

    #[inline]
    pub fn status(&self) -> ContextStatus {
        self.status
    }

    #[inline]
    pub fn from(&self) -> Option<SocketAddr> {
        self.from
    }

    /// Set the response body and status in one step. Pass `None` for
    /// statuses that carry no reply body (`Rejected`, `Dropped`,
    /// `ServerFailed`).
    pub fn set_response(&mut self, response: Option<Message>, status: ContextStatus) {
        self.response = response;
        self.status = status;
    }

    /// Clone for a parallel/fallback branch: same question and client
    /// address, fresh response/status, empty deferred stack.
    pub fn copy_no_response(&self) -> QueryContext {
        QueryContext {
            question: self.question.clone(),
            response: None,
            status: ContextStatus::Unhandled,
            from: self.from,
            deferred: Vec::new(),
        }
    }

    /// Adopt a winning branch: its response, status and deferred stack
    /// replace this context's.
    pub fn adopt(&mut self, winner: QueryContext) {
        self.response = winner.response;
        self.status = winner.status;
        self.deferred = winner.deferred;
    }

    /// Push a deferred action. Actions run LIFO after the outermost walk.
    pub fn defer_exec(&mut self, action: Arc<dyn DeferredExec>) {
        self.deferred.push(action);
    }

    #[inline]
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Pop and run all deferred actions in LIFO order. Errors are logged at
    /// warn and never change the status; actions are not retried.
    pub async fn exec_defer(&mut self, ctx: &CancellationToken) {
        while let Some(action) = self.deferred.pop() {
            if let Err(e) = action.exec_deferred(ctx, self).await {
                warn!("deferred action failed: {} ({})", e, self.info());
            }
        }
    }

    /// Like [`Self::exec_defer`] but for losing branch clones: errors are
    /// discarded after a debug log.
    pub async fn exec_defer_discard(&mut self, ctx: &CancellationToken) {
        while let Some(action) = self.deferred.pop() {
            if let Err(e) = action.exec_deferred(ctx, self).await {
                debug!("deferred action on losing branch failed: {}", e);
            }
        }
    }

    /// Compact identifier for log lines, derived from the first question,
    /// the message id and the client address.
    pub fn info(&self) -> String {
        let mut out = String::with_capacity(48);
        match self.question.queries().first() {
            Some(q) => {
                out.push_str(&q.name().to_string());
                out.push(' ');
                out.push_str(&q.query_type().to_string());
            }
            None => out.push_str("<no question>"),
        }
        out.push_str(&format!(" id={}", self.question.id()));
        if let Some(from) = self.from {
            out.push_str(&format!(" from={}", from));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::sync::Mutex;

    fn make_context() -> QueryContext {
        let mut request = Message::new();
        request.set_id(4321);
        request.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
        QueryContext::new(request, Some("127.0.0.1:5353".parse().unwrap()))
    }

    struct RecordingDefer {
        name: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl DeferredExec for RecordingDefer {
        async fn exec_deferred(
            &self,
            _ctx: &CancellationToken,
            _qctx: &mut QueryContext,
        ) -> Result<()> {
            self.order.lock().unwrap().push(self.name);
            if self.fail {
                return Err("deferred boom".into());
            }
            Ok(())
        }
    }

    #[test]
    fn new_context_is_unhandled_without_response() {
        let qctx = make_context();
        assert_eq!(qctx.status(), ContextStatus::Unhandled);
        assert!(!qctx.status().is_terminal());
        assert!(qctx.r().is_none());
    }

    #[test]
    fn branch_clone_shares_question_but_not_outcome() {
        let mut qctx = make_context();
        qctx.set_response(Some(Message::new()), ContextStatus::Responded);

        let clone = qctx.copy_no_response();
        assert_eq!(clone.q().id(), qctx.q().id());
        assert_eq!(clone.from(), qctx.from());
        assert_eq!(clone.status(), ContextStatus::Unhandled);
        assert!(clone.r().is_none());
        assert_eq!(clone.deferred_len(), 0);
    }

    #[test]
    fn adopt_replaces_response_status_and_deferred() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut parent = make_context();
        parent.defer_exec(Arc::new(RecordingDefer {
            name: "parent",
            order: order.clone(),
            fail: false,
        }));

        let mut winner = parent.copy_no_response();
        winner.set_response(Some(Message::new()), ContextStatus::Responded);
        winner.defer_exec(Arc::new(RecordingDefer {
            name: "winner",
            order: order.clone(),
            fail: false,
        }));

        parent.adopt(winner);
        assert_eq!(parent.status(), ContextStatus::Responded);
        assert!(parent.r().is_some());
        assert_eq!(parent.deferred_len(), 1);
    }

    #[tokio::test]
    async fn deferred_actions_run_lifo_and_survive_errors() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut qctx = make_context();
        for (name, fail) in [("first", false), ("second", true), ("third", false)] {
            qctx.defer_exec(Arc::new(RecordingDefer {
                name,
                order: order.clone(),
                fail,
            }));
        }
        qctx.set_response(Some(Message::new()), ContextStatus::Responded);

        let ctx = CancellationToken::new();
        qctx.exec_defer(&ctx).await;

        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
        assert_eq!(qctx.deferred_len(), 0);
        // a failing action never changes the status
        assert_eq!(qctx.status(), ContextStatus::Responded);
    }

    #[test]
    fn info_names_question_id_and_client() {
        let qctx = make_context();
        let info = qctx.info();
        assert!(info.contains("example.com."));
        assert!(info.contains("id=4321"));
        assert!(info.contains("127.0.0.1"));
    }
}
