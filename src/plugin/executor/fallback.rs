/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `fallback` executor stage.
//!
//! Races a primary command sequence against a secondary one. The secondary
//! stays on standby until the primary fails or a threshold elapses; a
//! sliding window over recent primary outcomes short-circuits to the
//! secondary when the primary keeps failing.

use crate::config::types::PluginConfig;
use crate::core::context::{ContextStatus, QueryContext};
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::sequence::walker::walk;
use crate::plugin::executor::sequence::{
    build_cmd_sequence, collect_cmd_dependencies, CmdConfig, ExecutableCmdSequence,
};
use crate::plugin::executor::Executable;
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_THRESHOLD_MS: u64 = 500;
const DEFAULT_STAT_LENGTH: usize = 10;
const DEFAULT_ECS_MASK4: u8 = 24;
const DEFAULT_ECS_MASK6: u8 = 48;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackConfig {
    pub primary: Vec<CmdConfig>,
    pub secondary: Vec<CmdConfig>,
    #[serde(default)]
    pub threshold_ms: Option<u64>,
    #[serde(default)]
    pub stat_length: Option<usize>,
    #[serde(default)]
    pub threshold_failures: Option<usize>,
    #[serde(default)]
    pub ecs: Option<EcsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EcsConfig {
    #[serde(default)]
    pub mask4: Option<u8>,
    #[serde(default)]
    pub mask6: Option<u8>,
    #[serde(default)]
    pub strip_response: bool,
}

#[derive(Debug, Clone)]
struct EcsPolicy {
    mask4: u8,
    mask6: u8,
    strip_response: bool,
}

/// Sliding window over the outcome of recent primary attempts.
#[derive(Debug)]
pub(crate) struct StatusTracker {
    ring: Vec<bool>, // true = failed
    head: usize,
    filled: usize,
    failed: usize,
    threshold_failures: usize,
}

impl StatusTracker {
    pub(crate) fn new(stat_length: usize, threshold_failures: usize) -> Self {
        Self {
            ring: vec![false; stat_length.max(1)],
            head: 0,
            filled: 0,
            failed: 0,
            threshold_failures: threshold_failures.max(1),
        }
    }

    pub(crate) fn good(&self) -> bool {
        self.failed < self.threshold_failures
    }

    pub(crate) fn update(&mut self, failed: bool) {
        if self.filled == self.ring.len() {
            if self.ring[self.head] {
                self.failed -= 1;
            }
        } else {
            self.filled += 1;
        }
        self.ring[self.head] = failed;
        if failed {
            self.failed += 1;
        }
        self.head = (self.head + 1) % self.ring.len();
    }

    #[cfg(test)]
    pub(crate) fn failed_count(&self) -> usize {
        self.failed
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum PrimaryState {
    Running,
    Success,
    Failed,
}

struct BranchOutcome {
    source: &'static str,
    qctx: QueryContext,
    error: Option<DnsError>,
    responded: bool,
    /// False when the standby secondary returned without ever starting.
    started: bool,
}

pub struct FallbackStage {
    tag: String,
    primary: ExecutableCmdSequence,
    secondary: ExecutableCmdSequence,
    threshold: Duration,
    tracker: Arc<Mutex<StatusTracker>>,
    ecs: Option<EcsPolicy>,
}

#[async_trait]
impl Plugin for FallbackStage {
    fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl Executable for FallbackStage {
    async fn exec(&self, ctx: &CancellationToken, qctx: &mut QueryContext) -> Result<()> {
        let good = self.tracker.lock().expect("tracker poisoned").good();
        if good {
            self.exec_with_threshold(ctx, qctx).await
        } else {
            self.exec_degraded(ctx, qctx).await
        }
    }
}

impl FallbackStage {
    /// Normal mode: primary starts immediately, the secondary arms after
    /// `threshold` (or as soon as the primary reports failure). The first
    /// branch that responds wins; the loser gets a derived cancellation.
    async fn exec_with_threshold(
        &self,
        ctx: &CancellationToken,
        qctx: &mut QueryContext,
    ) -> Result<()> {
        let child = ctx.child_token();
        let (state_tx, state_rx) = watch::channel(PrimaryState::Running);
        let mut join_set = JoinSet::new();

        {
            let mut pctx = qctx.copy_no_response();
            self.apply_ecs(&mut pctx);
            let seq = self.primary.clone();
            let token = child.clone();
            join_set.spawn(async move {
                let outcome = run_branch(seq, token, pctx, "primary").await;
                let _ = state_tx.send(if outcome.responded {
                    PrimaryState::Success
                } else {
                    PrimaryState::Failed
                });
                outcome
            });
        }

        {
            let mut sctx = qctx.copy_no_response();
            self.apply_ecs(&mut sctx);
            let seq = self.secondary.clone();
            let token = child.clone();
            let delay = self.threshold;
            let mut state_rx = state_rx.clone();
            join_set.spawn(async move {
                let sleeper = tokio::time::sleep(delay);
                tokio::pin!(sleeper);
                loop {
                    tokio::select! {
                        _ = &mut sleeper => break,
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            match *state_rx.borrow() {
                                PrimaryState::Running => {}
                                PrimaryState::Success => {
                                    return BranchOutcome {
                                        source: "secondary",
                                        qctx: sctx,
                                        error: None,
                                        responded: false,
                                        started: false,
                                    };
                                }
                                PrimaryState::Failed => break,
                            }
                        }
                        _ = token.cancelled() => {
                            return BranchOutcome {
                                source: "secondary",
                                qctx: sctx,
                                error: None,
                                responded: false,
                                started: false,
                            };
                        }
                    }
                }
                run_branch(seq, token, sctx, "secondary").await
            });
        }

        let mut primary_recorded = false;
        let mut primary_err: Option<DnsError> = None;
        let mut secondary_err: Option<DnsError> = None;
        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(o) => o,
                Err(e) => {
                    secondary_err =
                        Some(DnsError::runtime(format!("fallback branch join error: {}", e)));
                    continue;
                }
            };
            match outcome.source {
                "primary" => {
                    if !primary_recorded {
                        self.record(!outcome.responded);
                        primary_recorded = true;
                    }
                    if outcome.responded {
                        child.cancel();
                        self.adopt_winner(qctx, outcome.qctx);
                        drain_losers(join_set, child);
                        return Ok(());
                    }
                    let mut pctx = outcome.qctx;
                    pctx.exec_defer_discard(&child).await;
                    if let Some(e) = &outcome.error {
                        debug!("fallback '{}' primary failed: {}", self.tag, e);
                    }
                    primary_err = outcome.error;
                }
                _ => {
                    if !outcome.started {
                        continue;
                    }
                    if outcome.responded {
                        // a secondary win still counts against the primary
                        if !primary_recorded {
                            self.record(true);
                            primary_recorded = true;
                        }
                        child.cancel();
                        self.adopt_winner(qctx, outcome.qctx);
                        drain_losers(join_set, child);
                        return Ok(());
                    }
                    let mut sctx = outcome.qctx;
                    sctx.exec_defer_discard(&child).await;
                    if let Some(e) = &outcome.error {
                        debug!("fallback '{}' secondary failed: {}", self.tag, e);
                    }
                    secondary_err = outcome.error;
                }
            }
        }

        // both branches finished without a response; the primary's error wins
        Err(primary_err
            .or(secondary_err)
            .unwrap_or_else(|| self.no_response_error()))
    }

    /// Degraded mode: the secondary answers directly. The primary still runs
    /// as a detached shadow probe feeding the sliding window, so the window
    /// can recover once the primary is healthy again.
    async fn exec_degraded(&self, ctx: &CancellationToken, qctx: &mut QueryContext) -> Result<()> {
        debug!("fallback '{}' degraded, answering from secondary", self.tag);

        {
            let mut pctx = qctx.copy_no_response();
            self.apply_ecs(&mut pctx);
            let seq = self.primary.clone();
            let token = ctx.child_token();
            let tracker = self.tracker.clone();
            tokio::spawn(async move {
                let mut outcome = run_branch(seq, token.clone(), pctx, "primary").await;
                tracker
                    .lock()
                    .expect("tracker poisoned")
                    .update(!outcome.responded);
                outcome.qctx.exec_defer_discard(&token).await;
            });
        }

        let child = ctx.child_token();
        let mut sctx = qctx.copy_no_response();
        self.apply_ecs(&mut sctx);
        let outcome = run_branch(self.secondary.clone(), child.clone(), sctx, "secondary").await;
        if outcome.responded {
            self.adopt_winner(qctx, outcome.qctx);
            return Ok(());
        }
        let mut sctx = outcome.qctx;
        sctx.exec_defer_discard(&child).await;
        Err(outcome.error.unwrap_or_else(|| self.no_response_error()))
    }

    fn record(&self, failed: bool) {
        self.tracker.lock().expect("tracker poisoned").update(failed);
    }

    fn no_response_error(&self) -> DnsError {
        DnsError::plugin(format!(
            "fallback '{}': no response from primary or secondary",
            self.tag
        ))
    }

    fn adopt_winner(&self, qctx: &mut QueryContext, mut branch: QueryContext) {
        if let Some(ecs) = &self.ecs {
            if ecs.strip_response {
                if let Some(response) = branch.response_mut() {
                    strip_client_subnet(response);
                }
            }
        }
        qctx.adopt(branch);
    }

    /// Attach an ECS option derived from the client address to a branch
    /// clone's question. A query that already carries client-subnet data is
    /// forwarded untouched.
    fn apply_ecs(&self, qctx: &mut QueryContext) {
        let Some(policy) = &self.ecs else {
            return;
        };
        let Some(from) = qctx.from() else {
            return;
        };
        if has_client_subnet(qctx.q()) {
            return;
        }
        attach_client_subnet(qctx.question_mut(), from.ip(), policy.mask4, policy.mask6);
    }
}

async fn run_branch(
    seq: ExecutableCmdSequence,
    token: CancellationToken,
    mut qctx: QueryContext,
    source: &'static str,
) -> BranchOutcome {
    match walk(&token, &mut qctx, &seq).await {
        Ok(()) => {
            let responded = qctx.status() == ContextStatus::Responded;
            let error = if responded {
                None
            } else {
                Some(DnsError::plugin(format!(
                    "{} finished without response (status {})",
                    source,
                    qctx.status()
                )))
            };
            BranchOutcome {
                source,
                qctx,
                error,
                responded,
                started: true,
            }
        }
        Err(e) => BranchOutcome {
            source,
            qctx,
            error: Some(e),
            responded: false,
            started: true,
        },
    }
}

/// Finish the losing branch off the query path.
fn drain_losers(mut join_set: JoinSet<BranchOutcome>, token: CancellationToken) {
    if join_set.is_empty() {
        return;
    }
    tokio::spawn(async move {
        while let Some(joined) = join_set.join_next().await {
            let Ok(mut outcome) = joined else {
                continue;
            };
            if !outcome.started {
                continue;
            }
            if let Some(e) = outcome.error {
                debug!("fallback losing branch {} failed: {}", outcome.source, e);
            }
            outcome.qctx.exec_defer_discard(&token).await;
        }
    });
}

fn has_client_subnet(msg: &Message) -> bool {
    msg.extensions()
        .as_ref()
        .is_some_and(|edns| edns.options().get(EdnsCode::Subnet).is_some())
}

fn attach_client_subnet(msg: &mut Message, ip: IpAddr, mask4: u8, mask6: u8) {
    let (family, prefix, addr_bytes): (u16, u8, Vec<u8>) = match ip {
        IpAddr::V4(v4) => {
            let masked = mask_v4(v4, mask4);
            let len = (mask4 as usize + 7) / 8;
            (1, mask4, masked.octets()[..len].to_vec())
        }
        IpAddr::V6(v6) => {
            let masked = mask_v6(v6, mask6);
            let len = (mask6 as usize + 7) / 8;
            (2, mask6, masked.octets()[..len].to_vec())
        }
    };

    let mut payload = Vec::with_capacity(4 + addr_bytes.len());
    payload.extend_from_slice(&family.to_be_bytes());
    payload.push(prefix);
    payload.push(0); // scope prefix, always 0 on queries
    payload.extend_from_slice(&addr_bytes);

    let edns = msg.extensions_mut().get_or_insert_with(Edns::new);
    edns.options_mut()
        .insert(EdnsOption::Unknown(u16::from(EdnsCode::Subnet), payload));
}

fn strip_client_subnet(msg: &mut Message) {
    if let Some(edns) = msg.extensions_mut().as_mut() {
        edns.options_mut().remove(EdnsCode::Subnet);
    }
}

fn mask_v4(ip: Ipv4Addr, mask: u8) -> Ipv4Addr {
    if mask == 0 {
        return Ipv4Addr::UNSPECIFIED;
    }
    let raw = u32::from(ip);
    let mask_bits = if mask >= 32 {
        u32::MAX
    } else {
        (!0u32) << (32 - mask)
    };
    Ipv4Addr::from(raw & mask_bits)
}

fn mask_v6(ip: Ipv6Addr, mask: u8) -> Ipv6Addr {
    let raw = u128::from_be_bytes(ip.octets());
    let mask_bits = if mask >= 128 {
        u128::MAX
    } else if mask == 0 {
        0
    } else {
        (!0u128) << (128 - mask)
    };
    Ipv6Addr::from((raw & mask_bits).to_be_bytes())
}

#[derive(Debug, Clone)]
pub struct FallbackFactory;

impl PluginFactory for FallbackFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let cfg = parse_config(plugin_config)?;
        if cfg.primary.is_empty() || cfg.secondary.is_empty() {
            return Err(DnsError::plugin(
                "fallback requires non-empty 'primary' and 'secondary'",
            ));
        }
        if let Some(ecs) = &cfg.ecs {
            if ecs.mask4.unwrap_or(DEFAULT_ECS_MASK4) > 32 {
                return Err(DnsError::plugin("fallback ecs mask4 must be in range 0..=32"));
            }
            if ecs.mask6.unwrap_or(DEFAULT_ECS_MASK6) > 128 {
                return Err(DnsError::plugin("fallback ecs mask6 must be in range 0..=128"));
            }
        }
        Ok(())
    }

    fn get_dependencies(&self, plugin_config: &PluginConfig) -> Vec<String> {
        let mut deps = Vec::new();
        if let Ok(cfg) = parse_config(plugin_config) {
            collect_cmd_dependencies(&cfg.primary, &mut deps);
            collect_cmd_dependencies(&cfg.secondary, &mut deps);
        }
        deps
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let cfg = parse_config(plugin_config)?;
        self.validate_config(plugin_config)?;

        let primary = build_cmd_sequence(&cfg.primary, &registry)?;
        let secondary = build_cmd_sequence(&cfg.secondary, &registry)?;

        let stat_length = cfg.stat_length.unwrap_or(DEFAULT_STAT_LENGTH).max(1);
        let threshold_failures = cfg
            .threshold_failures
            .unwrap_or_else(|| (stat_length / 2).max(1));
        let ecs = cfg.ecs.map(|e| EcsPolicy {
            mask4: e.mask4.unwrap_or(DEFAULT_ECS_MASK4),
            mask6: e.mask6.unwrap_or(DEFAULT_ECS_MASK6),
            strip_response: e.strip_response,
        });

        Ok(UninitializedPlugin::Executable(Box::new(FallbackStage {
            tag: plugin_config.tag.clone(),
            primary,
            secondary,
            threshold: Duration::from_millis(
                cfg.threshold_ms.unwrap_or(DEFAULT_THRESHOLD_MS).max(1),
            ),
            tracker: Arc::new(Mutex::new(StatusTracker::new(
                stat_length,
                threshold_failures,
            ))),
            ecs,
        })))
    }
}

fn parse_config(plugin_config: &PluginConfig) -> Result<FallbackConfig> {
    serde_yml::from_value(
        plugin_config
            .args
            .clone()
            .ok_or_else(|| DnsError::plugin("fallback requires args"))?,
    )
    .map_err(|e| DnsError::plugin(format!("failed to parse fallback config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dns_utils::build_response_from_request;
    use crate::plugin::executor::sequence::{ExecutableCmd, StageBinding};
    use hickory_proto::op::{Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    fn make_context() -> QueryContext {
        let mut request = Message::new();
        request.set_id(31);
        request.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
        QueryContext::new(request, Some("192.0.2.10:3353".parse().unwrap()))
    }

    struct TestUpstream {
        name: &'static str,
        addr: Ipv4Addr,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for TestUpstream {
        fn tag(&self) -> &str {
            self.name
        }
    }

    #[async_trait]
    impl Executable for TestUpstream {
        async fn exec(&self, ctx: &CancellationToken, qctx: &mut QueryContext) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = ctx.cancelled() => return Err("upstream cancelled".into()),
                }
            }
            if self.fail {
                return Err(format!("{} unreachable", self.name).into());
            }
            let mut response = build_response_from_request(qctx.q(), ResponseCode::NoError);
            let name = qctx.q().queries()[0].name().clone();
            response
                .answers_mut()
                .push(Record::from_rdata(name, 60, RData::A(A(self.addr))));
            qctx.set_response(Some(response), ContextStatus::Responded);
            Ok(())
        }
    }

    fn upstream_seq(
        name: &'static str,
        addr: Ipv4Addr,
        delay: Duration,
        fail: bool,
    ) -> ExecutableCmdSequence {
        ExecutableCmdSequence::from_cmds(vec![ExecutableCmd::Stage {
            tag: name.to_string(),
            binding: StageBinding::Exec(Arc::new(TestUpstream {
                name,
                addr,
                delay,
                fail,
            })),
            pipeline_root: false,
        }])
    }

    fn stage(
        primary: ExecutableCmdSequence,
        secondary: ExecutableCmdSequence,
        threshold: Duration,
    ) -> FallbackStage {
        FallbackStage {
            tag: "fallback".to_string(),
            primary,
            secondary,
            threshold,
            tracker: Arc::new(Mutex::new(StatusTracker::new(10, 5))),
            ecs: None,
        }
    }

    fn answered_ip(qctx: &QueryContext) -> Ipv4Addr {
        match qctx.r().unwrap().answers()[0].data() {
            RData::A(v) => v.0,
            other => panic!("unexpected rdata {:?}", other),
        }
    }

    #[test]
    fn tracker_window_slides_and_recovers() {
        let mut t = StatusTracker::new(4, 2);
        assert!(t.good());
        t.update(true);
        t.update(true);
        assert!(!t.good());
        // two failures slide out of the window
        for _ in 0..4 {
            t.update(false);
        }
        assert!(t.good());
        assert_eq!(t.failed_count(), 0);
    }

    #[tokio::test]
    async fn fast_primary_wins_and_records_success() {
        let f = stage(
            upstream_seq("primary", Ipv4Addr::new(10, 0, 0, 1), Duration::ZERO, false),
            upstream_seq("secondary", Ipv4Addr::new(10, 0, 0, 2), Duration::ZERO, false),
            Duration::from_millis(100),
        );
        let mut qctx = make_context();
        f.exec(&CancellationToken::new(), &mut qctx).await.unwrap();
        assert_eq!(answered_ip(&qctx), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(f.tracker.lock().unwrap().failed_count(), 0);
    }

    #[tokio::test]
    async fn slow_primary_loses_to_secondary_after_threshold() {
        let f = stage(
            upstream_seq(
                "primary",
                Ipv4Addr::new(10, 0, 0, 1),
                Duration::from_millis(500),
                false,
            ),
            upstream_seq(
                "secondary",
                Ipv4Addr::new(10, 0, 0, 2),
                Duration::from_millis(50),
                false,
            ),
            Duration::from_millis(100),
        );
        let mut qctx = make_context();
        let started = std::time::Instant::now();
        f.exec(&CancellationToken::new(), &mut qctx).await.unwrap();

        // secondary's answer, well before the primary would have finished
        assert_eq!(answered_ip(&qctx), Ipv4Addr::new(10, 0, 0, 2));
        assert!(started.elapsed() < Duration::from_millis(400));
        // the secondary win counted as a primary failure
        assert_eq!(f.tracker.lock().unwrap().failed_count(), 1);
    }

    #[tokio::test]
    async fn failing_primary_starts_secondary_before_threshold() {
        let f = stage(
            upstream_seq("primary", Ipv4Addr::new(10, 0, 0, 1), Duration::ZERO, true),
            upstream_seq(
                "secondary",
                Ipv4Addr::new(10, 0, 0, 2),
                Duration::from_millis(10),
                false,
            ),
            Duration::from_secs(5),
        );
        let mut qctx = make_context();
        let started = std::time::Instant::now();
        f.exec(&CancellationToken::new(), &mut qctx).await.unwrap();
        assert_eq!(answered_ip(&qctx), Ipv4Addr::new(10, 0, 0, 2));
        // nowhere near the 5s threshold: failure armed the secondary early
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(f.tracker.lock().unwrap().failed_count(), 1);
    }

    #[tokio::test]
    async fn both_failing_surfaces_primary_error() {
        let f = stage(
            upstream_seq("primary", Ipv4Addr::new(10, 0, 0, 1), Duration::ZERO, true),
            upstream_seq("secondary", Ipv4Addr::new(10, 0, 0, 2), Duration::ZERO, true),
            Duration::from_millis(20),
        );
        let mut qctx = make_context();
        let err = f.exec(&CancellationToken::new(), &mut qctx).await.unwrap_err();
        assert!(err.to_string().contains("primary unreachable"));
        assert_eq!(qctx.status(), ContextStatus::Unhandled);
    }

    #[tokio::test]
    async fn degraded_mode_answers_from_secondary_and_probe_recovers() {
        let f = stage(
            upstream_seq("primary", Ipv4Addr::new(10, 0, 0, 1), Duration::ZERO, false),
            upstream_seq("secondary", Ipv4Addr::new(10, 0, 0, 2), Duration::ZERO, false),
            Duration::from_millis(100),
        );
        {
            let mut tracker = f.tracker.lock().unwrap();
            for _ in 0..5 {
                tracker.update(true);
            }
            assert!(!tracker.good());
        }

        let mut qctx = make_context();
        f.exec(&CancellationToken::new(), &mut qctx).await.unwrap();
        assert_eq!(answered_ip(&qctx), Ipv4Addr::new(10, 0, 0, 2));

        // shadow probes feed the window until the primary looks healthy again
        for _ in 0..20 {
            if f.tracker.lock().unwrap().good() {
                break;
            }
            let mut qctx = make_context();
            let _ = f.exec(&CancellationToken::new(), &mut qctx).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(f.tracker.lock().unwrap().good());
    }

    #[tokio::test]
    async fn ecs_is_attached_to_branch_clones_only() {
        let mut f = stage(
            upstream_seq("primary", Ipv4Addr::new(10, 0, 0, 1), Duration::ZERO, false),
            upstream_seq("secondary", Ipv4Addr::new(10, 0, 0, 2), Duration::ZERO, false),
            Duration::from_millis(100),
        );
        f.ecs = Some(EcsPolicy {
            mask4: 24,
            mask6: 48,
            strip_response: false,
        });

        let mut qctx = make_context();
        let mut branch = qctx.copy_no_response();
        f.apply_ecs(&mut branch);
        assert!(has_client_subnet(branch.q()));
        assert!(!has_client_subnet(qctx.q()));

        // an already-present ECS option is left untouched
        let before = branch.q().clone();
        f.apply_ecs(&mut branch);
        assert_eq!(format!("{:?}", branch.q()), format!("{:?}", before));

        f.exec(&CancellationToken::new(), &mut qctx).await.unwrap();
        assert!(!has_client_subnet(qctx.q()));
    }

    #[test]
    fn ecs_payload_masks_the_client_address() {
        let mut msg = Message::new();
        attach_client_subnet(&mut msg, "192.0.2.55".parse().unwrap(), 24, 48);
        let edns = msg.extensions().as_ref().unwrap();
        match edns.options().get(EdnsCode::Subnet) {
            Some(EdnsOption::Unknown(code, payload)) => {
                assert_eq!(*code, u16::from(EdnsCode::Subnet));
                // family=1, prefix=24, scope=0, 3 address bytes with host bits cleared
                assert_eq!(payload.as_slice(), &[0, 1, 24, 0, 192, 0, 2]);
            }
            other => panic!("unexpected option {:?}", other),
        }
    }
}
