//! End-to-end tests for the invocation pipeline.
//!
//! Each test wires an in-memory registry of `jira` and `github` tools, an
//! inline policy and a [`MemoryAuditSink`], then drives [`Gateway::invoke`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Value};
use toolgate_core::{
    hash_input, CircuitBreaker, CircuitBreakerConfig, CircuitState, IdempotencyOptions, RateLimitStrategy,
    ResilienceGuard, RetryConfig, RetryHandler,
};
use toolgate_core::resilience::TokenBucketConfig;
use toolgate_gateway::{
    AuditAction, AuditEntry, AuditError, AuditSink, ErrorCode, ExecutionFailure, FnTool, Gateway,
    GatewayBuilder, GatewayConfig, InvocationError, InvocationRequest, MemoryAuditSink,
    MemoryConnector, MemoryToolRegistry, ResultStore, SchemaStage, ToolError,
};
use toolgate_policy::{Approval, ApprovalScope, PolicyClass, PolicyEngine, ReasonCode};

// ─── Fixtures ─────────────────────────────────────────────────────────────────

const POLICY: &str = r#"
rules:
  - id: jira-writes
    effect: allow
    priority: 10
    conditions:
      connectors: [jira]
      policyClasses: [WRITE_NON_DESTRUCTIVE]
  - id: github-merges
    effect: allow
    priority: 10
    conditions:
      toolNames: ["github.*"]
      policyClasses: [DESTRUCTIVE]
"#;

/// Behaviour of `jira.create_issue`, switched on the requested title.
///
/// - `"boom"`: permanent failure
/// - `"flaky"`: transient failure for the first two calls
/// - `"slow"`: completes after one second
/// - anything else: returns a new issue key
fn create_issue(calls: Arc<AtomicU32>) -> FnTool {
    FnTool::new(
        PolicyClass::WriteNonDestructive,
        json!({
            "type": "object",
            "required": ["title"],
            "properties": { "title": { "type": "string", "minLength": 1 } }
        }),
        json!({
            "type": "object",
            "required": ["key"],
            "properties": { "key": { "type": "string" } }
        }),
        move |_ctx, input| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                match input["title"].as_str() {
                    Some("boom") => Err(ToolError::permanent("project is archived")),
                    Some("flaky") if n <= 2 => Err(ToolError::http(503, "jira unavailable")),
                    Some("slow") => {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok(json!({ "key": "ACME-SLOW" }))
                    }
                    _ => Ok(json!({ "key": format!("ACME-{n}") })),
                }
            }
            .boxed()
        },
    )
}

struct Harness {
    gateway: Gateway,
    audit: Arc<MemoryAuditSink>,
    issues_created: Arc<AtomicU32>,
}

fn builder() -> (GatewayBuilder, Arc<MemoryAuditSink>, Arc<AtomicU32>) {
    let issues_created = Arc::new(AtomicU32::new(0));

    let jira = MemoryConnector::new("jira")
        .with_tool(
            "search",
            FnTool::new(
                PolicyClass::Read,
                json!({
                    "type": "object",
                    "required": ["query"],
                    "properties": { "query": { "type": "string" } }
                }),
                json!({ "type": "object", "required": ["issues"] }),
                |_ctx, input| {
                    async move { Ok(json!({ "issues": [{ "key": "ACME-1", "query": input["query"] }] })) }
                        .boxed()
                },
            ),
        )
        .with_tool("create_issue", create_issue(issues_created.clone()));

    let github = MemoryConnector::new("github")
        .with_tool(
            "create_branch",
            FnTool::new(
                PolicyClass::WriteNonDestructive,
                json!({}),
                json!({}),
                |_ctx, _input| async { Ok(json!({ "ref": "refs/heads/feature" })) }.boxed(),
            ),
        )
        .with_tool(
            "merge_pull_request",
            FnTool::new(
                PolicyClass::Destructive,
                json!({ "type": "object", "required": ["number"] }),
                json!({ "type": "object", "required": ["merged"] }),
                |ctx, _input| {
                    async move { Ok(json!({ "merged": true, "by": ctx.actor })) }.boxed()
                },
            ),
        )
        .with_tool(
            "get_repo",
            FnTool::new(
                PolicyClass::Read,
                json!({}),
                json!({ "type": "object", "required": ["fullName"] }),
                |_ctx, _input| async { Ok(json!({ "name": "widgets" })) }.boxed(),
            ),
        );

    let registry = Arc::new(MemoryToolRegistry::new());
    registry.register(jira);
    registry.register(github);

    let policy = Arc::new(PolicyEngine::from_yaml_str(POLICY).unwrap());
    let audit = Arc::new(MemoryAuditSink::new());
    let builder = Gateway::builder(registry, policy).audit_sink(audit.clone());
    (builder, audit, issues_created)
}

impl Harness {
    /// Audit entries for `run_id` once queued deliveries have landed.
    async fn entries(&self, run_id: &str) -> Vec<AuditEntry> {
        self.gateway.flush_audit().await;
        self.audit.entries(run_id)
    }

    async fn actions(&self, run_id: &str) -> Vec<AuditAction> {
        self.gateway.flush_audit().await;
        self.audit.actions(run_id)
    }
}

fn harness() -> Harness {
    harness_with(|b| b)
}

fn harness_with(configure: impl FnOnce(GatewayBuilder) -> GatewayBuilder) -> Harness {
    let (builder, audit, issues_created) = builder();
    Harness {
        gateway: configure(builder).build(),
        audit,
        issues_created,
    }
}

fn with_results(builder: GatewayBuilder) -> GatewayBuilder {
    builder.idempotency(Arc::new(ResultStore::new()), IdempotencyOptions::default())
}

fn request(tool: &str, input: Value) -> InvocationRequest {
    InvocationRequest::new("run-1", "acme", tool, input)
        .with_actor("agent-7")
        .with_source("orchestrator")
}

fn issue(title: &str) -> InvocationRequest {
    request("jira.create_issue", json!({ "title": title }))
}

struct FailingSink;

#[async_trait]
impl AuditSink for FailingSink {
    async fn append(&self, _run_id: &str, _entry: &AuditEntry) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("disk full".into()))
    }
}

struct StalledSink;

#[async_trait]
impl AuditSink for StalledSink {
    async fn append(&self, _run_id: &str, _entry: &AuditEntry) -> Result<(), AuditError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

// ─── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn read_tool_succeeds_with_full_audit_trail() {
    let h = harness();
    let input = json!({ "query": "status = open" });
    let result = h.gateway.invoke(request("jira.search", input.clone())).await;

    assert!(result.success(), "{:?}", result.output);
    assert_eq!(result.output.as_ref().unwrap()["issues"][0]["key"], "ACME-1");
    assert!(!result.cached);
    assert_eq!(result.input_hash, hash_input(&input));
    assert_eq!(result.input_hash.len(), 16);

    let entries = h.entries("run-1").await;
    let actions: Vec<_> = entries.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        [AuditAction::Requested, AuditAction::PolicyChecked, AuditAction::Succeeded]
    );
    let ids: Vec<_> = entries.iter().map(|e| e.id).collect();
    assert_eq!(result.audit_event_ids, ids);
    assert!(entries.iter().all(|e| e.actor == "agent-7"));
    assert_eq!(entries[0].details["inputHash"], result.input_hash.as_str());
    assert_eq!(entries[1].details["reasonCode"], "ALLOW_READ_DEFAULT");
}

#[tokio::test]
async fn result_serializes_to_wire_form() {
    let h = harness();
    let result = h.gateway.invoke(request("jira.search", json!({ "query": "x" }))).await;
    let wire = result.to_json();
    assert_eq!(wire["success"], true);
    assert_eq!(wire["auditEventIds"].as_array().unwrap().len(), 3);
    assert!(wire["output"]["issues"].is_array());
    assert!(wire.get("error").is_none());
}

// ─── Resolution ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_connector_is_reported_without_audit() {
    let h = harness();
    let result = h.gateway.invoke(request("slack.post_message", json!({}))).await;
    assert_eq!(result.error_code(), Some(ErrorCode::ConnectorNotFound));
    assert!(result.audit_event_ids.is_empty());
    h.gateway.flush_audit().await;
    assert!(h.audit.is_empty());
}

#[tokio::test]
async fn malformed_or_unknown_tool_names() {
    let h = harness();
    for name in ["jira", "jira.", ".search", "jira.delete_project"] {
        let result = h.gateway.invoke(request(name, json!({}))).await;
        assert_eq!(result.error_code(), Some(ErrorCode::ToolNotFound), "{name}");
    }
    h.gateway.flush_audit().await;
    assert!(h.audit.is_empty());
}

// ─── Validation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn invalid_input_is_rejected_before_policy() {
    let h = harness();
    let result = h.gateway.invoke(issue("")).await;

    match &result.output {
        Err(InvocationError::Validation { stage, errors }) => {
            assert_eq!(*stage, SchemaStage::Input);
            assert!(!errors.is_empty());
        }
        other => panic!("expected input validation error, got {other:?}"),
    }
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 0);
    assert_eq!(h.actions("run-1").await, [AuditAction::Requested, AuditAction::Failed]);
    assert_eq!(h.entries("run-1").await[1].details["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn output_contract_violation_is_a_validation_error() {
    let h = harness();
    let result = h.gateway.invoke(request("github.get_repo", json!({}))).await;
    assert!(matches!(
        result.output,
        Err(InvocationError::Validation { stage: SchemaStage::Output, .. })
    ));
    assert_eq!(
        h.actions("run-1").await,
        [AuditAction::Requested, AuditAction::PolicyChecked, AuditAction::Failed]
    );
}

// ─── Policy ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn write_without_rule_is_denied_by_default() {
    let h = harness();
    let result = h.gateway.invoke(request("github.create_branch", json!({}))).await;

    match &result.output {
        Err(InvocationError::PolicyDenied { reason_code, .. }) => {
            assert_eq!(*reason_code, ReasonCode::DenyWriteDefault);
        }
        other => panic!("expected policy denial, got {other:?}"),
    }
    assert_eq!(
        h.actions("run-1").await,
        [AuditAction::Requested, AuditAction::PolicyChecked]
    );
    assert_eq!(h.entries("run-1").await[1].details["allowed"], false);

    let wire = result.to_json();
    assert_eq!(wire["error"]["code"], "POLICY_DENIED");
    assert_eq!(wire["error"]["reasonCode"], "DENY_WRITE_DEFAULT");
}

#[tokio::test]
async fn destructive_tool_requires_matching_approval() {
    let h = harness();
    let merge = || request("github.merge_pull_request", json!({ "number": 42 }));

    let result = h.gateway.invoke(merge()).await;
    assert!(matches!(
        result.output,
        Err(InvocationError::PolicyDenied { reason_code: ReasonCode::DenyDestructiveNoApproval, .. })
    ));

    let stale = Approval {
        run_id: "run-0".into(),
        scope: vec![ApprovalScope::Merge],
    };
    let result = h.gateway.invoke(merge().with_approval(stale)).await;
    assert!(matches!(
        result.output,
        Err(InvocationError::PolicyDenied { reason_code: ReasonCode::DenyApprovalMismatch, .. })
    ));

    let wrong_scope = Approval {
        run_id: "run-1".into(),
        scope: vec![ApprovalScope::Push],
    };
    let result = h.gateway.invoke(merge().with_approval(wrong_scope)).await;
    assert_eq!(result.error_code(), Some(ErrorCode::PolicyDenied));

    let approved = Approval {
        run_id: "run-1".into(),
        scope: vec![ApprovalScope::Merge],
    };
    let result = h.gateway.invoke(merge().with_approval(approved)).await;
    assert!(result.success(), "{:?}", result.output);
    assert_eq!(result.output.unwrap()["by"], "agent-7");
}

// ─── Execution ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handler_error_is_audited_as_failed() {
    let h = harness();
    let result = h.gateway.invoke(issue("boom")).await;

    assert_eq!(result.error_code(), Some(ErrorCode::ExecutionError));
    let err = result.output.as_ref().unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("project is archived"));
    assert_eq!(
        h.actions("run-1").await,
        [AuditAction::Requested, AuditAction::PolicyChecked, AuditAction::Failed]
    );
    assert_eq!(h.entries("run-1").await[2].details["code"], "EXECUTION_ERROR");
}

#[tokio::test]
async fn without_guard_nothing_is_retried() {
    let h = harness();
    let result = h.gateway.invoke(issue("flaky")).await;
    assert_eq!(result.error_code(), Some(ErrorCode::ExecutionError));
    assert!(result.output.unwrap_err().is_retryable());
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 1);
}

// ─── Audit failures ───────────────────────────────────────────────────────────

#[tokio::test]
async fn failing_audit_sink_does_not_change_outcome() {
    let h = harness_with(|b| b.audit_sink(Arc::new(FailingSink)));
    let result = h.gateway.invoke(issue("Login broken")).await;
    assert!(result.success());
    assert_eq!(result.audit_event_ids.len(), 3);
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_audit_sink_never_delays_the_call() {
    let h = harness_with(|b| b.audit_sink(Arc::new(StalledSink)));
    let start = tokio::time::Instant::now();

    let failed = h.gateway.invoke(issue("boom")).await;
    let succeeded = h.gateway.invoke(issue("Login broken")).await;

    assert!(start.elapsed().is_zero());
    assert_eq!(failed.error_code(), Some(ErrorCode::ExecutionError));
    assert!(succeeded.success());
    assert_eq!(failed.audit_event_ids.len(), 3);
    assert_eq!(succeeded.audit_event_ids.len(), 3);
}

// ─── Idempotency ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn repeated_step_replays_cached_output() {
    let h = harness_with(with_results);

    let first = h.gateway.invoke(issue("Login broken").with_step("file-bug")).await;
    let second = h.gateway.invoke(issue("Login broken").with_step("file-bug")).await;

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.output, second.output);
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 1);

    let entries = h.entries("run-1").await;
    assert_eq!(entries.len(), 6);
    assert_eq!(entries[5].details["cached"], true);

    // different input under the same step is a different operation
    let other = h.gateway.invoke(issue("Signup broken").with_step("file-bug")).await;
    assert!(!other.cached);
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn requests_without_step_are_not_deduplicated() {
    let h = harness_with(with_results);
    h.gateway.invoke(issue("Login broken")).await;
    h.gateway.invoke(issue("Login broken")).await;
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 2);
    assert!(h.gateway.result_store().unwrap().is_empty());
}

#[tokio::test]
async fn separator_in_run_or_step_id_does_not_share_a_record() {
    let h = harness_with(with_results);
    let input = json!({ "title": "Login broken" });

    let a = h
        .gateway
        .invoke(InvocationRequest::new("run:a", "acme", "jira.create_issue", input.clone()).with_step("s"))
        .await;
    let b = h
        .gateway
        .invoke(InvocationRequest::new("run", "acme", "jira.create_issue", input).with_step("a:s"))
        .await;

    assert!(a.success() && b.success());
    assert!(!a.cached);
    assert!(!b.cached);
    assert_ne!(a.output, b.output);
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 2);
    assert_eq!(h.gateway.result_store().unwrap().len(), 2);
}

#[tokio::test]
async fn cached_failure_is_replayed() {
    let h = harness_with(with_results);

    let first = h.gateway.invoke(issue("boom").with_step("s1")).await;
    let second = h.gateway.invoke(issue("boom").with_step("s1")).await;

    assert_eq!(first.error_code(), Some(ErrorCode::ExecutionError));
    assert_eq!(second.error_code(), Some(ErrorCode::ExecutionError));
    assert!(second.cached);
    assert_eq!(first.output, second.output);
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_duplicate_reports_in_progress() {
    let h = harness_with(with_results);

    let (a, b) = tokio::join!(
        h.gateway.invoke(issue("slow").with_step("s1")),
        h.gateway.invoke(issue("slow").with_step("s1")),
    );

    let outcomes = [&a, &b];
    assert_eq!(outcomes.iter().filter(|r| r.success()).count(), 1);
    assert!(outcomes.iter().any(|r| matches!(
        r.output,
        Err(InvocationError::Execution(ExecutionFailure::InProgress { .. }))
    )));
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 1);

    // once the first call has completed, a retry replays its result
    let c = h.gateway.invoke(issue("slow").with_step("s1")).await;
    assert!(c.cached);
}

#[tokio::test(start_paused = true)]
async fn allow_pending_reports_duplicate_as_in_flight() {
    let options = IdempotencyOptions {
        allow_pending: true,
        ..IdempotencyOptions::default()
    };
    let h = harness_with(|b| b.idempotency(Arc::new(ResultStore::new()), options));

    let (a, b) = tokio::join!(
        h.gateway.invoke(issue("slow").with_step("s1")),
        h.gateway.invoke(issue("slow").with_step("s1")),
    );

    assert!(a.success() && b.success());
    let (done, pending) = if a.in_flight { (&b, &a) } else { (&a, &b) };
    assert!(!done.in_flight);
    assert_eq!(done.output.as_ref().unwrap()["key"], "ACME-SLOW");
    assert!(pending.cached);
    assert_eq!(pending.output.as_ref().unwrap(), &Value::Null);
    assert_eq!(pending.to_json()["inFlight"], true);
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn configured_sweeper_purges_expired_results() {
    let config =
        GatewayConfig::from_yaml_str("idempotency: { ttlMs: 10000, sweepIntervalMs: 5000 }").unwrap();
    let h = harness_with(|b| b.with_config(&config));

    h.gateway.invoke(issue("Login broken").with_step("s1")).await;
    let store = h.gateway.result_store().unwrap().clone();
    assert_eq!(store.len(), 1);

    tokio::time::sleep(Duration::from_secs(16)).await;
    assert!(store.is_empty());
}

// ─── Resilience ───────────────────────────────────────────────────────────────

fn guard(retry: RetryConfig, breaker: CircuitBreakerConfig) -> ResilienceGuard {
    ResilienceGuard::new(CircuitBreaker::new(breaker), Arc::new(RetryHandler::new(retry)))
}

fn quick_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        backoff_multiplier: 2.0,
        max_jitter: Duration::ZERO,
    }
}

#[tokio::test(start_paused = true)]
async fn guard_retries_transient_failures() {
    let h = harness_with(|b| b.resilience(guard(quick_retry(3), CircuitBreakerConfig::default())));

    let result = h.gateway.invoke(issue("flaky")).await;

    assert!(result.success(), "{:?}", result.output);
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 3);
    assert_eq!(
        h.actions("run-1").await,
        [AuditAction::Requested, AuditAction::PolicyChecked, AuditAction::Succeeded]
    );
}

#[tokio::test(start_paused = true)]
async fn open_circuit_fails_fast_with_next_attempt() {
    let breaker = CircuitBreakerConfig {
        minimum_requests: 2,
        reset_timeout: Duration::from_secs(30),
        ..CircuitBreakerConfig::default()
    };
    let h = harness_with(|b| b.resilience(guard(quick_retry(1), breaker)));

    for _ in 0..2 {
        let result = h.gateway.invoke(issue("boom")).await;
        assert!(matches!(
            result.output,
            Err(InvocationError::Execution(ExecutionFailure::Tool(_)))
        ));
    }

    let result = h.gateway.invoke(issue("boom")).await;
    let err = result.output.as_ref().unwrap_err();
    assert!(matches!(err, InvocationError::Execution(ExecutionFailure::CircuitOpen(_))));
    assert_eq!(err.code(), ErrorCode::ExecutionError);
    assert!(err.retry_after().is_some());
    assert!(err.next_attempt_at().is_some());
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 2);

    let entries = h.entries("run-1").await;
    let failed = &entries[8];
    assert_eq!(failed.action, AuditAction::Failed);
    assert!(failed.details["nextAttemptAt"].is_string());
    assert!(failed.details["retryAfterMs"].as_u64().unwrap() > 0);

    // circuits are per connector
    let breaker = h.gateway.resilience().unwrap().breaker();
    assert_eq!(breaker.state("jira"), CircuitState::Open);
    assert_eq!(breaker.state("github"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_call_is_not_cached() {
    let limiter = RateLimitStrategy::TokenBucket(TokenBucketConfig {
        max_tokens: 1,
        refill_rate: 1,
        refill_interval: Duration::from_secs(1),
        tokens_per_request: 1,
    })
    .build();
    let h = harness_with(|b| {
        with_results(
            b.resilience(
                guard(quick_retry(3), CircuitBreakerConfig::default()).with_rate_limiter(limiter),
            ),
        )
    });

    let first = h.gateway.invoke(issue("Login broken").with_step("s1")).await;
    assert!(first.success());

    let limited = h.gateway.invoke(issue("Signup broken").with_step("s2")).await;
    let err = limited.output.as_ref().unwrap_err();
    assert!(matches!(err, InvocationError::Execution(ExecutionFailure::RateLimited(_))));
    assert!(err.retry_after().unwrap() > Duration::ZERO);
    assert!(limited.to_json()["error"]["retryAfterMs"].is_u64());
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 1);
    assert_eq!(h.gateway.result_store().unwrap().len(), 1);

    tokio::time::advance(Duration::from_secs(1)).await;

    let retried = h.gateway.invoke(issue("Signup broken").with_step("s2")).await;
    assert!(retried.success(), "{:?}", retried.output);
    assert!(!retried.cached);
    assert_eq!(h.issues_created.load(Ordering::SeqCst), 2);
}

// ─── Configuration ────────────────────────────────────────────────────────────

#[tokio::test]
async fn gateway_from_config_file() {
    let mut path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("../../fixtures/config/gateway.yaml");
    let config = GatewayConfig::load(&path).unwrap();

    let policy_path = config.policy_path.clone().unwrap();
    let policy = Arc::new(PolicyEngine::load(policy_path).unwrap());
    let registry = Arc::new(MemoryToolRegistry::new());
    let issues_created = Arc::new(AtomicU32::new(0));
    registry.register(
        MemoryConnector::new("jira").with_tool("create_issue", create_issue(issues_created.clone())),
    );
    let audit = Arc::new(MemoryAuditSink::new());

    let gateway = Gateway::builder(registry, policy)
        .audit_sink(audit.clone())
        .with_config(&config)
        .build();

    assert!(gateway.resilience().is_some());
    assert!(gateway.result_store().is_some());

    // github-workflow.yaml only admits jira.add_comment for the jira connector
    let denied = gateway.invoke(issue("Login broken")).await;
    assert!(matches!(
        denied.output,
        Err(InvocationError::PolicyDenied { reason_code: ReasonCode::DenyWriteDefault, .. })
    ));
    assert_eq!(issues_created.load(Ordering::SeqCst), 0);
    gateway.flush_audit().await;
    assert_eq!(audit.len(), 2);
}
