//! The invocation pipeline.
//!
//! ```text
//! resolve → audit(requested) → validate input → policy → audit(policy_checked)
//!         → execute [idempotency → breaker → retry → rate limit → tool]
//!         → validate output → audit(succeeded)
//! ```
//!
//! Any failure after resolution is audited as `failed` (policy denials are
//! recorded by the `policy_checked` entry). Nothing is retried here except
//! through the optional [`ResilienceGuard`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use toolgate_core::{
    hash_input, IdempotencyError, IdempotencyKey, IdempotencyOptions, IdempotencyStore, Idempotent,
    ResilienceGuard,
};
use toolgate_policy::{Approval, PolicyClass, PolicyEngine, PolicyRequest};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditDispatcher, AuditEntry, AuditSink, TracingAuditSink};
use crate::config::GatewayConfig;
use crate::error::{ErrorCode, ExecutionFailure, InvocationError, SchemaStage};
use crate::registry::{Tool, ToolContext, ToolRegistry};
use crate::schema::SchemaCache;

/// Ledger of tool outputs keyed by run, step, tool and input hash.
pub type ResultStore = IdempotencyStore<Value, ExecutionFailure>;

const DEFAULT_AUDIT_TIMEOUT: Duration = Duration::from_secs(2);
const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub run_id: String,
    pub tenant_id: String,
    /// `connector.tool`
    pub tool_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Approval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Enables idempotent execution when the gateway has a result store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl InvocationRequest {
    pub fn new(
        run_id: impl Into<String>,
        tenant_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            tenant_id: tenant_id.into(),
            tool_name: tool_name.into(),
            input,
            approval: None,
            actor: None,
            source: None,
            resource: None,
            step_id: None,
        }
    }

    pub fn with_approval(mut self, approval: Approval) -> Self {
        self.approval = Some(approval);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    fn policy_request(&self, policy_class: PolicyClass) -> PolicyRequest {
        PolicyRequest {
            run_id: self.run_id.clone(),
            tenant_id: self.tenant_id.clone(),
            tool_name: self.tool_name.clone(),
            policy_class,
            actor: self.actor.clone(),
            source: self.source.clone(),
            resource: self.resource.clone(),
            approval: self.approval.clone(),
        }
    }
}

/// Outcome of [`Gateway::invoke`].
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub output: Result<Value, InvocationError>,
    /// Ids of the audit entries emitted for this call, in order. Delivery to
    /// the sink happens in the background.
    pub audit_event_ids: Vec<Uuid>,
    pub duration_ms: u64,
    /// First 16 hex chars of the SHA-256 of the canonical input.
    pub input_hash: String,
    /// The outcome was replayed from the result store.
    pub cached: bool,
    /// Another call for the same step was still executing and the store
    /// allows pending hits. `output` is `null`.
    pub in_flight: bool,
}

impl InvocationResult {
    pub fn success(&self) -> bool {
        self.output.is_ok()
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.output.as_ref().err().map(InvocationError::code)
    }

    /// Wire form: `{success, output | error, auditEventIds, durationMs, ...}`.
    pub fn to_json(&self) -> Value {
        let mut out = json!({
            "success": self.success(),
            "auditEventIds": self.audit_event_ids,
            "durationMs": self.duration_ms,
            "inputHash": self.input_hash,
            "cached": self.cached,
        });
        if self.in_flight {
            out["inFlight"] = json!(true);
        }
        match &self.output {
            Ok(value) => out["output"] = value.clone(),
            Err(err) => out["error"] = error_details(err),
        }
        out
    }
}

fn error_details(err: &InvocationError) -> Value {
    let mut details = json!({ "code": err.code(), "message": err.to_string() });
    if let Some(after) = err.retry_after() {
        details["retryAfterMs"] = json!(after.as_millis() as u64);
    }
    if let Some(at) = err.next_attempt_at() {
        details["nextAttemptAt"] = json!(at);
    }
    if let InvocationError::PolicyDenied {
        reason_code,
        rule_id,
        ..
    } = err
    {
        details["reasonCode"] = json!(reason_code);
        if let Some(rule) = rule_id {
            details["ruleId"] = json!(rule);
        }
    }
    details
}

/// Split `connector.tool`; both parts must be non-empty.
fn parse_tool_name(name: &str) -> Result<(&str, &str), InvocationError> {
    match name.split_once('.') {
        Some((connector, tool)) if !connector.is_empty() && !tool.is_empty() => {
            Ok((connector, tool))
        }
        _ => Err(InvocationError::ToolNotFound {
            tool_name: name.to_string(),
        }),
    }
}

// ─── Gateway ──────────────────────────────────────────────────────────────────

/// Single choke point for tool invocations. Share it behind an `Arc`.
pub struct Gateway {
    registry: Arc<dyn ToolRegistry>,
    policy: Arc<PolicyEngine>,
    audit: AuditDispatcher,
    guard: Option<ResilienceGuard>,
    results: Option<Arc<ResultStore>>,
    idempotency_options: IdempotencyOptions,
    schemas: SchemaCache,
    sweeper: Option<JoinHandle<()>>,
}

impl Gateway {
    pub fn builder(registry: Arc<dyn ToolRegistry>, policy: Arc<PolicyEngine>) -> GatewayBuilder {
        GatewayBuilder::new(registry, policy)
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn resilience(&self) -> Option<&ResilienceGuard> {
        self.guard.as_ref()
    }

    pub fn result_store(&self) -> Option<&Arc<ResultStore>> {
        self.results.as_ref()
    }

    pub fn schemas(&self) -> &SchemaCache {
        &self.schemas
    }

    /// Wait until every audit entry emitted so far has reached the sink (or
    /// been dropped after a failure).
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }

    /// Run one tool invocation through the full pipeline.
    pub async fn invoke(&self, req: InvocationRequest) -> InvocationResult {
        let mut invocation = Invocation {
            gateway: self,
            req: &req,
            input_hash: hash_input(&req.input),
            actor: req.actor.clone().unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
            started: Instant::now(),
            audit_event_ids: Vec::new(),
            cached: false,
            in_flight: false,
        };
        let output = invocation.run().await;
        let duration_ms = invocation.elapsed_ms();

        match &output {
            Ok(_) => tracing::info!(
                run_id = %req.run_id,
                tool = %req.tool_name,
                duration_ms,
                cached = invocation.cached,
                "tool invocation succeeded"
            ),
            Err(err) => tracing::warn!(
                run_id = %req.run_id,
                tool = %req.tool_name,
                code = %err.code(),
                duration_ms,
                error = %err,
                "tool invocation failed"
            ),
        }

        InvocationResult {
            output,
            audit_event_ids: invocation.audit_event_ids,
            duration_ms,
            input_hash: invocation.input_hash,
            cached: invocation.cached,
            in_flight: invocation.in_flight,
        }
    }

    async fn guarded(
        &self,
        tool: &Arc<dyn Tool>,
        ctx: &ToolContext,
        connector_id: &str,
        input: &Value,
    ) -> Result<Value, ExecutionFailure> {
        match &self.guard {
            Some(guard) => guard
                .call(connector_id, || tool.invoke(ctx, input.clone()))
                .await
                .map_err(ExecutionFailure::from),
            None => tool
                .invoke(ctx, input.clone())
                .await
                .map_err(ExecutionFailure::Tool),
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("audit", &self.audit)
            .field("guard", &self.guard)
            .field("results", &self.results)
            .field("schemas", &self.schemas)
            .finish_non_exhaustive()
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// State of one in-flight invocation.
struct Invocation<'a> {
    gateway: &'a Gateway,
    req: &'a InvocationRequest,
    input_hash: String,
    actor: String,
    started: Instant,
    audit_event_ids: Vec<Uuid>,
    cached: bool,
    in_flight: bool,
}

impl<'a> Invocation<'a> {
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    async fn run(&mut self) -> Result<Value, InvocationError> {
        let gateway = self.gateway;
        let req = self.req;

        let (connector_id, tool_id) = parse_tool_name(&req.tool_name)?;
        let connector = gateway.registry.connector(connector_id).ok_or_else(|| {
            InvocationError::ConnectorNotFound {
                connector_id: connector_id.to_string(),
            }
        })?;
        let tool = connector
            .tool(tool_id)
            .ok_or_else(|| InvocationError::ToolNotFound {
                tool_name: req.tool_name.clone(),
            })?;
        let policy_class = tool.policy_class();

        self.emit(
            AuditAction::Requested,
            json!({
                "toolName": req.tool_name,
                "tenantId": req.tenant_id,
                "inputHash": self.input_hash,
                "policyClass": policy_class,
                "stepId": req.step_id,
            }),
        );

        if let Err(err) = gateway.schemas.validate(
            &req.tool_name,
            SchemaStage::Input,
            tool.input_schema(),
            &req.input,
        ) {
            return Err(self.fail(err));
        }

        let decision = gateway.policy.evaluate(&req.policy_request(policy_class));
        self.emit(
            AuditAction::PolicyChecked,
            json!({
                "allowed": decision.allowed,
                "reasonCode": decision.reason_code,
                "ruleId": decision.rule_id,
            }),
        );
        if !decision.allowed {
            return Err(InvocationError::PolicyDenied {
                reason_code: decision.reason_code,
                rule_id: decision.rule_id,
                message: decision.message,
            });
        }

        let ctx = ToolContext {
            run_id: req.run_id.clone(),
            tenant_id: req.tenant_id.clone(),
            tool_name: req.tool_name.clone(),
            step_id: req.step_id.clone(),
            actor: req.actor.clone(),
        };
        let output = match self.execute(&tool, &ctx, connector_id).await {
            Ok(output) => output,
            Err(failure) => return Err(self.fail(failure.into())),
        };

        // an in-flight hit carries no output to check
        if !self.in_flight {
            if let Err(err) = gateway.schemas.validate(
                &req.tool_name,
                SchemaStage::Output,
                tool.output_schema(),
                &output,
            ) {
                return Err(self.fail(err));
            }
        }

        let duration_ms = self.elapsed_ms();
        self.emit(
            AuditAction::Succeeded,
            json!({ "durationMs": duration_ms, "cached": self.cached, "inFlight": self.in_flight }),
        );
        Ok(output)
    }

    async fn execute(
        &mut self,
        tool: &Arc<dyn Tool>,
        ctx: &ToolContext,
        connector_id: &str,
    ) -> Result<Value, ExecutionFailure> {
        let gateway = self.gateway;
        let req = self.req;
        let (store, step_id) = match (&gateway.results, &req.step_id) {
            (Some(store), Some(step_id)) => (store, step_id),
            _ => return gateway.guarded(tool, ctx, connector_id, &req.input).await,
        };

        let key = IdempotencyKey::new(
            req.run_id.as_str(),
            step_id.as_str(),
            req.tool_name.as_str(),
            self.input_hash.as_str(),
        )
        .to_string();
        let outcome = store
            .with_idempotency(&key, &gateway.idempotency_options, || {
                gateway.guarded(tool, ctx, connector_id, &req.input)
            })
            .await;

        match outcome {
            Ok(Idempotent::Executed(value)) => Ok(value),
            Ok(Idempotent::Cached(value)) => {
                self.cached = true;
                Ok(value)
            }
            Ok(Idempotent::InFlight) => {
                self.cached = true;
                self.in_flight = true;
                Ok(Value::Null)
            }
            Err(IdempotencyError::InProgress { .. }) => Err(ExecutionFailure::InProgress { key }),
            Err(IdempotencyError::CachedFailure { error, .. }) => {
                self.cached = true;
                Err(error)
            }
            Err(IdempotencyError::Failed(failure)) => {
                // the tool never ran; let the caller try again after backing off
                if failure.is_admission_control() {
                    store.delete(&key);
                }
                Err(failure)
            }
        }
    }

    fn fail(&mut self, err: InvocationError) -> InvocationError {
        self.emit(AuditAction::Failed, error_details(&err));
        err
    }

    /// Queue an audit entry; never waits on the sink.
    fn emit(&mut self, action: AuditAction, details: Value) {
        let entry = AuditEntry::new(self.actor.as_str(), action, details);
        let id = entry.id;
        if self.gateway.audit.dispatch(&self.req.run_id, entry) {
            self.audit_event_ids.push(id);
        } else {
            tracing::warn!(
                run_id = %self.req.run_id,
                action = ?action,
                "audit dispatcher stopped, entry dropped"
            );
        }
    }
}

// ─── Builder ──────────────────────────────────────────────────────────────────

pub struct GatewayBuilder {
    registry: Arc<dyn ToolRegistry>,
    policy: Arc<PolicyEngine>,
    audit: Option<Arc<dyn AuditSink>>,
    audit_timeout: Duration,
    guard: Option<ResilienceGuard>,
    results: Option<Arc<ResultStore>>,
    idempotency_options: IdempotencyOptions,
    sweep_interval: Option<Duration>,
}

impl GatewayBuilder {
    pub fn new(registry: Arc<dyn ToolRegistry>, policy: Arc<PolicyEngine>) -> Self {
        Self {
            registry,
            policy,
            audit: None,
            audit_timeout: DEFAULT_AUDIT_TIMEOUT,
            guard: None,
            results: None,
            idempotency_options: IdempotencyOptions::default(),
            sweep_interval: None,
        }
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn audit_timeout(mut self, timeout: Duration) -> Self {
        self.audit_timeout = timeout;
        self
    }

    /// Wrap tool execution in `guard`, keyed by connector id.
    pub fn resilience(mut self, guard: ResilienceGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Deduplicate requests that carry a step id.
    pub fn idempotency(mut self, store: Arc<ResultStore>, options: IdempotencyOptions) -> Self {
        self.results = Some(store);
        self.idempotency_options = options;
        self
    }

    /// Purge expired results every `interval` for the gateway's lifetime.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Apply resilience, idempotency and audit settings from `config`.
    ///
    /// An audit sink set explicitly is kept; otherwise the configured one is
    /// built.
    pub fn with_config(mut self, config: &GatewayConfig) -> Self {
        self.guard = Some(config.build_guard());
        self.audit_timeout = config.audit.timeout();
        if self.audit.is_none() {
            self.audit = Some(config.audit.build_sink());
        }
        if config.idempotency.enabled {
            let options = config.idempotency.to_options();
            self.results = Some(Arc::new(ResultStore::with_defaults(options.clone())));
            self.idempotency_options = options;
            self.sweep_interval = config.idempotency.sweep_interval();
        } else {
            self.results = None;
            self.sweep_interval = None;
        }
        self
    }

    /// Spawns the audit delivery task and, when both a result store and a
    /// sweep interval are set, the result sweeper. Must be called within a
    /// Tokio runtime.
    pub fn build(self) -> Gateway {
        let sink = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let sweeper = match (&self.results, self.sweep_interval) {
            (Some(store), Some(interval)) => Some(store.spawn_sweeper(interval)),
            _ => None,
        };
        Gateway {
            registry: self.registry,
            policy: self.policy,
            audit: AuditDispatcher::spawn(sink, self.audit_timeout),
            guard: self.guard,
            results: self.results,
            idempotency_options: self.idempotency_options,
            schemas: SchemaCache::new(),
            sweeper,
        }
    }
}
