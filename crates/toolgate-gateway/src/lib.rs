//! toolgate-gateway: the single choke point through which agents call tools.
//!
//! Every call to [`Gateway::invoke`] is resolved against a [`ToolRegistry`],
//! validated against the tool's JSON Schemas, checked by the policy engine,
//! executed (optionally idempotently and behind a [`ResilienceGuard`]) and
//! recorded in an [`AuditSink`].
//!
//! [`ResilienceGuard`]: toolgate_core::ResilienceGuard

pub mod audit;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod schema;

pub use audit::{AuditAction, AuditEntry, AuditSink, JsonlAuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::{GatewayConfig, LogSection, RateLimiterSection};
pub use error::{
    AuditError, ConfigError, ErrorCode, ExecutionFailure, InvocationError, SchemaStage, ToolError,
};
pub use pipeline::{Gateway, GatewayBuilder, InvocationRequest, InvocationResult, ResultStore};
pub use registry::{
    Connector, FnTool, MemoryConnector, MemoryToolRegistry, Tool, ToolContext, ToolRegistry,
};
pub use schema::SchemaCache;
