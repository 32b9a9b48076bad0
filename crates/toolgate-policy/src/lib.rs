//! toolgate-policy: deny-by-default policy engine for tool invocations.
//!
//! A [`PolicyDocument`] holds prioritised allow/deny rules plus per-class
//! defaults. [`PolicyEngine::evaluate`] turns a [`PolicyRequest`] into a
//! [`PolicyDecision`] with a fixed [`ReasonCode`].
//!
//! Destructive tools are gated before any rule is consulted: the caller must
//! supply an [`Approval`] for the current run that grants the scope listed
//! for the tool in the [`ScopeTable`].
//!
//! # Example
//!
//! ```
//! use toolgate_policy::{PolicyClass, PolicyEngine, PolicyRequest, ReasonCode};
//!
//! let engine = PolicyEngine::from_yaml_str(
//!     "rules:\n  - { id: writes, effect: allow, priority: 10, conditions: { policyClasses: [WRITE_NON_DESTRUCTIVE] } }\n",
//! )
//! .unwrap();
//!
//! let req = PolicyRequest::new("run-1", "acme", "jira.create_issue", PolicyClass::WriteNonDestructive);
//! assert!(engine.evaluate(&req).allowed);
//!
//! let req = PolicyRequest::new("run-1", "acme", "github.push", PolicyClass::Destructive);
//! assert_eq!(engine.evaluate(&req).reason_code, ReasonCode::DenyDestructiveNoApproval);
//! ```

pub mod approval;
pub mod document;
pub mod engine;
pub mod error;

pub use approval::{Approval, ApprovalScope, ScopeTable};
pub use document::{
    Effect, NamePattern, PolicyClass, PolicyDocument, PolicyRule, PolicySummary, RuleConditions,
};
pub use engine::{PolicyDecision, PolicyEngine, PolicyRequest, ReasonCode};
pub use error::PolicyError;
