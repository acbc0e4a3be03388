// Result contract for commands and instance writes.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::events::EmittedEvent;
use super::store::Instance;
use crate::ir::ConstraintSeverity;

/// A sub-expression and the value it had when a check failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedValue {
    pub expression: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardFailure {
    /// 1-based position in the command's guard list.
    pub index: usize,
    pub expression: String,
    pub resolved: Vec<ResolvedValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDenial {
    pub policy_name: String,
    pub expression: String,
    pub message: String,
    pub context_keys: Vec<String>,
    pub resolved: Vec<ResolvedValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintOutcome {
    pub code: String,
    pub constraint_name: String,
    pub severity: ConstraintSeverity,
    pub passed: bool,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub details: IndexMap<String, serde_json::Value>,
    pub resolved: Vec<ResolvedValue>,
    pub overridden: bool,
}

impl ConstraintOutcome {
    /// A failed `block` constraint that was not overridden.
    pub fn is_blocking(&self) -> bool {
        !self.passed && !self.overridden && self.severity == ConstraintSeverity::Block
    }
}

/// A request to let a named `block` constraint pass for one command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRequest {
    pub constraint_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard_failure: Option<GuardFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_denial: Option<PolicyDenial>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraint_outcomes: Vec<ConstraintOutcome>,
    pub emitted_events: Vec<EmittedEvent>,
}

impl CommandResult {
    pub fn failure(error: impl Into<String>) -> Self {
        CommandResult {
            success: false,
            error: Some(error.into()),
            ..CommandResult::default()
        }
    }

    pub fn denied(denial: PolicyDenial) -> Self {
        CommandResult {
            success: false,
            error: Some(denial.message.clone()),
            denied_by: Some(denial.policy_name.clone()),
            policy_denial: Some(denial),
            ..CommandResult::default()
        }
    }

    pub fn guard_failed(failure: GuardFailure) -> Self {
        CommandResult {
            success: false,
            error: Some(format!(
                "Guard {} failed: {}",
                failure.index, failure.expression
            )),
            guard_failure: Some(failure),
            ..CommandResult::default()
        }
    }
}

/// Why a write was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WriteRejection {
    NotFound {
        id: String,
    },
    ConstraintViolation,
    #[serde(rename_all = "camelCase")]
    InvalidTransition {
        property: String,
        from: serde_json::Value,
        to: serde_json::Value,
        allowed: Vec<serde_json::Value>,
    },
    VersionConflict {
        expected: serde_json::Value,
        actual: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Instance>,
    /// Failed constraints, blocking or not.
    pub violations: Vec<ConstraintOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<WriteRejection>,
}

impl WriteOutcome {
    pub fn written(instance: Instance, violations: Vec<ConstraintOutcome>) -> Self {
        WriteOutcome {
            success: true,
            instance: Some(instance),
            violations,
            rejection: None,
        }
    }

    pub fn rejected(rejection: WriteRejection, violations: Vec<ConstraintOutcome>) -> Self {
        WriteOutcome {
            success: false,
            instance: None,
            violations,
            rejection: Some(rejection),
        }
    }

    pub fn describe_rejection(&self) -> String {
        match &self.rejection {
            None => "write accepted".to_string(),
            Some(WriteRejection::NotFound { id }) => format!("instance '{}' not found", id),
            Some(WriteRejection::ConstraintViolation) => format!(
                "constraint violation: {}",
                self.violations
                    .iter()
                    .filter(|v| v.is_blocking())
                    .map(|v| v.constraint_name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Some(WriteRejection::InvalidTransition { property, from, to, .. }) => {
                format!("invalid transition of '{}' from {} to {}", property, from, to)
            }
            Some(WriteRejection::VersionConflict { expected, actual }) => {
                format!("version conflict: expected {}, found {}", expected, actual)
            }
        }
    }
}
