//! Canonical intermediate representation.
//!
//! The IR is the only artifact shared with tooling outside this crate, so
//! every type here serializes to a fixed camelCase JSON shape. Once
//! produced it is never mutated; runtime engines hold it behind an `Arc`.

pub mod cache;
pub mod compiler;
pub mod hash;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use cache::IrCache;
pub use compiler::{compile_to_ir, CompileOptions, CompileOutput, IrCompiler};
pub use hash::{compute_ir_hash, content_hash, verify_ir_hash};

pub const IR_VERSION: &str = "1.0";
pub const SCHEMA_VERSION: &str = "1.0";
pub const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ir {
    pub version: String,
    pub provenance: IrProvenance,
    pub modules: Vec<IrModule>,
    pub entities: Vec<IrEntity>,
    pub stores: Vec<IrStore>,
    pub events: Vec<IrEvent>,
    pub commands: Vec<IrCommand>,
    pub policies: Vec<IrPolicy>,
}

impl Ir {
    pub fn entity(&self, name: &str) -> Option<&IrEntity> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Entity-scoped lookup when `entity` is given, otherwise the first
    /// command with that name.
    pub fn command(&self, name: &str, entity: Option<&str>) -> Option<&IrCommand> {
        self.commands.iter().find(|c| {
            c.name == name && entity.map_or(true, |e| c.entity.as_deref() == Some(e))
        })
    }

    pub fn event(&self, name: &str) -> Option<&IrEvent> {
        self.events.iter().find(|e| e.name == name)
    }

    pub fn policy(&self, name: &str) -> Option<&IrPolicy> {
        self.policies.iter().find(|p| p.name == name)
    }

    /// Resolve `name` from the narrowest scope outward: policies of
    /// `entity`, then module-level policies of `module`, then unscoped ones.
    /// Falls back to [`Ir::policy`] when no scope matches.
    pub fn scoped_policy(
        &self,
        name: &str,
        entity: Option<&str>,
        module: Option<&str>,
    ) -> Option<&IrPolicy> {
        let named = || self.policies.iter().filter(move |p| p.name == name);
        entity
            .and_then(|e| named().find(|p| p.entity.as_deref() == Some(e)))
            .or_else(|| {
                module.and_then(|m| {
                    named().find(|p| p.entity.is_none() && p.module.as_deref() == Some(m))
                })
            })
            .or_else(|| named().find(|p| p.entity.is_none() && p.module.is_none()))
            .or_else(|| self.policy(name))
    }

    pub fn store_for(&self, entity: &str) -> Option<&IrStore> {
        self.stores.iter().find(|s| s.entity == entity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrProvenance {
    pub content_hash: String,
    pub ir_hash: String,
    pub compiler_version: String,
    pub schema_version: String,
    pub compiled_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrModule {
    pub name: String,
    pub entities: Vec<String>,
    pub commands: Vec<String>,
    pub stores: Vec<String>,
    pub events: Vec<String>,
    pub policies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrType {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic: Option<Box<IrType>>,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyModifier {
    Required,
    Unique,
    Indexed,
    Private,
    Readonly,
    Optional,
}

impl PropertyModifier {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "required" => Some(Self::Required),
            "unique" => Some(Self::Unique),
            "indexed" => Some(Self::Indexed),
            "private" => Some(Self::Private),
            "readonly" => Some(Self::Readonly),
            "optional" => Some(Self::Optional),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrProperty {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: IrType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<IrValue>,
    pub modifiers: Vec<PropertyModifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrComputedProperty {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: IrType,
    pub expression: IrExpression,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationshipKind {
    HasMany,
    HasOne,
    BelongsTo,
    Ref,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrRelationship {
    pub name: String,
    pub kind: RelationshipKind,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub through: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintSeverity {
    Ok,
    Warn,
    #[default]
    Block,
}

impl ConstraintSeverity {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ok" => Some(Self::Ok),
            "warn" => Some(Self::Warn),
            "block" => Some(Self::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrConstraint {
    pub name: String,
    pub code: String,
    pub expression: IrExpression,
    pub severity: ConstraintSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub details: IndexMap<String, IrExpression>,
    pub overrideable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_policy_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrTransition {
    pub property: String,
    pub from: IrValue,
    pub to: Vec<IrValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrEntity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub properties: Vec<IrProperty>,
    pub computed_properties: Vec<IrComputedProperty>,
    pub relationships: Vec<IrRelationship>,
    pub commands: Vec<String>,
    pub constraints: Vec<IrConstraint>,
    pub policies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_at_property: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<IrTransition>,
}

impl IrEntity {
    pub fn property(&self, name: &str) -> Option<&IrProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn computed(&self, name: &str) -> Option<&IrComputedProperty> {
        self.computed_properties.iter().find(|c| c.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&IrRelationship> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: IrType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<IrValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Mutate,
    Compute,
    Effect,
    Publish,
    Persist,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrAction {
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub expression: IrExpression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrCommand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    pub parameters: Vec<IrParameter>,
    pub guards: Vec<IrExpression>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<IrConstraint>,
    pub actions: Vec<IrAction>,
    pub emits: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<IrType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Read,
    Write,
    Delete,
    Execute,
    All,
    Override,
}

impl PolicyAction {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "delete" => Some(Self::Delete),
            "execute" => Some(Self::Execute),
            "all" => Some(Self::All),
            "override" => Some(Self::Override),
            _ => None,
        }
    }

    pub fn applies_to_execute(self) -> bool {
        matches!(self, Self::Execute | Self::All)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrPolicy {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    pub action: PolicyAction,
    pub expression: IrExpression,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrStore {
    pub entity: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub config: IndexMap<String, IrValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrEventField {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: IrType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrEvent {
    pub name: String,
    pub channel: String,
    pub payload: Vec<IrEventField>,
}

// --- Values and expressions ---

/// Constant value: `{"kind": "number", "value": 42}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum IrValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
    Array(Vec<IrValue>),
    Object(IndexMap<String, IrValue>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrObjectEntry {
    pub key: String,
    pub value: IrExpression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IrExpression {
    Literal {
        value: IrValue,
    },
    Identifier {
        name: String,
    },
    Member {
        object: Box<IrExpression>,
        property: String,
    },
    Binary {
        operator: String,
        left: Box<IrExpression>,
        right: Box<IrExpression>,
    },
    Unary {
        operator: String,
        operand: Box<IrExpression>,
    },
    Call {
        callee: Box<IrExpression>,
        args: Vec<IrExpression>,
    },
    Conditional {
        condition: Box<IrExpression>,
        consequent: Box<IrExpression>,
        alternate: Box<IrExpression>,
    },
    Array {
        elements: Vec<IrExpression>,
    },
    Object {
        properties: Vec<IrObjectEntry>,
    },
    Lambda {
        params: Vec<String>,
        body: Box<IrExpression>,
    },
}

impl IrExpression {
    pub fn literal(value: IrValue) -> Self {
        IrExpression::Literal { value }
    }

    pub fn identifier(name: impl Into<String>) -> Self {
        IrExpression::Identifier { name: name.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn literal_expression_shape() {
        let expr = IrExpression::literal(IrValue::Number(42.0));
        assert_eq!(
            serde_json::to_value(&expr).unwrap(),
            json!({"kind": "literal", "value": {"kind": "number", "value": 42.0}})
        );
        let back: IrExpression =
            serde_json::from_value(json!({"kind": "literal", "value": {"kind": "number", "value": 42}}))
                .unwrap();
        assert_eq!(back, expr);
    }

    #[test]
    fn null_value_has_no_payload() {
        assert_eq!(serde_json::to_value(IrValue::Null).unwrap(), json!({"kind": "null"}));
    }

    #[test]
    fn binary_expression_shape() {
        let expr = IrExpression::Binary {
            operator: "+".to_string(),
            left: Box::new(IrExpression::identifier("a")),
            right: Box::new(IrExpression::literal(IrValue::Boolean(true))),
        };
        assert_eq!(
            serde_json::to_value(&expr).unwrap(),
            json!({
                "kind": "binary",
                "operator": "+",
                "left": {"kind": "identifier", "name": "a"},
                "right": {"kind": "literal", "value": {"kind": "boolean", "value": true}}
            })
        );
    }
}
