// Manifest AST
// Produced by the parser, consumed (and discarded) by the IR compiler.

use serde::{Deserialize, Serialize};

use crate::lexer::Position;

// --- Expressions ---

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Literal {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Expression {
    Literal(Literal),
    Identifier(String),
    MemberAccess {
        object: Box<Expression>,
        property: String,
    },
    /// `a[expr]` with a non-literal index; literal indexes become member access.
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    BinaryOp {
        operator: String,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    UnaryOp {
        operator: String,
        operand: Box<Expression>,
    },
    Call {
        callee: Box<Expression>,
        arguments: Vec<Expression>,
    },
    Conditional {
        condition: Box<Expression>,
        consequent: Box<Expression>,
        alternate: Box<Expression>,
    },
    Array(Vec<Expression>),
    Object(Vec<(String, Expression)>),
    Lambda {
        params: Vec<String>,
        body: Box<Expression>,
    },
}

impl Expression {
    pub fn boxed(self) -> Box<Expression> {
        Box::new(self)
    }
}

// --- Types ---

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TypeRef {
    pub name: String,
    pub generic: Option<Box<TypeRef>>,
    pub nullable: bool,
}

impl TypeRef {
    pub fn named(name: &str) -> Self {
        TypeRef {
            name: name.to_string(),
            generic: None,
            nullable: false,
        }
    }
}

// --- Entity members ---

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PropertyNode {
    pub name: String,
    pub data_type: TypeRef,
    pub default_value: Option<Expression>,
    pub modifiers: Vec<String>,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ComputedPropertyNode {
    pub name: String,
    pub data_type: TypeRef,
    pub expression: Expression,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Copy, Eq, Serialize, Deserialize)]
pub enum RelationshipKind {
    HasMany,
    HasOne,
    BelongsTo,
    Ref,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RelationshipNode {
    pub name: String,
    pub kind: RelationshipKind,
    pub target: String,
    pub through: Option<String>,
    pub foreign_key: Option<String>,
    pub position: Position,
}

/// One shape for both `constraint name[:severity] expr "msg"` and the block form.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ConstraintNode {
    pub name: String,
    pub code: Option<String>,
    pub expression: Expression,
    pub severity: Option<String>,
    pub message: Option<String>,
    pub details: Vec<(String, Expression)>,
    pub overrideable: bool,
    pub override_policy: Option<String>,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ParameterNode {
    pub name: String,
    pub data_type: TypeRef,
    pub required: bool,
    pub default_value: Option<Expression>,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Copy, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Mutate,
    Compute,
    Effect,
    Publish,
    Persist,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ActionNode {
    pub kind: ActionKind,
    pub target: Option<String>,
    pub expression: Expression,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct CommandNode {
    pub name: String,
    pub parameters: Vec<ParameterNode>,
    pub guards: Vec<Expression>,
    pub constraints: Vec<ConstraintNode>,
    pub actions: Vec<ActionNode>,
    pub emits: Vec<String>,
    pub returns: Option<TypeRef>,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PolicyNode {
    pub name: String,
    pub action: String,
    pub expression: Expression,
    pub message: Option<String>,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct StoreNode {
    pub entity: String,
    pub target: String,
    pub config: Vec<(String, Expression)>,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TransitionNode {
    pub property: String,
    pub from: Literal,
    pub to: Vec<Literal>,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct EntityNode {
    pub name: String,
    pub properties: Vec<PropertyNode>,
    pub computed_properties: Vec<ComputedPropertyNode>,
    pub relationships: Vec<RelationshipNode>,
    pub commands: Vec<CommandNode>,
    pub constraints: Vec<ConstraintNode>,
    pub policies: Vec<PolicyNode>,
    pub store: Option<StoreNode>,
    pub version_property: Option<String>,
    pub version_at_property: Option<String>,
    pub transitions: Vec<TransitionNode>,
    pub position: Position,
}

impl EntityNode {
    pub fn new(name: String, position: Position) -> Self {
        EntityNode {
            name,
            properties: Vec::new(),
            computed_properties: Vec::new(),
            relationships: Vec::new(),
            commands: Vec::new(),
            constraints: Vec::new(),
            policies: Vec::new(),
            store: None,
            version_property: None,
            version_at_property: None,
            transitions: Vec::new(),
            position,
        }
    }
}

// --- Top-level declarations ---

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct EventField {
    pub name: String,
    pub data_type: TypeRef,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct OutboxEventNode {
    pub name: String,
    pub channel: Option<String>,
    pub payload: Vec<EventField>,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    pub name: String,
    pub expression: Expression,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub name: String,
    pub parameters: Vec<ParameterNode>,
    pub returns: Option<TypeRef>,
    pub steps: Vec<FlowStep>,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct EffectNode {
    pub name: String,
    pub kind: String,
    pub config: Vec<(String, Expression)>,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ExposeNode {
    pub entity: String,
    pub protocol: String,
    pub operations: Vec<String>,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct CompositionNode {
    pub name: String,
    pub components: Vec<String>,
    pub connections: Vec<Connection>,
    pub position: Position,
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct ModuleNode {
    pub name: String,
    pub entities: Vec<EntityNode>,
    pub commands: Vec<CommandNode>,
    pub policies: Vec<PolicyNode>,
    pub stores: Vec<StoreNode>,
    pub events: Vec<OutboxEventNode>,
    pub position: Position,
}

/// A parsed source file. Declarations inside a `module` block live on the
/// module node; everything else is top-level.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub modules: Vec<ModuleNode>,
    pub entities: Vec<EntityNode>,
    pub commands: Vec<CommandNode>,
    pub policies: Vec<PolicyNode>,
    pub stores: Vec<StoreNode>,
    pub events: Vec<OutboxEventNode>,
    pub flows: Vec<FlowNode>,
    pub effects: Vec<EffectNode>,
    pub exposures: Vec<ExposeNode>,
    pub compositions: Vec<CompositionNode>,
}
