// Declaration parsing: modules, entities and their members, commands,
// policies, stores, events, and the flow/effect/expose/compose forms.

use super::{ParseError, ParseResult, Parser};
use crate::ast::{
    ActionKind, ActionNode, CommandNode, CompositionNode, ComputedPropertyNode, Connection,
    ConstraintNode, EffectNode, EntityNode, EventField, ExposeNode, Expression, FlowNode,
    FlowStep, Literal, ModuleNode, OutboxEventNode, ParameterNode, PolicyNode, PropertyNode,
    RelationshipKind, RelationshipNode, StoreNode, TransitionNode, TypeRef,
};
use crate::lexer::TokenKind;

const PROPERTY_MODIFIERS: &[&str] = &["required", "unique", "indexed", "private", "readonly", "optional"];

const SEVERITIES: &[&str] = &["ok", "warn", "block"];

const POLICY_ACTIONS: &[&str] = &["read", "write", "delete", "execute", "all", "override"];

impl Parser {
    // -- Module ----------------------------------------------------

    pub(super) fn parse_module(&mut self) -> ParseResult<ModuleNode> {
        let position = self.expect_keyword("module")?.position;
        let name = self.expect_declaration_name("module")?;
        self.skip_newlines();
        self.expect_punct("{")?;
        let mut module = ModuleNode {
            name,
            position,
            ..ModuleNode::default()
        };
        loop {
            self.skip_separators();
            if self.eat_punct("}") {
                break;
            }
            if self.at_eof() {
                return Err(self.error_at_current(format!(
                    "Unterminated module '{}': expected '}}'",
                    module.name
                )));
            }
            let start = self.checkpoint();
            if let Err(error) = self.parse_module_member(&mut module) {
                self.record(error);
                self.synchronize(start, true);
            }
        }
        Ok(module)
    }

    fn parse_module_member(&mut self, module: &mut ModuleNode) -> ParseResult<()> {
        let token = self.current().clone();
        match (token.kind, token.value.as_str()) {
            (TokenKind::Keyword, "entity") => module.entities.push(self.parse_entity()?),
            (TokenKind::Keyword, "command") => module.commands.push(self.parse_command()?),
            (TokenKind::Keyword, "policy") => module.policies.push(self.parse_policy()?),
            (TokenKind::Keyword, "store") => module.stores.push(self.parse_store_declaration()?),
            (TokenKind::Keyword, "event") => module.events.push(self.parse_event()?),
            _ => {
                return Err(self.error_at_current(format!(
                    "Expected entity, command, policy, store or event in module, found {}",
                    self.describe_current()
                )))
            }
        }
        Ok(())
    }

    // -- Entity ----------------------------------------------------

    pub(super) fn parse_entity(&mut self) -> ParseResult<EntityNode> {
        let position = self.expect_keyword("entity")?.position;
        let name = self.expect_declaration_name("entity")?;
        self.skip_newlines();
        self.expect_punct("{")?;
        let mut entity = EntityNode::new(name, position);
        loop {
            self.skip_separators();
            if self.eat_punct("}") {
                return Ok(entity);
            }
            if self.at_eof() {
                return Err(self.error_at_current(format!(
                    "Unterminated entity '{}': expected '}}'",
                    entity.name
                )));
            }
            self.parse_entity_member(&mut entity)?;
        }
    }

    fn parse_entity_member(&mut self, entity: &mut EntityNode) -> ParseResult<()> {
        let token = self.current().clone();
        match (token.kind, token.value.as_str()) {
            (TokenKind::Keyword, "property") => {
                let property = self.parse_property()?;
                entity.properties.push(property);
            }
            (TokenKind::Keyword, "computed") | (TokenKind::Keyword, "derived") => {
                let computed = self.parse_computed()?;
                entity.computed_properties.push(computed);
            }
            (TokenKind::Keyword, "hasMany")
            | (TokenKind::Keyword, "hasOne")
            | (TokenKind::Keyword, "belongsTo")
            | (TokenKind::Keyword, "ref") => {
                let relationship = self.parse_relationship()?;
                entity.relationships.push(relationship);
            }
            (TokenKind::Keyword, "command") => {
                let command = self.parse_command()?;
                entity.commands.push(command);
            }
            (TokenKind::Keyword, "constraint") => {
                let constraint = self.parse_constraint()?;
                entity.constraints.push(constraint);
            }
            (TokenKind::Keyword, "policy") => {
                let policy = self.parse_policy()?;
                entity.policies.push(policy);
            }
            (TokenKind::Keyword, "store") => {
                let store = self.parse_entity_store(&entity.name)?;
                entity.store = Some(store);
            }
            (TokenKind::Keyword, "transition") => {
                let transition = self.parse_transition()?;
                entity.transitions.push(transition);
            }
            (TokenKind::Identifier, "versionProperty") => {
                self.advance();
                entity.version_property = Some(self.expect_name("version property")?);
            }
            (TokenKind::Identifier, "versionAtProperty") => {
                self.advance();
                entity.version_at_property = Some(self.expect_name("version timestamp property")?);
            }
            _ => {
                return Err(self.error_at_current(format!(
                    "Unexpected {} in entity '{}'",
                    self.describe_current(),
                    entity.name
                )))
            }
        }
        Ok(())
    }

    fn is_modifier(&self) -> bool {
        let token = self.current();
        matches!(token.kind, TokenKind::Identifier | TokenKind::Keyword)
            && PROPERTY_MODIFIERS.contains(&token.value.as_str())
    }

    fn parse_property(&mut self) -> ParseResult<PropertyNode> {
        let position = self.expect_keyword("property")?.position;
        let mut modifiers = Vec::new();
        // A modifier word directly followed by ':' is the property name itself.
        while self.is_modifier() && !self.peek_next().is(TokenKind::Punctuation, ":") {
            modifiers.push(self.advance().value);
        }
        let name = self.expect_name("property")?;
        self.expect_punct(":")?;
        let data_type = self.parse_type()?;
        while self.is_modifier() {
            modifiers.push(self.advance().value);
        }
        let default_value = if self.eat_op("=") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(PropertyNode {
            name,
            data_type,
            default_value,
            modifiers,
            position,
        })
    }

    pub(super) fn parse_type(&mut self) -> ParseResult<TypeRef> {
        let name = self.expect_name("type")?;
        let generic = if self.eat_op("<") {
            let inner = self.nested(Self::parse_type)?;
            self.expect_op(">")?;
            Some(Box::new(inner))
        } else {
            None
        };
        let nullable = self.eat_op("?");
        Ok(TypeRef {
            name,
            generic,
            nullable,
        })
    }

    fn parse_computed(&mut self) -> ParseResult<ComputedPropertyNode> {
        let position = self.advance().position;
        let name = self.expect_name("computed property")?;
        self.expect_punct(":")?;
        let data_type = self.parse_type()?;
        self.expect_op("=")?;
        let expression = self.parse_expr()?;
        Ok(ComputedPropertyNode {
            name,
            data_type,
            expression,
            position,
        })
    }

    fn parse_relationship(&mut self) -> ParseResult<RelationshipNode> {
        let token = self.advance();
        let kind = match token.value.as_str() {
            "hasMany" => RelationshipKind::HasMany,
            "hasOne" => RelationshipKind::HasOne,
            "belongsTo" => RelationshipKind::BelongsTo,
            _ => RelationshipKind::Ref,
        };
        let name = self.expect_name("relationship")?;
        self.expect_punct(":")?;
        let target = self.expect_name("relationship target")?;
        let through = if self.eat_keyword("through") {
            Some(self.expect_name("join entity")?)
        } else {
            None
        };
        let foreign_key = if self.eat_keyword("with") {
            Some(self.expect_name("foreign key")?)
        } else {
            None
        };
        Ok(RelationshipNode {
            name,
            kind,
            target,
            through,
            foreign_key,
            position: token.position,
        })
    }

    fn parse_transition(&mut self) -> ParseResult<TransitionNode> {
        let position = self.expect_keyword("transition")?.position;
        let property = self.expect_name("transition property")?;
        self.expect_keyword("from")?;
        let from = self.parse_literal_value()?;
        self.expect_keyword("to")?;
        let mut to = Vec::new();
        if self.eat_punct("[") {
            loop {
                self.skip_list_separators();
                if self.eat_punct("]") {
                    break;
                }
                to.push(self.parse_literal_value()?);
            }
        } else {
            to.push(self.parse_literal_value()?);
        }
        Ok(TransitionNode {
            property,
            from,
            to,
            position,
        })
    }

    fn parse_literal_value(&mut self) -> ParseResult<Literal> {
        match self.parse_primary()? {
            Expression::Literal(literal) => Ok(literal),
            Expression::Identifier(name) => Ok(Literal::String(name)),
            _ => Err(self.error_at_current("Expected a literal value")),
        }
    }

    // -- Constraints -----------------------------------------------

    /// `constraint name[:severity] expr ["message"]` or
    /// `constraint name[:severity] { severity:, expression:, message:, ... }`.
    pub(super) fn parse_constraint(&mut self) -> ParseResult<ConstraintNode> {
        let position = self.expect_keyword("constraint")?.position;
        let name = self.expect_name("constraint")?;
        let mut severity = None;
        if self.eat_punct(":") && self.at_severity() {
            severity = Some(self.advance().value);
        }
        self.skip_newlines_before("{");
        if self.check_punct("{") {
            return self.parse_constraint_block(name, severity, position);
        }
        let expression = self.parse_expr()?;
        let message = if self.current().kind == TokenKind::String {
            Some(self.advance().value)
        } else {
            None
        };
        Ok(ConstraintNode {
            name,
            code: None,
            expression,
            severity,
            message,
            details: Vec::new(),
            overrideable: false,
            override_policy: None,
            position,
        })
    }

    fn at_severity(&self) -> bool {
        let token = self.current();
        if token.kind != TokenKind::Identifier || !SEVERITIES.contains(&token.value.as_str()) {
            return false;
        }
        let next = self.peek_next();
        !matches!(next.kind, TokenKind::Operator | TokenKind::Newline | TokenKind::Eof)
            && !next.is(TokenKind::Punctuation, ";")
            && !next.is(TokenKind::Punctuation, "}")
    }

    fn skip_newlines_before(&mut self, punct: &str) {
        let checkpoint = self.checkpoint();
        self.skip_newlines();
        if !self.check_punct(punct) {
            self.restore(checkpoint);
        }
    }

    fn parse_constraint_block(
        &mut self,
        name: String,
        severity: Option<String>,
        position: crate::lexer::Position,
    ) -> ParseResult<ConstraintNode> {
        self.expect_punct("{")?;
        let mut node = ConstraintNode {
            name,
            code: None,
            expression: Expression::Literal(Literal::Boolean(true)),
            severity,
            message: None,
            details: Vec::new(),
            overrideable: false,
            override_policy: None,
            position,
        };
        let mut saw_expression = false;
        loop {
            self.skip_list_separators();
            if self.eat_punct("}") {
                break;
            }
            let key_token = self.current().clone();
            let key = self.expect_name("constraint field")?;
            self.expect_punct(":")?;
            match key.as_str() {
                "severity" => {
                    let value = self.expect_name("severity")?;
                    if !SEVERITIES.contains(&value.as_str()) {
                        return Err(ParseError {
                            message: format!("Unknown severity '{}' (expected ok, warn or block)", value),
                            position: key_token.position,
                        });
                    }
                    node.severity = Some(value);
                }
                "expression" => {
                    node.expression = self.parse_expr()?;
                    saw_expression = true;
                }
                "message" => node.message = Some(self.expect_string("message")?),
                "code" => {
                    node.code = Some(if self.current().kind == TokenKind::String {
                        self.advance().value
                    } else {
                        self.expect_name("constraint code")?
                    })
                }
                "details" => match self.parse_expr()? {
                    Expression::Object(entries) => node.details = entries,
                    _ => return Err(self.error_at_current("Constraint details must be an object")),
                },
                "overridePolicy" => {
                    node.override_policy = Some(if self.current().kind == TokenKind::String {
                        self.advance().value
                    } else {
                        self.expect_name("override policy")?
                    });
                    node.overrideable = true;
                }
                "overrideable" => match self.parse_expr()? {
                    Expression::Literal(Literal::Boolean(flag)) => node.overrideable = flag,
                    _ => return Err(self.error_at_current("'overrideable' must be true or false")),
                },
                other => {
                    return Err(ParseError {
                        message: format!("Unknown constraint field '{}'", other),
                        position: key_token.position,
                    })
                }
            }
        }
        if !saw_expression {
            return Err(ParseError {
                message: format!("Constraint '{}' is missing an expression", node.name),
                position,
            });
        }
        Ok(node)
    }

    // -- Commands --------------------------------------------------

    pub(super) fn parse_command(&mut self) -> ParseResult<CommandNode> {
        let position = self.expect_keyword("command")?.position;
        let name = self.expect_declaration_name("command")?;
        let parameters = self.parse_parameters()?;
        let returns = if self.eat_op("->") {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.skip_newlines();
        self.expect_punct("{")?;
        let mut command = CommandNode {
            name,
            parameters,
            guards: Vec::new(),
            constraints: Vec::new(),
            actions: Vec::new(),
            emits: Vec::new(),
            returns,
            position,
        };
        loop {
            self.skip_separators();
            if self.eat_punct("}") {
                return Ok(command);
            }
            if self.at_eof() {
                return Err(self.error_at_current(format!(
                    "Unterminated command '{}': expected '}}'",
                    command.name
                )));
            }
            self.parse_command_statement(&mut command)?;
        }
    }

    pub(super) fn parse_parameters(&mut self) -> ParseResult<Vec<ParameterNode>> {
        let mut parameters = Vec::new();
        self.expect_punct("(")?;
        loop {
            self.skip_list_separators();
            if self.eat_punct(")") {
                return Ok(parameters);
            }
            let position = self.current().position;
            let name = self.expect_declaration_name("parameter")?;
            let data_type = if self.eat_punct(":") {
                self.parse_type()?
            } else {
                TypeRef::named("any")
            };
            let default_value = if self.eat_op("=") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            parameters.push(ParameterNode {
                name,
                required: default_value.is_none() && !data_type.nullable,
                data_type,
                default_value,
                position,
            });
            if !self.check_punct(",") && !self.check_punct(")") {
                return Err(self.error_at_current(format!(
                    "Expected ',' or ')' in parameter list, found {}",
                    self.describe_current()
                )));
            }
        }
    }

    fn parse_command_statement(&mut self, command: &mut CommandNode) -> ParseResult<()> {
        let token = self.current().clone();
        if token.kind != TokenKind::Keyword {
            return Err(self.error_at_current(format!(
                "Expected a command statement, found {}",
                self.describe_current()
            )));
        }
        match token.value.as_str() {
            "guard" => {
                self.advance();
                command.guards.push(self.parse_expr()?);
            }
            "constraint" => {
                let constraint = self.parse_constraint()?;
                command.constraints.push(constraint);
            }
            "emit" => {
                self.advance();
                command.emits.push(self.expect_name("event")?);
            }
            "mutate" | "compute" => {
                self.advance();
                let kind = if token.value == "mutate" {
                    ActionKind::Mutate
                } else {
                    ActionKind::Compute
                };
                let target = self.parse_action_target()?;
                self.expect_op("=")?;
                let expression = self.parse_expr()?;
                command.actions.push(ActionNode {
                    kind,
                    target: Some(target),
                    expression,
                    position: token.position,
                });
            }
            "publish" => {
                self.advance();
                let target = self.expect_name("event")?;
                let expression = if self.at_statement_end() {
                    Expression::Object(Vec::new())
                } else {
                    self.parse_expr()?
                };
                command.actions.push(ActionNode {
                    kind: ActionKind::Publish,
                    target: Some(target),
                    expression,
                    position: token.position,
                });
            }
            "effect" => {
                self.advance();
                let expression = self.parse_expr()?;
                command.actions.push(ActionNode {
                    kind: ActionKind::Effect,
                    target: None,
                    expression,
                    position: token.position,
                });
            }
            "persist" => {
                self.advance();
                command.actions.push(ActionNode {
                    kind: ActionKind::Persist,
                    target: None,
                    expression: Expression::Identifier("self".to_string()),
                    position: token.position,
                });
            }
            "return" => {
                self.advance();
                let expression = self.parse_expr()?;
                command.actions.push(ActionNode {
                    kind: ActionKind::Compute,
                    target: None,
                    expression,
                    position: token.position,
                });
            }
            other => {
                return Err(ParseError {
                    message: format!("Unexpected keyword '{}' in command '{}'", other, command.name),
                    position: token.position,
                })
            }
        }
        Ok(())
    }

    /// `field`, or `self.field` / `this.field`.
    fn parse_action_target(&mut self) -> ParseResult<String> {
        if (self.check_keyword("self") || self.check_keyword("this"))
            && self.peek_next().is(TokenKind::Operator, ".")
        {
            self.advance();
            self.advance();
        }
        self.expect_name("mutation target")
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.current().kind, TokenKind::Newline | TokenKind::Eof)
            || self.check_punct(";")
            || self.check_punct("}")
    }

    // -- Policies --------------------------------------------------

    pub(super) fn parse_policy(&mut self) -> ParseResult<PolicyNode> {
        let position = self.expect_keyword("policy")?.position;
        let name = self.expect_name("policy")?;
        let action = if self.check_punct(":") {
            "all".to_string()
        } else {
            let token = self.current().clone();
            if !POLICY_ACTIONS.contains(&token.value.as_str()) {
                return Err(self.error_at_current(format!(
                    "Expected policy action (read, write, delete, execute, all, override), found {}",
                    self.describe_current()
                )));
            }
            self.advance().value
        };
        self.expect_punct(":")?;
        let expression = self.parse_expr()?;
        let message = if self.current().kind == TokenKind::String {
            Some(self.advance().value)
        } else {
            None
        };
        Ok(PolicyNode {
            name,
            action,
            expression,
            message,
            position,
        })
    }

    // -- Stores ----------------------------------------------------

    /// Inside an entity: `store memory`, `store in memory`, `store memory { ... }`.
    fn parse_entity_store(&mut self, entity: &str) -> ParseResult<StoreNode> {
        let position = self.expect_keyword("store")?.position;
        self.eat_keyword("in");
        let target = self.expect_name("store target")?;
        let config = self.parse_optional_config()?;
        Ok(StoreNode {
            entity: entity.to_string(),
            target,
            config,
            position,
        })
    }

    /// Top level: `store Entity in target [{ ... }]`.
    pub(super) fn parse_store_declaration(&mut self) -> ParseResult<StoreNode> {
        let position = self.expect_keyword("store")?.position;
        let entity = self.expect_name("entity")?;
        self.expect_keyword("in")?;
        let target = self.expect_name("store target")?;
        let config = self.parse_optional_config()?;
        Ok(StoreNode {
            entity,
            target,
            config,
            position,
        })
    }

    fn parse_optional_config(&mut self) -> ParseResult<Vec<(String, Expression)>> {
        self.skip_newlines_before("{");
        if !self.check_punct("{") {
            return Ok(Vec::new());
        }
        match self.parse_primary()? {
            Expression::Object(entries) => Ok(entries),
            _ => Err(self.error_at_current("Expected a configuration block")),
        }
    }

    // -- Events ----------------------------------------------------

    pub(super) fn parse_event(&mut self) -> ParseResult<OutboxEventNode> {
        let position = self.expect_keyword("event")?.position;
        let name = self.expect_name("event")?;
        let channel = if self.eat_punct(":") {
            Some(self.expect_string("channel")?)
        } else {
            None
        };
        let mut payload = Vec::new();
        self.skip_newlines_before("{");
        if self.eat_punct("{") {
            loop {
                self.skip_list_separators();
                if self.eat_punct("}") {
                    break;
                }
                let field = self.expect_name("payload field")?;
                self.expect_punct(":")?;
                let data_type = self.parse_type()?;
                payload.push(EventField {
                    name: field,
                    data_type,
                });
            }
        }
        Ok(OutboxEventNode {
            name,
            channel,
            payload,
            position,
        })
    }

    // -- Flow / effect / expose / compose ---------------------------

    pub(super) fn parse_flow(&mut self) -> ParseResult<FlowNode> {
        let position = self.expect_keyword("flow")?.position;
        let name = self.expect_declaration_name("flow")?;
        let parameters = if self.check_punct("(") {
            self.parse_parameters()?
        } else {
            Vec::new()
        };
        let returns = if self.eat_op("->") {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.skip_newlines();
        self.expect_punct("{")?;
        let mut steps = Vec::new();
        loop {
            self.skip_list_separators();
            if self.eat_punct("}") {
                break;
            }
            let step = self.expect_name("flow step")?;
            self.expect_punct(":")?;
            let expression = self.parse_expr()?;
            steps.push(FlowStep {
                name: step,
                expression,
            });
        }
        Ok(FlowNode {
            name,
            parameters,
            returns,
            steps,
            position,
        })
    }

    pub(super) fn parse_effect(&mut self) -> ParseResult<EffectNode> {
        let position = self.expect_keyword("effect")?.position;
        let name = self.expect_declaration_name("effect")?;
        self.expect_punct(":")?;
        let kind = if self.current().kind == TokenKind::String {
            self.advance().value
        } else {
            self.expect_name("effect kind")?
        };
        let config = self.parse_optional_config()?;
        Ok(EffectNode {
            name,
            kind,
            config,
            position,
        })
    }

    pub(super) fn parse_expose(&mut self) -> ParseResult<ExposeNode> {
        let position = self.expect_keyword("expose")?.position;
        let entity = self.expect_name("entity")?;
        self.expect_keyword("as")?;
        let protocol = if self.current().kind == TokenKind::String {
            self.advance().value
        } else {
            self.expect_name("protocol")?
        };
        let mut operations = Vec::new();
        self.skip_newlines_before("{");
        if self.eat_punct("{") {
            loop {
                self.skip_list_separators();
                if self.eat_punct("}") {
                    break;
                }
                operations.push(self.expect_name("operation")?);
            }
        }
        Ok(ExposeNode {
            entity,
            protocol,
            operations,
            position,
        })
    }

    pub(super) fn parse_compose(&mut self) -> ParseResult<CompositionNode> {
        let position = self.expect_keyword("compose")?.position;
        let name = self.expect_declaration_name("composition")?;
        self.skip_newlines();
        self.expect_punct("{")?;
        let mut components = Vec::new();
        let mut connections = Vec::new();
        loop {
            self.skip_list_separators();
            if self.eat_punct("}") {
                break;
            }
            if self.current().is(TokenKind::Identifier, "connect") {
                self.advance();
                let from = self.parse_dotted_path()?;
                self.expect_op("->")?;
                let to = self.parse_dotted_path()?;
                connections.push(Connection { from, to });
            } else {
                components.push(self.expect_name("component")?);
            }
        }
        Ok(CompositionNode {
            name,
            components,
            connections,
            position,
        })
    }

    fn parse_dotted_path(&mut self) -> ParseResult<String> {
        let mut path = self.expect_name("path segment")?;
        while self.eat_op(".") {
            path.push('.');
            path.push_str(&self.expect_name("path segment")?);
        }
        Ok(path)
    }
}
