//! AST to IR lowering.
//!
//! `compile_to_ir` never fails with `Err`: parse and semantic problems are
//! returned as diagnostics and any error-severity diagnostic leaves `ir`
//! empty. `IrCompiler` adds the content-addressed cache on top.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::cache::IrCache;
use super::hash::{compute_ir_hash, content_hash};
use super::*;
use crate::ast::{self, Expression, Literal, Program};
use crate::diagnostics::{codes, has_errors, Diagnostic};
use crate::lexer::{Position, UnknownCharPolicy};
use crate::parser::{parse_with_depth, DEFAULT_MAX_NESTING_DEPTH};

/// Names that never count as computed-property dependencies.
const RESERVED_BINDINGS: &[&str] = &["self", "this", "user", "context", "true", "false", "null"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub use_cache: bool,
    pub unknown_characters: UnknownCharPolicy,
    pub max_nesting_depth: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            unknown_characters: UnknownCharPolicy::Warn,
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileOutput {
    pub ir: Option<Ir>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileOutput {
    pub fn has_errors(&self) -> bool {
        has_errors(&self.diagnostics)
    }

    fn failed(diagnostics: Vec<Diagnostic>) -> Self {
        CompileOutput {
            ir: None,
            diagnostics,
        }
    }
}

/// Compile without caching. `options.use_cache` is ignored here.
pub fn compile_to_ir(source: &str, options: &CompileOptions) -> CompileOutput {
    let parsed = parse_with_depth(source, options.unknown_characters, options.max_nesting_depth);
    let mut diagnostics = parsed.diagnostics;
    if has_errors(&diagnostics) {
        debug!("compile aborted: {} parse diagnostics", diagnostics.len());
        return CompileOutput::failed(diagnostics);
    }

    let mut lowering = Lowering::default();
    let mut ir = lowering.lower(&parsed.program, content_hash(source));
    diagnostics.append(&mut lowering.diagnostics);
    if has_errors(&diagnostics) {
        debug!("compile aborted: semantic errors");
        return CompileOutput::failed(diagnostics);
    }

    match compute_ir_hash(&ir) {
        Ok(hash) => ir.provenance.ir_hash = hash,
        Err(e) => {
            diagnostics.push(Diagnostic::error(format!("Failed to hash IR: {}", e)));
            return CompileOutput::failed(diagnostics);
        }
    }
    debug!(
        "compiled IR {}: {} entities, {} commands",
        ir.provenance.ir_hash,
        ir.entities.len(),
        ir.commands.len()
    );
    CompileOutput {
        ir: Some(ir),
        diagnostics,
    }
}

/// Compiler front end that owns a cache of successful compiles.
#[derive(Debug, Default)]
pub struct IrCompiler {
    options: CompileOptions,
    cache: IrCache,
}

impl IrCompiler {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            options,
            cache: IrCache::new(),
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn compile(&mut self, source: &str) -> CompileOutput {
        if !self.options.use_cache {
            return compile_to_ir(source, &self.options);
        }
        let key = content_hash(source);
        if let Some(hit) = self.cache.get(&key) {
            info!("IR cache hit for {}", key);
            return hit.clone();
        }
        let output = compile_to_ir(source, &self.options);
        self.cache.insert(key, &output);
        output
    }

    pub fn cache(&self) -> &IrCache {
        &self.cache
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

// --- Lowering ---

#[derive(Default)]
struct Lowering {
    diagnostics: Vec<Diagnostic>,
}

impl Lowering {
    fn lower(&mut self, program: &Program, content_hash: String) -> Ir {
        let mut ir = Ir {
            version: IR_VERSION.to_string(),
            provenance: IrProvenance {
                content_hash,
                ir_hash: String::new(),
                compiler_version: COMPILER_VERSION.to_string(),
                schema_version: SCHEMA_VERSION.to_string(),
                compiled_at: Utc::now().to_rfc3339(),
            },
            modules: Vec::new(),
            entities: Vec::new(),
            stores: Vec::new(),
            events: Vec::new(),
            commands: Vec::new(),
            policies: Vec::new(),
        };

        for module in &program.modules {
            let scope = Some(module.name.as_str());
            let mut lowered = IrModule {
                name: module.name.clone(),
                ..IrModule::default()
            };
            for entity in &module.entities {
                lowered.entities.push(entity.name.clone());
                self.lower_entity(entity, scope, &mut ir);
            }
            for command in &module.commands {
                lowered.commands.push(command.name.clone());
                let command = self.lower_command(command, None, scope);
                ir.commands.push(command);
            }
            for policy in &module.policies {
                lowered.policies.push(policy.name.clone());
                ir.policies.push(self.lower_policy(policy, None, scope));
            }
            for store in &module.stores {
                lowered.stores.push(store.entity.clone());
                let store = self.lower_store(store);
                ir.stores.push(store);
            }
            for event in &module.events {
                lowered.events.push(event.name.clone());
                ir.events.push(lower_event(event));
            }
            ir.modules.push(lowered);
        }

        for entity in &program.entities {
            self.lower_entity(entity, None, &mut ir);
        }
        for command in &program.commands {
            let command = self.lower_command(command, None, None);
            ir.commands.push(command);
        }
        for policy in &program.policies {
            ir.policies.push(self.lower_policy(policy, None, None));
        }
        for store in &program.stores {
            let store = self.lower_store(store);
            ir.stores.push(store);
        }
        ir.events.extend(program.events.iter().map(lower_event));

        self.note_unlowered(program);
        ir
    }

    fn lower_entity(&mut self, entity: &ast::EntityNode, module: Option<&str>, ir: &mut Ir) {
        let properties = entity
            .properties
            .iter()
            .map(|p| IrProperty {
                name: p.name.clone(),
                data_type: lower_type(&p.data_type),
                default_value: p
                    .default_value
                    .as_ref()
                    .and_then(|d| self.constant(d, &format!("property '{}'", p.name), p.position)),
                modifiers: p
                    .modifiers
                    .iter()
                    .filter_map(|m| PropertyModifier::parse(m))
                    .collect(),
            })
            .collect();

        let computed_properties: Vec<IrComputedProperty> = entity
            .computed_properties
            .iter()
            .map(|c| {
                let expression = lower_expression(&c.expression);
                IrComputedProperty {
                    name: c.name.clone(),
                    data_type: lower_type(&c.data_type),
                    dependencies: extract_dependencies(&expression),
                    expression,
                }
            })
            .collect();
        self.check_computed_cycles(entity, &computed_properties);

        self.check_constraint_codes(&format!("entity '{}'", entity.name), &entity.constraints);
        let constraints = entity.constraints.iter().map(lower_constraint).collect();

        let transitions = entity
            .transitions
            .iter()
            .map(|t| IrTransition {
                property: t.property.clone(),
                from: literal_value(&t.from),
                to: t.to.iter().map(literal_value).collect(),
            })
            .collect();

        for command in &entity.commands {
            let command = self.lower_command(command, Some(&entity.name), module);
            ir.commands.push(command);
        }
        for policy in &entity.policies {
            ir.policies
                .push(self.lower_policy(policy, Some(&entity.name), module));
        }
        if let Some(store) = &entity.store {
            let store = self.lower_store(store);
            ir.stores.push(store);
        }

        ir.entities.push(IrEntity {
            name: entity.name.clone(),
            module: module.map(str::to_string),
            properties,
            computed_properties,
            relationships: entity.relationships.iter().map(lower_relationship).collect(),
            commands: entity.commands.iter().map(|c| c.name.clone()).collect(),
            constraints,
            policies: entity.policies.iter().map(|p| p.name.clone()).collect(),
            version_property: entity.version_property.clone(),
            version_at_property: entity.version_at_property.clone(),
            transitions,
        });
    }

    fn lower_command(
        &mut self,
        command: &ast::CommandNode,
        entity: Option<&str>,
        module: Option<&str>,
    ) -> IrCommand {
        self.check_constraint_codes(&format!("command '{}'", command.name), &command.constraints);
        let parameters = command
            .parameters
            .iter()
            .map(|p| IrParameter {
                name: p.name.clone(),
                data_type: lower_type(&p.data_type),
                required: p.required,
                default_value: p
                    .default_value
                    .as_ref()
                    .and_then(|d| self.constant(d, &format!("parameter '{}'", p.name), p.position)),
            })
            .collect();
        IrCommand {
            name: command.name.clone(),
            module: module.map(str::to_string),
            entity: entity.map(str::to_string),
            parameters,
            guards: command.guards.iter().map(lower_expression).collect(),
            constraints: command.constraints.iter().map(lower_constraint).collect(),
            actions: command
                .actions
                .iter()
                .map(|a| IrAction {
                    kind: lower_action_kind(a.kind),
                    target: a.target.clone(),
                    expression: lower_expression(&a.expression),
                })
                .collect(),
            emits: command.emits.clone(),
            returns: command.returns.as_ref().map(lower_type),
        }
    }

    fn lower_policy(
        &mut self,
        policy: &ast::PolicyNode,
        entity: Option<&str>,
        module: Option<&str>,
    ) -> IrPolicy {
        IrPolicy {
            name: policy.name.clone(),
            module: module.map(str::to_string),
            entity: entity.map(str::to_string),
            action: PolicyAction::parse(&policy.action).unwrap_or(PolicyAction::All),
            expression: lower_expression(&policy.expression),
            message: policy.message.clone(),
        }
    }

    fn lower_store(&mut self, store: &ast::StoreNode) -> IrStore {
        let mut config = IndexMap::new();
        for (key, value) in &store.config {
            let what = format!("store option '{}'", key);
            if let Some(value) = self.constant(value, &what, store.position) {
                config.insert(key.clone(), value);
            }
        }
        IrStore {
            entity: store.entity.clone(),
            target: store.target.clone(),
            config,
        }
    }

    /// Fold a constant expression, or report it.
    fn constant(&mut self, expr: &Expression, what: &str, position: Position) -> Option<IrValue> {
        let value = constant_value(expr);
        if value.is_none() {
            self.diagnostics.push(
                Diagnostic::error(format!("Default value for {} must be a constant", what))
                    .at(position)
                    .with_code(codes::NON_CONSTANT_DEFAULT),
            );
        }
        value
    }

    // -- Semantic checks ---------------------------------------------

    /// Resolved codes (the name when no code is given) must be unique in
    /// one scope. Every repeat is reported against the first holder.
    fn check_constraint_codes(&mut self, scope: &str, constraints: &[ast::ConstraintNode]) {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for constraint in constraints {
            let code = constraint.code.as_deref().unwrap_or(&constraint.name);
            match seen.get(code) {
                Some(first) => self.diagnostics.push(
                    Diagnostic::error(format!(
                        "Duplicate constraint code '{}' in {}: '{}' reuses the code of '{}'",
                        code, scope, constraint.name, first
                    ))
                    .at(constraint.position)
                    .with_code(codes::DUPLICATE_CONSTRAINT_CODE),
                ),
                None => {
                    seen.insert(code, &constraint.name);
                }
            }
        }
    }

    fn check_computed_cycles(&mut self, entity: &ast::EntityNode, computed: &[IrComputedProperty]) {
        let names: HashSet<&str> = computed.iter().map(|c| c.name.as_str()).collect();
        let edges: HashMap<&str, Vec<&str>> = computed
            .iter()
            .map(|c| {
                let deps = c
                    .dependencies
                    .iter()
                    .map(String::as_str)
                    .filter(|d| names.contains(d))
                    .collect();
                (c.name.as_str(), deps)
            })
            .collect();

        let mut reported: HashSet<Vec<&str>> = HashSet::new();
        for (node, source) in computed.iter().zip(&entity.computed_properties) {
            let Some(path) = cycle_through(node.name.as_str(), &edges) else {
                continue;
            };
            let mut members: Vec<&str> = path[..path.len() - 1].to_vec();
            members.sort_unstable();
            if !reported.insert(members) {
                continue;
            }
            self.diagnostics.push(
                Diagnostic::warning(format!(
                    "Computed property cycle in entity '{}': {}",
                    entity.name,
                    path.iter().join(" -> ")
                ))
                .at(source.position)
                .with_code(codes::COMPUTED_CYCLE),
            );
        }
    }

    fn note_unlowered(&mut self, program: &Program) {
        let declarations = program
            .flows
            .iter()
            .map(|f| ("flow", &f.name, f.position))
            .chain(program.effects.iter().map(|e| ("effect", &e.name, e.position)))
            .chain(program.exposures.iter().map(|e| ("expose", &e.entity, e.position)))
            .chain(program.compositions.iter().map(|c| ("compose", &c.name, c.position)));
        for (kind, name, position) in declarations {
            self.diagnostics.push(
                Diagnostic::info(format!("{} '{}' is parsed but not lowered to IR", kind, name))
                    .at(position)
                    .with_code(codes::NOT_LOWERED),
            );
        }
    }
}

/// Path `start -> ... -> start` when `start` can reach itself.
fn cycle_through<'a>(start: &'a str, edges: &HashMap<&'a str, Vec<&'a str>>) -> Option<Vec<&'a str>> {
    fn walk<'a>(
        node: &'a str,
        start: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> bool {
        for &next in edges.get(node).into_iter().flatten() {
            if next == start {
                path.push(next);
                return true;
            }
            if visited.insert(next) {
                path.push(next);
                if walk(next, start, edges, visited, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    let mut visited = HashSet::from([start]);
    let mut path = vec![start];
    walk(start, start, edges, &mut visited, &mut path).then_some(path)
}

// --- Pure lowering helpers ---

fn lower_type(type_ref: &ast::TypeRef) -> IrType {
    IrType {
        name: type_ref.name.clone(),
        generic: type_ref.generic.as_ref().map(|g| Box::new(lower_type(g))),
        nullable: type_ref.nullable,
    }
}

fn lower_relationship(rel: &ast::RelationshipNode) -> IrRelationship {
    IrRelationship {
        name: rel.name.clone(),
        kind: match rel.kind {
            ast::RelationshipKind::HasMany => RelationshipKind::HasMany,
            ast::RelationshipKind::HasOne => RelationshipKind::HasOne,
            ast::RelationshipKind::BelongsTo => RelationshipKind::BelongsTo,
            ast::RelationshipKind::Ref => RelationshipKind::Ref,
        },
        target: rel.target.clone(),
        through: rel.through.clone(),
        foreign_key: rel.foreign_key.clone(),
    }
}

fn lower_constraint(constraint: &ast::ConstraintNode) -> IrConstraint {
    IrConstraint {
        name: constraint.name.clone(),
        code: constraint
            .code
            .clone()
            .unwrap_or_else(|| constraint.name.clone()),
        expression: lower_expression(&constraint.expression),
        severity: constraint
            .severity
            .as_deref()
            .and_then(ConstraintSeverity::parse)
            .unwrap_or_default(),
        message: constraint.message.clone(),
        details: constraint
            .details
            .iter()
            .map(|(k, v)| (k.clone(), lower_expression(v)))
            .collect(),
        overrideable: constraint.overrideable,
        override_policy_ref: constraint.override_policy.clone(),
    }
}

fn lower_event(event: &ast::OutboxEventNode) -> IrEvent {
    IrEvent {
        name: event.name.clone(),
        channel: event.channel.clone().unwrap_or_else(|| event.name.clone()),
        payload: event
            .payload
            .iter()
            .map(|f| IrEventField {
                name: f.name.clone(),
                data_type: lower_type(&f.data_type),
            })
            .collect(),
    }
}

fn lower_action_kind(kind: ast::ActionKind) -> ActionKind {
    match kind {
        ast::ActionKind::Mutate => ActionKind::Mutate,
        ast::ActionKind::Compute => ActionKind::Compute,
        ast::ActionKind::Effect => ActionKind::Effect,
        ast::ActionKind::Publish => ActionKind::Publish,
        ast::ActionKind::Persist => ActionKind::Persist,
    }
}

fn literal_value(literal: &Literal) -> IrValue {
    match literal {
        Literal::String(s) => IrValue::String(s.clone()),
        Literal::Number(n) => IrValue::Number(*n),
        Literal::Boolean(b) => IrValue::Boolean(*b),
        Literal::Null => IrValue::Null,
    }
}

fn constant_value(expr: &Expression) -> Option<IrValue> {
    match expr {
        Expression::Literal(literal) => Some(literal_value(literal)),
        Expression::UnaryOp { operator, operand } if operator == "-" => match constant_value(operand)? {
            IrValue::Number(n) => Some(IrValue::Number(-n)),
            _ => None,
        },
        Expression::Array(items) => items
            .iter()
            .map(constant_value)
            .collect::<Option<Vec<_>>>()
            .map(IrValue::Array),
        Expression::Object(entries) => entries
            .iter()
            .map(|(k, v)| constant_value(v).map(|v| (k.clone(), v)))
            .collect::<Option<IndexMap<_, _>>>()
            .map(IrValue::Object),
        _ => None,
    }
}

pub fn lower_expression(expr: &Expression) -> IrExpression {
    match expr {
        Expression::Literal(literal) => IrExpression::literal(literal_value(literal)),
        Expression::Identifier(name) => IrExpression::identifier(name.clone()),
        Expression::MemberAccess { object, property } => IrExpression::Member {
            object: Box::new(lower_expression(object)),
            property: property.clone(),
        },
        Expression::Index { object, index } => IrExpression::Call {
            callee: Box::new(IrExpression::identifier("at")),
            args: vec![lower_expression(object), lower_expression(index)],
        },
        Expression::BinaryOp {
            operator,
            left,
            right,
        } => IrExpression::Binary {
            operator: operator.clone(),
            left: Box::new(lower_expression(left)),
            right: Box::new(lower_expression(right)),
        },
        Expression::UnaryOp { operator, operand } => IrExpression::Unary {
            operator: operator.clone(),
            operand: Box::new(lower_expression(operand)),
        },
        Expression::Call { callee, arguments } => IrExpression::Call {
            callee: Box::new(lower_expression(callee)),
            args: arguments.iter().map(lower_expression).collect(),
        },
        Expression::Conditional {
            condition,
            consequent,
            alternate,
        } => IrExpression::Conditional {
            condition: Box::new(lower_expression(condition)),
            consequent: Box::new(lower_expression(consequent)),
            alternate: Box::new(lower_expression(alternate)),
        },
        Expression::Array(items) => IrExpression::Array {
            elements: items.iter().map(lower_expression).collect(),
        },
        Expression::Object(entries) => IrExpression::Object {
            properties: entries
                .iter()
                .map(|(key, value)| IrObjectEntry {
                    key: key.clone(),
                    value: lower_expression(value),
                })
                .collect(),
        },
        Expression::Lambda { params, body } => IrExpression::Lambda {
            params: params.clone(),
            body: Box::new(lower_expression(body)),
        },
    }
}

/// Bare identifiers plus `self.x`/`this.x` properties, in first-use order.
/// Reserved bindings, lambda parameters and called function names are left out.
pub fn extract_dependencies(expr: &IrExpression) -> Vec<String> {
    fn push(name: &str, bound: &[String], out: &mut Vec<String>) {
        if !RESERVED_BINDINGS.contains(&name)
            && !bound.iter().any(|b| b == name)
            && !out.iter().any(|o| o == name)
        {
            out.push(name.to_string());
        }
    }

    fn visit(expr: &IrExpression, bound: &mut Vec<String>, out: &mut Vec<String>) {
        match expr {
            IrExpression::Literal { .. } => {}
            IrExpression::Identifier { name } => push(name, bound, out),
            IrExpression::Member { object, property } => match object.as_ref() {
                IrExpression::Identifier { name } if name == "self" || name == "this" => {
                    push(property, bound, out)
                }
                other => visit(other, bound, out),
            },
            IrExpression::Binary { left, right, .. } => {
                visit(left, bound, out);
                visit(right, bound, out);
            }
            IrExpression::Unary { operand, .. } => visit(operand, bound, out),
            IrExpression::Call { callee, args } => {
                if !matches!(callee.as_ref(), IrExpression::Identifier { .. }) {
                    visit(callee, bound, out);
                }
                for arg in args {
                    visit(arg, bound, out);
                }
            }
            IrExpression::Conditional {
                condition,
                consequent,
                alternate,
            } => {
                visit(condition, bound, out);
                visit(consequent, bound, out);
                visit(alternate, bound, out);
            }
            IrExpression::Array { elements } => {
                for element in elements {
                    visit(element, bound, out);
                }
            }
            IrExpression::Object { properties } => {
                for entry in properties {
                    visit(&entry.value, bound, out);
                }
            }
            IrExpression::Lambda { params, body } => {
                let depth = bound.len();
                bound.extend(params.iter().cloned());
                visit(body, bound, out);
                bound.truncate(depth);
            }
        }
    }

    let mut out = Vec::new();
    visit(expr, &mut Vec::new(), &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Severity;
    use pretty_assertions::assert_eq;

    fn compile(source: &str) -> CompileOutput {
        compile_to_ir(source, &CompileOptions::default())
    }

    #[test]
    fn lowers_entity_with_defaults_and_modifiers() {
        let out = compile(
            r#"
            entity Order {
                property required id: string
                property status: string = "draft"
                property tags: list<string> = []
                property balance: number = -5
            }
            "#,
        );
        let ir = out.ir.expect("ir");
        let order = ir.entity("Order").unwrap();
        assert_eq!(order.properties[0].modifiers, vec![PropertyModifier::Required]);
        assert_eq!(
            order.properties[1].default_value,
            Some(IrValue::String("draft".to_string()))
        );
        assert_eq!(order.properties[2].default_value, Some(IrValue::Array(vec![])));
        assert_eq!(order.properties[3].default_value, Some(IrValue::Number(-5.0)));
        assert_eq!(ir.version, "1.0");
        assert!(!ir.provenance.ir_hash.is_empty());
    }

    #[test]
    fn duplicate_constraint_codes_fail_the_compile() {
        let out = compile("entity User { constraint c: true; constraint c: false }");
        assert!(out.ir.is_none());
        let errors: Vec<_> = out.diagnostics.iter().filter(|d| d.is_error()).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code.as_deref(), Some(codes::DUPLICATE_CONSTRAINT_CODE));
        assert!(errors[0].line.is_some());
    }

    #[test]
    fn explicit_codes_collide_across_names() {
        let out = compile(
            r#"entity A {
                constraint first { expression: true, code: "X1" }
                constraint second { expression: false, code: "X1" }
            }"#,
        );
        assert!(out.ir.is_none());
        assert!(out.diagnostics[0].message.contains("'first'"));
    }

    #[test]
    fn command_scope_is_checked_independently() {
        let out = compile(
            r#"entity A {
                constraint c: true
                command run() {
                    constraint c: true
                    mutate x = 1
                }
            }"#,
        );
        assert!(out.ir.is_some(), "{:?}", out.diagnostics);
    }

    #[test]
    fn dependencies_skip_reserved_and_lambda_params() {
        let out = compile(
            r#"entity Cart {
                property items: list<number>
                computed total: number = sum(self.items, (x) => x + tax) + user.bonus
            }"#,
        );
        let ir = out.ir.unwrap();
        let total = &ir.entity("Cart").unwrap().computed_properties[0];
        assert_eq!(total.dependencies, vec!["items".to_string(), "tax".to_string()]);
    }

    #[test]
    fn computed_cycles_warn_once_per_cycle() {
        let out = compile(
            r#"entity Loop {
                computed a: number = b + 1
                computed b: number = a + 1
                computed c: number = c
            }"#,
        );
        assert!(out.ir.is_some());
        let cycles: Vec<_> = out
            .diagnostics
            .iter()
            .filter(|d| d.code.as_deref() == Some(codes::COMPUTED_CYCLE))
            .collect();
        assert_eq!(cycles.len(), 2);
        assert!(cycles.iter().all(|d| d.severity == Severity::Warning));
        assert!(cycles[0].message.contains("a -> b -> a"));
    }

    #[test]
    fn dynamic_index_lowers_to_at_call() {
        let out = compile("entity A { computed v: number = self.values[self.i] }");
        let ir = out.ir.unwrap();
        let expr = &ir.entity("A").unwrap().computed_properties[0].expression;
        assert!(matches!(expr, IrExpression::Call { callee, args }
            if args.len() == 2 && **callee == IrExpression::identifier("at")));
    }

    #[test]
    fn parse_errors_yield_no_ir() {
        let out = compile("entity { }");
        assert!(out.ir.is_none());
        assert!(out.has_errors());
    }

    #[test]
    fn unlowered_declarations_are_noted() {
        let out = compile("flow Checkout(id: string) { total: id }\nexpose A as rest { list }");
        assert!(out.ir.is_some());
        let infos: Vec<_> = out
            .diagnostics
            .iter()
            .filter(|d| d.code.as_deref() == Some(codes::NOT_LOWERED))
            .collect();
        assert_eq!(infos.len(), 2);
    }

    #[test]
    fn non_constant_default_is_an_error() {
        let out = compile("entity A { property v: number = other + 1 }");
        assert!(out.ir.is_none());
        assert_eq!(out.diagnostics[0].code.as_deref(), Some(codes::NON_CONSTANT_DEFAULT));
    }

    #[test]
    fn module_members_carry_module_name() {
        let out = compile(
            r#"module Sales {
                entity Invoice { command pay() { mutate paid = true } }
                event Paid { id: string }
            }"#,
        );
        let ir = out.ir.unwrap();
        assert_eq!(ir.modules[0].entities, vec!["Invoice".to_string()]);
        assert_eq!(ir.entity("Invoice").unwrap().module.as_deref(), Some("Sales"));
        let pay = ir.command("pay", Some("Invoice")).unwrap();
        assert_eq!(pay.module.as_deref(), Some("Sales"));
        assert_eq!(ir.event("Paid").unwrap().channel, "Paid");
    }

    #[test]
    fn cache_serves_repeat_compiles_and_skips_failures() {
        let mut compiler = IrCompiler::default();
        let first = compiler.compile("entity A { property x: number }");
        let second = compiler.compile("entity A { property x: number }");
        assert_eq!(first, second);
        assert_eq!(compiler.cache().len(), 1);

        compiler.compile("entity { broken");
        assert_eq!(compiler.cache().len(), 1);

        let mut uncached = IrCompiler::new(CompileOptions {
            use_cache: false,
            ..CompileOptions::default()
        });
        uncached.compile("entity A { property x: number }");
        assert!(uncached.cache().is_empty());
    }

    #[test]
    fn unknown_characters_follow_policy() {
        let strict = CompileOptions {
            use_cache: false,
            unknown_characters: UnknownCharPolicy::Error,
            ..CompileOptions::default()
        };
        assert!(compile_to_ir("entity A { property x: number } @", &strict).ir.is_none());
        let lenient = compile("entity A { property x: number } @");
        assert!(lenient.ir.is_some());
        assert_eq!(lenient.diagnostics.len(), 1);
    }
}
