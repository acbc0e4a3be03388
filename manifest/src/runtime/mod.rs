//! Runtime engine.
//!
//! A [`RuntimeEngine`] executes one immutable IR against per-entity
//! stores and a request context. Commands run as a short-circuiting
//! pipeline:
//!
//! 1. policies (`execute` / `all`), first denial wins
//! 2. guards, in order, first failure wins
//! 3. command constraints, all evaluated, `block` failures stop the command
//! 4. actions, with the evaluation scope refreshed after every write
//! 5. declared events, logged and sent to listeners
//!
//! Denials and failures come back as data in [`CommandResult`]. Only
//! environment problems (bad provenance, unavailable store targets) make
//! [`RuntimeEngine::new`] fail.

pub mod environment;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod outcome;
pub mod render;
pub mod store;
pub mod values;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub use environment::Environment;
pub use error::{RuntimeError, RuntimeResult};
pub use evaluator::{Builtins, Clock, Evaluator, IdGenerator};
pub use events::{EmittedEvent, EventBus, EventProvenance, ListenerError, Subscription};
pub use outcome::{
    CommandResult, ConstraintOutcome, GuardFailure, OverrideRequest, PolicyDenial, ResolvedValue,
    WriteOutcome, WriteRejection,
};
pub use store::{Instance, MemoryStore, Store, StoreProvider};
pub use values::Value;

use crate::ir::hash::compute_ir_hash;
use crate::ir::{
    ActionKind, ConstraintSeverity, IrCommand, IrConstraint, IrEntity, IrExpression, Ir,
    RelationshipKind,
};
use render::{context_keys, render_expression, resolve_sub_values};
use store::MEMORY_TARGET;

/// What happens when computed properties depend on each other in a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputedCycleMode {
    /// Raise [`RuntimeError::ComputedCycle`].
    #[default]
    Strict,
    /// Resolve the repeated property to `undefined`.
    Permissive,
}

#[derive(Clone)]
pub struct RuntimeOptions {
    pub generate_id: IdGenerator,
    pub now: Clock,
    pub store_provider: Option<StoreProvider>,
    pub require_valid_provenance: bool,
    pub expected_ir_hash: Option<String>,
    pub computed_cycles: ComputedCycleMode,
    pub enforce_versions: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            generate_id: evaluator::random_ids(),
            now: evaluator::system_clock(),
            store_provider: None,
            require_valid_provenance: false,
            expected_ir_hash: None,
            computed_cycles: ComputedCycleMode::Strict,
            enforce_versions: true,
        }
    }
}

impl fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("store_provider", &self.store_provider.is_some())
            .field("require_valid_provenance", &self.require_valid_provenance)
            .field("expected_ir_hash", &self.expected_ir_hash)
            .field("computed_cycles", &self.computed_cycles)
            .field("enforce_versions", &self.enforce_versions)
            .finish_non_exhaustive()
    }
}

impl RuntimeOptions {
    pub fn with_clock(mut self, now: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.now = Arc::new(now);
        self
    }

    pub fn with_id_generator(mut self, ids: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.generate_id = Arc::new(ids);
        self
    }

    pub fn with_store_provider(
        mut self,
        provider: impl Fn(&str) -> Option<Arc<dyn Store>> + Send + Sync + 'static,
    ) -> Self {
        self.store_provider = Some(Arc::new(provider));
        self
    }
}

/// Request context: `user` plus arbitrary named values, bound as `user`
/// and `context` during evaluation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<serde_json::Value>,
    #[serde(flatten)]
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl RuntimeContext {
    pub fn with_user(user: serde_json::Value) -> Self {
        RuntimeContext {
            user: Some(user),
            values: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub entity_name: Option<String>,
    pub instance_id: Option<String>,
    pub overrides: Vec<OverrideRequest>,
}

impl CommandOptions {
    pub fn for_entity(entity: impl Into<String>) -> Self {
        CommandOptions {
            entity_name: Some(entity.into()),
            ..Self::default()
        }
    }

    pub fn on_instance(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn with_override(mut self, constraint_code: impl Into<String>) -> Self {
        self.overrides.push(OverrideRequest {
            constraint_code: constraint_code.into(),
            reason: None,
        });
        self
    }
}

pub struct RuntimeEngine {
    ir: Arc<Ir>,
    options: RuntimeOptions,
    builtins: Builtins,
    context: RuntimeContext,
    stores: HashMap<String, Arc<dyn Store>>,
    events: EventBus,
}

impl fmt::Debug for RuntimeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeEngine")
            .field("ir_hash", &self.ir.provenance.ir_hash)
            .field("options", &self.options)
            .field("context", &self.context)
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .field("events", &self.events)
            .finish()
    }
}

impl RuntimeEngine {
    pub fn new(
        ir: impl Into<Arc<Ir>>,
        context: RuntimeContext,
        options: RuntimeOptions,
    ) -> RuntimeResult<Self> {
        let ir = ir.into();
        if options.require_valid_provenance {
            verify_provenance(&ir, options.expected_ir_hash.as_deref())?;
        }
        let stores = resolve_stores(&ir, &options)?;
        info!(
            "runtime engine ready: {} entities, {} commands",
            ir.entities.len(),
            ir.commands.len()
        );
        Ok(RuntimeEngine {
            builtins: Builtins::new(options.now.clone(), options.generate_id.clone()),
            ir,
            options,
            context,
            stores,
            events: EventBus::new(),
        })
    }

    pub fn ir(&self) -> &Ir {
        &self.ir
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    pub fn set_user(&mut self, user: Option<serde_json::Value>) {
        self.context.user = user;
    }

    pub fn set_context_value(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.context.values.insert(key.into(), value);
    }

    pub fn replace_context(&mut self, context: RuntimeContext) {
        self.context = context;
    }

    // -- Events ------------------------------------------------------

    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EmittedEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn event_log(&self) -> Vec<EmittedEvent> {
        self.events.log()
    }

    pub fn clear_event_log(&self) {
        self.events.clear();
    }

    // -- Scope -------------------------------------------------------

    fn evaluator(&self) -> Evaluator<'_> {
        Evaluator::new(&self.builtins)
    }

    fn now(&self) -> i64 {
        self.builtins.now()
    }

    fn user_value(&self) -> Value {
        self.context
            .user
            .as_ref()
            .map(Value::from_json)
            .unwrap_or(Value::Null)
    }

    fn context_value(&self) -> Value {
        let mut map: IndexMap<String, Value> = self
            .context
            .values
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect();
        if let Some(user) = &self.context.user {
            map.insert("user".to_string(), Value::from_json(user));
        }
        Value::Object(map)
    }

    /// Flattened instance fields plus `self`/`this`/`user`/`context`.
    fn scope(&self, instance: Option<&Value>) -> Environment {
        let mut env = Environment::new();
        if let Some(Value::Object(fields)) = instance {
            env.define_all(fields);
        }
        self.bind_reserved(&mut env, instance.cloned().unwrap_or(Value::Null));
        env
    }

    fn bind_reserved(&self, env: &mut Environment, self_value: Value) {
        env.define("self", self_value.clone());
        env.define("this", self_value);
        env.define("user", self.user_value());
        env.define("context", self.context_value());
    }

    /// Evaluate a standalone expression with an optional instance bound as `self`.
    pub fn evaluate(&self, expr: &IrExpression, instance: Option<&Instance>) -> RuntimeResult<Value> {
        let instance = instance.map(object_value);
        self.evaluator().evaluate(expr, &self.scope(instance.as_ref()))
    }

    // -- Stores and CRUD ---------------------------------------------

    fn entity(&self, name: &str) -> RuntimeResult<&IrEntity> {
        self.ir
            .entity(name)
            .ok_or_else(|| RuntimeError::UnknownEntity(name.to_string()))
    }

    fn store(&self, entity: &str) -> RuntimeResult<&Arc<dyn Store>> {
        self.stores
            .get(entity)
            .ok_or_else(|| RuntimeError::UnknownEntity(entity.to_string()))
    }

    pub async fn get_all_instances(&self, entity: &str) -> RuntimeResult<Vec<Instance>> {
        self.store(entity)?.get_all().await
    }

    pub async fn get_instance(&self, entity: &str, id: &str) -> RuntimeResult<Option<Instance>> {
        self.store(entity)?.get_by_id(id).await
    }

    pub async fn delete_instance(&self, entity: &str, id: &str) -> RuntimeResult<bool> {
        self.store(entity)?.delete(id).await
    }

    pub async fn clear_store(&self, entity: &str) -> RuntimeResult<()> {
        self.store(entity)?.clear().await
    }

    /// Create with property defaults applied. Rejected only when a `block`
    /// constraint fails; other failed constraints come back as violations.
    pub async fn create_instance(&self, entity_name: &str, data: Instance) -> RuntimeResult<WriteOutcome> {
        let entity = self.entity(entity_name)?;
        let mut merged = Instance::new();
        for property in &entity.properties {
            if let Some(default) = &property.default_value {
                merged.insert(property.name.clone(), Value::from(default).to_json());
            }
        }
        merged.extend(data);
        if self.options.enforce_versions {
            if let Some(version) = &entity.version_property {
                merged.insert(version.clone(), json!(1));
            }
            if let Some(stamp) = &entity.version_at_property {
                merged.insert(stamp.clone(), json!(self.now()));
            }
        }

        let violations = self.violations(entity, &merged)?;
        if violations.iter().any(ConstraintOutcome::is_blocking) {
            debug!("create of {} rejected by constraints", entity_name);
            return Ok(WriteOutcome::rejected(WriteRejection::ConstraintViolation, violations));
        }
        let created = self.store(entity_name)?.create(merged).await?;
        Ok(WriteOutcome::written(created, violations))
    }

    /// Apply `patch` after version, transition and constraint checks.
    pub async fn update_instance(
        &self,
        entity_name: &str,
        id: &str,
        mut patch: Instance,
    ) -> RuntimeResult<WriteOutcome> {
        let entity = self.entity(entity_name)?;
        let store = self.store(entity_name)?;
        let Some(existing) = store.get_by_id(id).await? else {
            return Ok(WriteOutcome::rejected(
                WriteRejection::NotFound { id: id.to_string() },
                Vec::new(),
            ));
        };

        if self.options.enforce_versions {
            if let Some(version) = &entity.version_property {
                let current = existing.get(version).cloned().unwrap_or(serde_json::Value::Null);
                if let Some(claimed) = patch.get(version) {
                    if !json_loose_eq(claimed, &current) {
                        return Ok(WriteOutcome::rejected(
                            WriteRejection::VersionConflict {
                                expected: claimed.clone(),
                                actual: current,
                            },
                            Vec::new(),
                        ));
                    }
                }
                let next = Value::Number(Value::from_json(&current).to_number().max(0.0) + 1.0);
                let next = if current.is_null() { json!(1) } else { next.to_json() };
                patch.insert(version.clone(), next);
            }
            if let Some(stamp) = &entity.version_at_property {
                patch.insert(stamp.clone(), json!(self.now()));
            }
        }

        if let Some(rejection) = check_transitions(entity, &existing, &patch) {
            return Ok(WriteOutcome::rejected(rejection, Vec::new()));
        }

        let mut merged = existing;
        merged.extend(patch.clone());
        let violations = self.violations(entity, &merged)?;
        if violations.iter().any(ConstraintOutcome::is_blocking) {
            debug!("update of {}/{} rejected by constraints", entity_name, id);
            return Ok(WriteOutcome::rejected(WriteRejection::ConstraintViolation, violations));
        }

        match store.update(id, patch).await? {
            Some(updated) => Ok(WriteOutcome::written(updated, violations)),
            None => Ok(WriteOutcome::rejected(
                WriteRejection::NotFound { id: id.to_string() },
                violations,
            )),
        }
    }

    // -- Constraints -------------------------------------------------

    /// Evaluate every entity constraint against `instance`; nothing short-circuits.
    pub fn check_constraints(&self, entity_name: &str, instance: &Instance) -> RuntimeResult<Vec<ConstraintOutcome>> {
        let entity = self.entity(entity_name)?;
        let value = object_value(instance);
        let env = self.scope(Some(&value));
        self.constraint_outcomes(&entity.constraints, &env, &[], PolicyScope::of_entity(entity))
    }

    fn violations(&self, entity: &IrEntity, instance: &Instance) -> RuntimeResult<Vec<ConstraintOutcome>> {
        let value = object_value(instance);
        let env = self.scope(Some(&value));
        Ok(self
            .constraint_outcomes(&entity.constraints, &env, &[], PolicyScope::of_entity(entity))?
            .into_iter()
            .filter(|o| !o.passed)
            .collect())
    }

    fn constraint_outcomes(
        &self,
        constraints: &[IrConstraint],
        env: &Environment,
        overrides: &[OverrideRequest],
        scope: PolicyScope<'_>,
    ) -> RuntimeResult<Vec<ConstraintOutcome>> {
        let evaluator = self.evaluator();
        let mut outcomes = Vec::with_capacity(constraints.len());
        for constraint in constraints {
            let passed = evaluator.evaluate(&constraint.expression, env)?.is_truthy();
            let details = constraint
                .details
                .iter()
                .map(|(key, expr)| {
                    let value = evaluator
                        .evaluate(expr, env)
                        .map(|v| v.to_json())
                        .unwrap_or(serde_json::Value::Null);
                    (key.clone(), value)
                })
                .collect();
            let overridden = !passed
                && constraint.severity == ConstraintSeverity::Block
                && overrides.iter().any(|o| o.constraint_code == constraint.code)
                && self.override_allowed(constraint, env, scope)?;
            if overridden {
                info!("constraint '{}' overridden", constraint.code);
            }
            outcomes.push(ConstraintOutcome {
                code: constraint.code.clone(),
                constraint_name: constraint.name.clone(),
                severity: constraint.severity,
                passed,
                expression: render_expression(&constraint.expression),
                message: constraint.message.clone(),
                details,
                resolved: if passed {
                    Vec::new()
                } else {
                    resolve_sub_values(&constraint.expression, env, &evaluator)
                },
                overridden,
            });
        }
        Ok(outcomes)
    }

    fn override_allowed(
        &self,
        constraint: &IrConstraint,
        env: &Environment,
        scope: PolicyScope<'_>,
    ) -> RuntimeResult<bool> {
        if !constraint.overrideable {
            return Ok(false);
        }
        let Some(policy_name) = &constraint.override_policy_ref else {
            return Ok(true);
        };
        match self.ir.scoped_policy(policy_name, scope.entity, scope.module) {
            Some(policy) => Ok(self.evaluator().evaluate(&policy.expression, env)?.is_truthy()),
            None => {
                warn!("override policy '{}' not found", policy_name);
                Ok(false)
            }
        }
    }

    // -- Computed properties -----------------------------------------

    pub fn evaluate_computed(&self, entity_name: &str, instance: &Instance, property: &str) -> RuntimeResult<Value> {
        let entity = self.entity(entity_name)?;
        if entity.computed(property).is_none() {
            return Err(RuntimeError::UnknownComputed {
                entity: entity_name.to_string(),
                property: property.to_string(),
            });
        }
        self.computed_value(entity, instance, property, &mut Vec::new())
    }

    /// `instance` plus every computed property of its entity.
    pub fn instance_with_computed(&self, entity_name: &str, instance: &Instance) -> RuntimeResult<Instance> {
        let entity = self.entity(entity_name)?;
        let mut out = instance.clone();
        for computed in &entity.computed_properties {
            let value = self.computed_value(entity, instance, &computed.name, &mut Vec::new())?;
            out.insert(computed.name.clone(), value.to_json());
        }
        Ok(out)
    }

    /// Depth-first: computed dependencies are resolved first and overlaid on
    /// the instance fields. `visiting` holds the current resolution path.
    fn computed_value(
        &self,
        entity: &IrEntity,
        instance: &Instance,
        name: &str,
        visiting: &mut Vec<String>,
    ) -> RuntimeResult<Value> {
        let Some(computed) = entity.computed(name) else {
            return Ok(Value::Undefined);
        };
        if visiting.iter().any(|v| v == name) {
            return match self.options.computed_cycles {
                ComputedCycleMode::Strict => Err(RuntimeError::ComputedCycle {
                    entity: entity.name.clone(),
                    property: name.to_string(),
                }),
                ComputedCycleMode::Permissive => Ok(Value::Undefined),
            };
        }

        visiting.push(name.to_string());
        let mut fields: IndexMap<String, Value> = instance
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect();
        for dependency in &computed.dependencies {
            if entity.computed(dependency).is_some() {
                let value = self.computed_value(entity, instance, dependency, visiting)?;
                fields.insert(dependency.clone(), value);
            }
        }
        visiting.pop();

        let overlay = Value::Object(fields);
        self.evaluator()
            .evaluate(&computed.expression, &self.scope(Some(&overlay)))
    }

    // -- Relationships -----------------------------------------------

    /// Resolve a declared relationship of one instance through the stores.
    pub async fn get_related(
        &self,
        entity_name: &str,
        id: &str,
        relationship: &str,
    ) -> RuntimeResult<Vec<Instance>> {
        let entity = self.entity(entity_name)?;
        let rel = entity
            .relationship(relationship)
            .ok_or_else(|| RuntimeError::UnknownRelationship {
                entity: entity_name.to_string(),
                relationship: relationship.to_string(),
            })?;
        let Some(source) = self.get_instance(entity_name, id).await? else {
            return Ok(Vec::new());
        };

        match rel.kind {
            RelationshipKind::BelongsTo | RelationshipKind::Ref => {
                let key = rel
                    .foreign_key
                    .clone()
                    .unwrap_or_else(|| format!("{}Id", rel.name));
                let Some(target_id) = source.get(&key).and_then(json_id) else {
                    return Ok(Vec::new());
                };
                Ok(self
                    .get_instance(&rel.target, &target_id)
                    .await?
                    .into_iter()
                    .collect())
            }
            RelationshipKind::HasMany | RelationshipKind::HasOne => {
                let owner_key = format!("{}Id", lower_camel(entity_name));
                let related: Vec<Instance> = match &rel.through {
                    Some(join) => {
                        let target_key = rel
                            .foreign_key
                            .clone()
                            .unwrap_or_else(|| format!("{}Id", lower_camel(&rel.target)));
                        let mut out = Vec::new();
                        for row in self.get_all_instances(join).await? {
                            if !matches_id(row.get(&owner_key), id) {
                                continue;
                            }
                            if let Some(target_id) = row.get(&target_key).and_then(json_id) {
                                if let Some(target) = self.get_instance(&rel.target, &target_id).await? {
                                    out.push(target);
                                }
                            }
                        }
                        out
                    }
                    None => {
                        let key = rel.foreign_key.clone().unwrap_or(owner_key);
                        self.get_all_instances(&rel.target)
                            .await?
                            .into_iter()
                            .filter(|t| matches_id(t.get(&key), id))
                            .collect()
                    }
                };
                if rel.kind == RelationshipKind::HasOne {
                    Ok(related.into_iter().take(1).collect())
                } else {
                    Ok(related)
                }
            }
        }
    }

    // -- Commands ----------------------------------------------------

    /// Run a command. Every failure, including unknown commands and
    /// evaluation errors, is reported in the result.
    pub async fn run_command(&self, name: &str, input: Instance, options: CommandOptions) -> CommandResult {
        match self.execute(name, &input, &options).await {
            Ok(result) => result,
            Err(e) => {
                debug!("command '{}' failed: {}", name, e);
                CommandResult::failure(e.to_string())
            }
        }
    }

    async fn execute(&self, name: &str, input: &Instance, options: &CommandOptions) -> RuntimeResult<CommandResult> {
        let command = self
            .ir
            .command(name, options.entity_name.as_deref())
            .ok_or_else(|| RuntimeError::UnknownCommand(name.to_string()))?;
        let entity_name = command.entity.clone().or_else(|| options.entity_name.clone());

        let mut instance = match (&entity_name, &options.instance_id) {
            (Some(entity), Some(id)) => self.get_instance(entity, id).await?,
            _ => None,
        };
        let mut env = self.command_scope(command, instance.as_ref(), input);
        let evaluator = self.evaluator();

        if let Some(denial) = self.check_policies(entity_name.as_deref(), &env)? {
            warn!("command '{}' denied by policy '{}'", name, denial.policy_name);
            return Ok(CommandResult::denied(denial));
        }

        for (index, guard) in command.guards.iter().enumerate() {
            if !evaluator.evaluate(guard, &env)?.is_truthy() {
                return Ok(CommandResult::guard_failed(GuardFailure {
                    index: index + 1,
                    expression: render_expression(guard),
                    resolved: resolve_sub_values(guard, &env, &evaluator),
                }));
            }
        }

        let scope = PolicyScope {
            entity: entity_name.as_deref(),
            module: command.module.as_deref(),
        };
        let constraint_outcomes =
            self.constraint_outcomes(&command.constraints, &env, &options.overrides, scope)?;
        let blocking: Vec<&str> = constraint_outcomes
            .iter()
            .filter(|o| o.is_blocking())
            .map(|o| o.constraint_name.as_str())
            .collect();
        if !blocking.is_empty() {
            return Ok(CommandResult {
                error: Some(format!("Constraint violation: {}", blocking.join(", "))),
                constraint_outcomes,
                ..CommandResult::default()
            });
        }

        let mut emitted = Vec::new();
        let mut result = Value::Undefined;
        for action in &command.actions {
            let value = evaluator.evaluate(&action.expression, &env)?;
            match (action.kind, &action.target) {
                (ActionKind::Mutate | ActionKind::Compute, Some(target)) => {
                    match (&entity_name, instance.as_ref().and_then(store::instance_id)) {
                        (Some(entity), Some(id)) => {
                            let mut patch = Instance::new();
                            patch.insert(target.clone(), value.to_json());
                            let outcome = self.update_instance(entity, &id, patch).await?;
                            if !outcome.success {
                                return Ok(CommandResult {
                                    error: Some(format!(
                                        "Write to '{}' rejected: {}",
                                        target,
                                        outcome.describe_rejection()
                                    )),
                                    constraint_outcomes: outcome.violations,
                                    emitted_events: emitted,
                                    ..CommandResult::default()
                                });
                            }
                            if let Some(updated) = outcome.instance {
                                let fields = object_value(&updated);
                                if let Value::Object(map) = &fields {
                                    env.define_all(map);
                                }
                                self.bind_reserved(&mut env, fields);
                                instance = Some(updated);
                            }
                        }
                        _ => env.define(target.clone(), value.clone()),
                    }
                }
                (ActionKind::Publish, target) => {
                    let event_name = target.clone().unwrap_or_else(|| command.name.clone());
                    let event = self.make_event(&event_name, value.to_json());
                    self.events.publish(&event);
                    emitted.push(event);
                }
                _ => {}
            }
            result = value;
        }

        for event_name in &command.emits {
            let mut payload = input.clone();
            payload.insert("result".to_string(), result.to_json());
            let event = self.make_event(event_name, serde_json::Value::Object(payload));
            self.events.publish(&event);
            emitted.push(event);
        }

        debug!("command '{}' succeeded with {} events", name, emitted.len());
        Ok(CommandResult {
            success: true,
            result: Some(result.to_json()),
            constraint_outcomes,
            emitted_events: emitted,
            ..CommandResult::default()
        })
    }

    /// Instance fields overlaid by parameter defaults and call input.
    fn command_scope(&self, command: &IrCommand, instance: Option<&Instance>, input: &Instance) -> Environment {
        let self_value = instance.map(object_value);
        let mut env = Environment::new();
        if let Some(Value::Object(fields)) = &self_value {
            env.define_all(fields);
        }
        for parameter in &command.parameters {
            if let (Some(default), false) = (&parameter.default_value, input.contains_key(&parameter.name)) {
                env.define(parameter.name.clone(), Value::from(default));
            }
        }
        for (key, value) in input {
            env.define(key.clone(), Value::from_json(value));
        }
        self.bind_reserved(&mut env, self_value.unwrap_or(Value::Null));
        env
    }

    fn check_policies(&self, entity: Option<&str>, env: &Environment) -> RuntimeResult<Option<PolicyDenial>> {
        let evaluator = self.evaluator();
        let applicable = self.ir.policies.iter().filter(|p| {
            p.action.applies_to_execute() && (p.entity.is_none() || p.entity.as_deref() == entity)
        });
        for policy in applicable {
            if evaluator.evaluate(&policy.expression, env)?.is_truthy() {
                continue;
            }
            return Ok(Some(PolicyDenial {
                policy_name: policy.name.clone(),
                expression: render_expression(&policy.expression),
                message: policy
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Denied by policy '{}'", policy.name)),
                context_keys: context_keys(&policy.expression),
                resolved: resolve_sub_values(&policy.expression, env, &evaluator),
            }));
        }
        Ok(None)
    }

    fn make_event(&self, name: &str, payload: serde_json::Value) -> EmittedEvent {
        let channel = self
            .ir
            .event(name)
            .map(|e| e.channel.clone())
            .unwrap_or_else(|| name.to_string());
        let provenance = &self.ir.provenance;
        EmittedEvent {
            name: name.to_string(),
            channel,
            payload,
            timestamp: self.now(),
            provenance: (!provenance.ir_hash.is_empty()).then(|| EventProvenance {
                content_hash: provenance.content_hash.clone(),
                ir_hash: provenance.ir_hash.clone(),
                compiler_version: provenance.compiler_version.clone(),
            }),
        }
    }
}

/// Where a constraint is declared, for resolving its override policy.
#[derive(Debug, Clone, Copy)]
struct PolicyScope<'a> {
    entity: Option<&'a str>,
    module: Option<&'a str>,
}

impl<'a> PolicyScope<'a> {
    fn of_entity(entity: &'a IrEntity) -> Self {
        PolicyScope {
            entity: Some(&entity.name),
            module: entity.module.as_deref(),
        }
    }
}

fn verify_provenance(ir: &Ir, expected: Option<&str>) -> RuntimeResult<()> {
    let actual = compute_ir_hash(ir)?;
    if actual != ir.provenance.ir_hash {
        return Err(RuntimeError::ProvenanceMismatch {
            expected: ir.provenance.ir_hash.clone(),
            actual,
        });
    }
    if let Some(expected) = expected {
        if expected != actual {
            return Err(RuntimeError::ProvenanceMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }
    Ok(())
}

/// One store per entity: the provider's if it has one, else the IR
/// declaration, else memory.
fn resolve_stores(ir: &Ir, options: &RuntimeOptions) -> RuntimeResult<HashMap<String, Arc<dyn Store>>> {
    let mut stores: HashMap<String, Arc<dyn Store>> = HashMap::new();
    for entity in &ir.entities {
        if let Some(store) = options.store_provider.as_ref().and_then(|p| p(&entity.name)) {
            stores.insert(entity.name.clone(), store);
            continue;
        }
        let target = ir
            .store_for(&entity.name)
            .map(|s| s.target.as_str())
            .unwrap_or(MEMORY_TARGET);
        if target != MEMORY_TARGET {
            return Err(RuntimeError::StoreUnavailable {
                entity: entity.name.clone(),
                target: target.to_string(),
            });
        }
        stores.insert(
            entity.name.clone(),
            Arc::new(MemoryStore::new(options.generate_id.clone())),
        );
    }
    Ok(stores)
}

/// A changed property with rules for its old value must move to a listed value.
fn check_transitions(entity: &IrEntity, existing: &Instance, patch: &Instance) -> Option<WriteRejection> {
    for (property, next) in patch {
        let previous = existing.get(property).cloned().unwrap_or(serde_json::Value::Null);
        if json_loose_eq(&previous, next) {
            continue;
        }
        let previous_value = Value::from_json(&previous);
        let allowed: Vec<serde_json::Value> = entity
            .transitions
            .iter()
            .filter(|t| &t.property == property && Value::from(&t.from).loose_eq(&previous_value))
            .flat_map(|t| t.to.iter().map(|v| Value::from(v).to_json()))
            .collect();
        if allowed.is_empty() {
            continue;
        }
        if !allowed.iter().any(|a| json_loose_eq(a, next)) {
            return Some(WriteRejection::InvalidTransition {
                property: property.clone(),
                from: previous,
                to: next.clone(),
                allowed,
            });
        }
    }
    None
}

fn object_value(instance: &Instance) -> Value {
    Value::Object(
        instance
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect(),
    )
}

fn json_loose_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    Value::from_json(a).loose_eq(&Value::from_json(b))
}

fn json_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn matches_id(value: Option<&serde_json::Value>, id: &str) -> bool {
    value.and_then(json_id).as_deref() == Some(id)
}

fn lower_camel(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_camel_case() {
        assert_eq!(lower_camel("OrderLine"), "orderLine");
        assert_eq!(lower_camel(""), "");
    }

    #[test]
    fn command_options_builder() {
        let options = CommandOptions::for_entity("Order").on_instance("o1").with_override("MAX");
        assert_eq!(options.entity_name.as_deref(), Some("Order"));
        assert_eq!(options.instance_id.as_deref(), Some("o1"));
        assert_eq!(options.overrides[0].constraint_code, "MAX");
    }

    #[test]
    fn context_serializes_flat() {
        let mut context = RuntimeContext::with_user(json!({"id": "u1"}));
        context.values.insert("tenant".to_string(), json!("acme"));
        assert_eq!(
            serde_json::to_value(&context).unwrap(),
            json!({"user": {"id": "u1"}, "tenant": "acme"})
        );
    }
}
