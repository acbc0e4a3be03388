//! Recursive-descent parser for Manifest source.
//!
//! The parser never aborts a whole pass on one error. A failure inside a
//! top-level declaration is turned into a diagnostic and the cursor skips
//! ahead to the next top-level keyword, so one run collects every error.

mod declarations;
mod expressions;

use serde::{Deserialize, Serialize};

use crate::ast::{Expression, Program};
use crate::diagnostics::{codes, Diagnostic};
use crate::lexer::{tokenize_with, Position, Token, TokenKind, UnknownCharPolicy};

/// Keywords a resynchronizing parser stops at.
pub const TOP_LEVEL_KEYWORDS: &[&str] = &[
    "module", "entity", "command", "policy", "store", "event", "flow", "effect", "compose",
    "expose",
];

/// Expressions and type arguments nested deeper than this are rejected.
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseOutput {
    pub program: Program,
    pub diagnostics: Vec<Diagnostic>,
}

impl ParseOutput {
    pub fn has_errors(&self) -> bool {
        crate::diagnostics::has_errors(&self.diagnostics)
    }
}

/// Internal failure, converted to a diagnostic at the declaration boundary.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParseError {
    pub message: String,
    pub position: Position,
}

impl ParseError {
    fn into_diagnostic(self) -> Diagnostic {
        Diagnostic::error(self.message)
            .at(self.position)
            .with_code(codes::UNEXPECTED_TOKEN)
    }
}

pub(crate) type ParseResult<T> = Result<T, ParseError>;

pub fn parse(source: &str) -> ParseOutput {
    parse_with(source, UnknownCharPolicy::default())
}

pub fn parse_with(source: &str, policy: UnknownCharPolicy) -> ParseOutput {
    parse_with_depth(source, policy, DEFAULT_MAX_NESTING_DEPTH)
}

/// Like [`parse_with`], with an explicit nesting limit. Input nested past
/// `max_nesting_depth` is reported as P001 and skipped like any other error.
pub fn parse_with_depth(
    source: &str,
    policy: UnknownCharPolicy,
    max_nesting_depth: usize,
) -> ParseOutput {
    let lexed = tokenize_with(source, policy);
    let mut parser = Parser::new(lexed.tokens).with_max_depth(max_nesting_depth);
    let program = parser.parse_program();
    let mut diagnostics = lexed.diagnostics;
    diagnostics.append(&mut parser.diagnostics);
    log::debug!(
        "parsed {} entities, {} commands, {} diagnostics",
        program.entities.len() + program.modules.iter().map(|m| m.entities.len()).sum::<usize>(),
        program.commands.len(),
        diagnostics.len()
    );
    ParseOutput {
        program,
        diagnostics,
    }
}

/// Parse a single standalone expression (used by tooling and tests).
pub fn parse_expression(source: &str) -> Result<Expression, Diagnostic> {
    let lexed = tokenize_with(source, UnknownCharPolicy::Error);
    if let Some(first) = lexed.diagnostics.into_iter().next() {
        return Err(first);
    }
    let mut parser = Parser::new(lexed.tokens);
    parser.skip_newlines();
    let expr = parser.parse_expr().map_err(ParseError::into_diagnostic)?;
    parser.skip_separators();
    if !parser.at_eof() {
        let token = parser.current().clone();
        return Err(parser
            .error_at_current(format!("Unexpected '{}' after expression", token.value))
            .into_diagnostic());
    }
    Ok(expr)
}

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    diagnostics: Vec<Diagnostic>,
    depth: usize,
    max_depth: usize,
}

impl Parser {
    fn new(mut tokens: Vec<Token>) -> Self {
        if tokens.last().map(|t| t.kind) != Some(TokenKind::Eof) {
            let position = tokens.last().map(|t| t.position).unwrap_or_default();
            tokens.push(Token {
                kind: TokenKind::Eof,
                value: String::new(),
                position,
            });
        }
        Parser {
            tokens,
            pos: 0,
            diagnostics: Vec::new(),
            depth: 0,
            max_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }

    fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Run `f` one nesting level deeper, failing once the limit is reached.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        if self.depth >= self.max_depth {
            return Err(self.error_at_current(format!(
                "Expression nested too deeply (limit {})",
                self.max_depth
            )));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    // -- Cursor ---------------------------------------------------

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_next(&self) -> &Token {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn checkpoint(&self) -> usize {
        self.pos
    }

    fn restore(&mut self, checkpoint: usize) {
        self.pos = checkpoint;
    }

    fn check(&self, kind: TokenKind, value: &str) -> bool {
        self.current().is(kind, value)
    }

    fn check_keyword(&self, value: &str) -> bool {
        self.current().is_keyword(value)
    }

    fn check_punct(&self, value: &str) -> bool {
        self.check(TokenKind::Punctuation, value)
    }

    fn check_op(&self, value: &str) -> bool {
        self.check(TokenKind::Operator, value)
    }

    fn eat_keyword(&mut self, value: &str) -> bool {
        if self.check_keyword(value) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_punct(&mut self, value: &str) -> bool {
        if self.check_punct(value) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, value: &str) -> bool {
        if self.check_op(value) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_newlines(&mut self) {
        while self.current().kind == TokenKind::Newline {
            self.advance();
        }
    }

    /// Newlines and `;` both separate statements.
    fn skip_separators(&mut self) {
        while self.current().kind == TokenKind::Newline || self.check_punct(";") {
            self.advance();
        }
    }

    fn skip_list_separators(&mut self) {
        while self.current().kind == TokenKind::Newline
            || self.check_punct(",")
            || self.check_punct(";")
        {
            self.advance();
        }
    }

    // -- Expectations ----------------------------------------------

    fn error_at_current(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            position: self.current().position,
        }
    }

    fn describe_current(&self) -> String {
        let token = self.current();
        match token.kind {
            TokenKind::Eof => "end of input".to_string(),
            TokenKind::Newline => "newline".to_string(),
            kind => format!("{} '{}'", kind, token.value),
        }
    }

    fn expect_punct(&mut self, value: &str) -> ParseResult<Token> {
        if self.check_punct(value) {
            Ok(self.advance())
        } else {
            Err(self.error_at_current(format!(
                "Expected '{}', found {}",
                value,
                self.describe_current()
            )))
        }
    }

    fn expect_op(&mut self, value: &str) -> ParseResult<Token> {
        if self.check_op(value) {
            Ok(self.advance())
        } else {
            Err(self.error_at_current(format!(
                "Expected '{}', found {}",
                value,
                self.describe_current()
            )))
        }
    }

    fn expect_keyword(&mut self, value: &str) -> ParseResult<Token> {
        if self.check_keyword(value) {
            Ok(self.advance())
        } else {
            Err(self.error_at_current(format!(
                "Expected '{}', found {}",
                value,
                self.describe_current()
            )))
        }
    }

    /// A name in a non-declaration position (property, field, member).
    /// Keywords are accepted here.
    fn expect_name(&mut self, what: &str) -> ParseResult<String> {
        match self.current().kind {
            TokenKind::Identifier | TokenKind::Keyword => Ok(self.advance().value),
            _ => Err(self.error_at_current(format!(
                "Expected {} name, found {}",
                what,
                self.describe_current()
            ))),
        }
    }

    /// A name at a declaration site (entity, command, parameter, module).
    /// A keyword is reported but consumed as a placeholder so parsing goes on.
    fn expect_declaration_name(&mut self, what: &str) -> ParseResult<String> {
        match self.current().kind {
            TokenKind::Identifier => Ok(self.advance().value),
            TokenKind::Keyword => {
                let token = self.advance();
                self.diagnostics.push(
                    Diagnostic::error(format!(
                        "Reserved word '{}' cannot be used as a {} name",
                        token.value, what
                    ))
                    .at(token.position)
                    .with_code(codes::RESERVED_WORD),
                );
                Ok(token.value)
            }
            _ => Err(self.error_at_current(format!(
                "Expected {} name, found {}",
                what,
                self.describe_current()
            ))),
        }
    }

    fn expect_string(&mut self, what: &str) -> ParseResult<String> {
        if self.current().kind == TokenKind::String {
            Ok(self.advance().value)
        } else {
            Err(self.error_at_current(format!(
                "Expected {} string, found {}",
                what,
                self.describe_current()
            )))
        }
    }

    // -- Recovery --------------------------------------------------

    fn is_top_level_keyword(token: &Token) -> bool {
        token.kind == TokenKind::Keyword && TOP_LEVEL_KEYWORDS.contains(&token.value.as_str())
    }

    /// Skip to the next top-level keyword outside any brace opened since
    /// `start`. With `stop_at_close`, a `}` closing the enclosing block
    /// also ends the skip (left unconsumed).
    fn synchronize(&mut self, start: usize, stop_at_close: bool) {
        let mut depth: i64 = self.tokens[start..self.pos]
            .iter()
            .map(|t| match (t.kind, t.value.as_str()) {
                (TokenKind::Punctuation, "{") => 1,
                (TokenKind::Punctuation, "}") => -1,
                _ => 0,
            })
            .sum::<i64>()
            .max(0);
        if self.pos == start {
            self.advance();
        }
        while !self.at_eof() {
            let token = self.current();
            if depth == 0 && Self::is_top_level_keyword(token) {
                break;
            }
            if token.is(TokenKind::Punctuation, "{") {
                depth += 1;
            } else if token.is(TokenKind::Punctuation, "}") {
                if depth == 0 && stop_at_close {
                    break;
                }
                depth = (depth - 1).max(0);
            }
            self.advance();
        }
    }

    fn record(&mut self, error: ParseError) {
        log::debug!("parse error at {}: {}", error.position, error.message);
        self.diagnostics.push(error.into_diagnostic());
    }

    // -- Program ---------------------------------------------------

    fn parse_program(&mut self) -> Program {
        let mut program = Program::default();
        loop {
            self.skip_separators();
            if self.at_eof() {
                break;
            }
            let start = self.checkpoint();
            if let Err(error) = self.parse_top_level(&mut program) {
                self.record(error);
                self.synchronize(start, false);
            }
        }
        program
    }

    fn parse_top_level(&mut self, program: &mut Program) -> ParseResult<()> {
        let token = self.current().clone();
        if token.kind != TokenKind::Keyword {
            return Err(self.error_at_current(format!(
                "Expected a declaration, found {}",
                self.describe_current()
            )));
        }
        match token.value.as_str() {
            "module" => {
                let module = self.parse_module()?;
                program.modules.push(module);
            }
            "entity" => {
                let entity = self.parse_entity()?;
                program.entities.push(entity);
            }
            "command" => {
                let command = self.parse_command()?;
                program.commands.push(command);
            }
            "policy" => {
                let policy = self.parse_policy()?;
                program.policies.push(policy);
            }
            "store" => {
                let store = self.parse_store_declaration()?;
                program.stores.push(store);
            }
            "event" => {
                let event = self.parse_event()?;
                program.events.push(event);
            }
            "flow" => {
                let flow = self.parse_flow()?;
                program.flows.push(flow);
            }
            "effect" => {
                let effect = self.parse_effect()?;
                program.effects.push(effect);
            }
            "expose" => {
                let exposure = self.parse_expose()?;
                program.exposures.push(exposure);
            }
            "compose" => {
                let composition = self.parse_compose()?;
                program.compositions.push(composition);
            }
            other => {
                return Err(ParseError {
                    message: format!("Unexpected keyword '{}' at top level", other),
                    position: token.position,
                })
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Literal, RelationshipKind};
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_entity_members() {
        let out = parse(
            r#"
            entity Order {
                property required id: string
                property total: number = 0
                property tags: list<string>?
                computed doubled: number = total * 2
                belongsTo customer: Customer with buyerId
                hasMany lines: OrderLine
                versionProperty version
                versionAtProperty versionAt
            }
            "#,
        );
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let entity = &out.program.entities[0];
        assert_eq!(entity.name, "Order");
        assert_eq!(entity.properties.len(), 3);
        assert_eq!(entity.properties[0].modifiers, vec!["required".to_string()]);
        assert_eq!(
            entity.properties[1].default_value,
            Some(Expression::Literal(Literal::Number(0.0)))
        );
        let tags = &entity.properties[2].data_type;
        assert_eq!(tags.name, "list");
        assert!(tags.nullable);
        assert_eq!(tags.generic.as_ref().map(|g| g.name.as_str()), Some("string"));
        assert_eq!(entity.computed_properties[0].name, "doubled");
        assert_eq!(entity.relationships[0].kind, RelationshipKind::BelongsTo);
        assert_eq!(entity.relationships[0].foreign_key.as_deref(), Some("buyerId"));
        assert_eq!(entity.relationships[1].kind, RelationshipKind::HasMany);
        assert_eq!(entity.version_property.as_deref(), Some("version"));
        assert_eq!(entity.version_at_property.as_deref(), Some("versionAt"));
    }

    #[test]
    fn inline_and_block_constraints_share_a_shape() {
        let out = parse(
            r#"
            entity A {
                constraint positive:warn self.amount > 0 "must be positive"
                constraint positive2 {
                    severity: warn
                    expression: self.amount > 0
                    message: "must be positive"
                }
            }
            "#,
        );
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let c = &out.program.entities[0].constraints;
        assert_eq!(c[0].severity, c[1].severity);
        assert_eq!(c[0].expression, c[1].expression);
        assert_eq!(c[0].message, c[1].message);
        assert_eq!(c[0].severity.as_deref(), Some("warn"));
    }

    #[test]
    fn colon_without_severity_is_a_separator() {
        let out = parse("entity User { constraint c: true; constraint d: false }");
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let c = &out.program.entities[0].constraints;
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].severity, None);
        assert_eq!(c[0].expression, Expression::Literal(Literal::Boolean(true)));
    }

    #[test]
    fn severity_before_parenthesized_expression() {
        let out = parse(r#"entity Order { constraint big:warn (self.total < 100) "Large" }"#);
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let c = &out.program.entities[0].constraints[0];
        assert_eq!(c.severity.as_deref(), Some("warn"));
        assert!(matches!(c.expression, Expression::BinaryOp { .. }), "{:?}", c.expression);
        assert_eq!(c.message.as_deref(), Some("Large"));
    }

    #[test]
    fn nesting_limit_is_reported_and_recovered() {
        let nested = |n: usize| format!("{}1{}", "(".repeat(n), ")".repeat(n));
        let source = format!(
            "entity A {{ property v: number = {} }}\nentity B {{ property w: number }}",
            nested(10)
        );
        let out = parse_with_depth(&source, UnknownCharPolicy::Warn, 4);
        assert_eq!(out.diagnostics.len(), 1, "{:?}", out.diagnostics);
        assert_eq!(out.diagnostics[0].code.as_deref(), Some(codes::UNEXPECTED_TOKEN));
        assert!(out.diagnostics[0].message.contains("nested too deeply"));
        let names: Vec<_> = out.program.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["B"]);

        assert!(parse_with_depth(&source, UnknownCharPolicy::Warn, 16).diagnostics.is_empty());
        assert!(parse_expression(&nested(DEFAULT_MAX_NESTING_DEPTH - 1)).is_ok());
        assert!(parse_expression(&nested(DEFAULT_MAX_NESTING_DEPTH)).is_err());
        assert!(parse("entity A { property v: list<list<list<number>>> }").diagnostics.is_empty());
        let typed = "entity A { property v: list<list<number>> }";
        assert!(parse_with_depth(typed, UnknownCharPolicy::Warn, 1).has_errors());
    }

    #[test]
    fn reserved_word_as_entity_name_is_reported_but_parsed() {
        let out = parse("entity command { property x: number }");
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].code.as_deref(), Some(codes::RESERVED_WORD));
        assert_eq!(out.program.entities[0].name, "command");
        assert_eq!(out.program.entities[0].properties.len(), 1);
    }

    #[test]
    fn recovers_and_collects_multiple_errors() {
        let out = parse(
            r#"
            entity A { property : number }
            entity B { property ok: string }
            entity C { bogus }
            entity D { property fine: number }
            "#,
        );
        let errors: Vec<_> = out.diagnostics.iter().filter(|d| d.is_error()).collect();
        assert_eq!(errors.len(), 2, "{:?}", out.diagnostics);
        let names: Vec<_> = out.program.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["B", "D"]);
    }

    #[test]
    fn module_members_recover_independently() {
        let out = parse(
            r#"
            module Sales {
                entity Broken { ??? }
                entity Fine { property x: number }
            }
            "#,
        );
        assert!(out.has_errors());
        assert_eq!(out.program.modules[0].entities.len(), 1);
        assert_eq!(out.program.modules[0].entities[0].name, "Fine");
    }

    #[test]
    fn parses_command_body() {
        let out = parse(
            r#"
            entity Counter {
                property value: number = 0
                command add(amount: number, note: string = "x") -> number {
                    guard amount > 0
                    mutate value = self.value + amount
                    emit Added
                    publish Audit { by: user.id }
                    return self.value
                }
            }
            "#,
        );
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let command = &out.program.entities[0].commands[0];
        assert_eq!(command.parameters.len(), 2);
        assert!(command.parameters[0].required);
        assert!(!command.parameters[1].required);
        assert_eq!(command.guards.len(), 1);
        assert_eq!(command.actions.len(), 3);
        assert_eq!(command.emits, vec!["Added".to_string()]);
        assert_eq!(command.returns.as_ref().map(|t| t.name.as_str()), Some("number"));
    }

    #[test]
    fn parses_top_level_declarations() {
        let out = parse(
            r#"
            store Counter in memory
            event Bumped: "counter.bumped" { value: number }
            policy adminsOnly execute: user.role == "admin" "Admins only"
            flow Checkout(cartId: string) -> string { total: cartId }
            effect Mailer: "email" { host: "smtp.local" }
            expose Counter as rest { increment }
            compose Shop { Counter
                connect Counter.bumped -> Ledger.record }
            "#,
        );
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let p = &out.program;
        assert_eq!(p.stores[0].entity, "Counter");
        assert_eq!(p.stores[0].target, "memory");
        assert_eq!(p.events[0].channel.as_deref(), Some("counter.bumped"));
        assert_eq!(p.events[0].payload.len(), 1);
        assert_eq!(p.policies[0].action, "execute");
        assert_eq!(p.policies[0].message.as_deref(), Some("Admins only"));
        assert_eq!(p.flows[0].steps.len(), 1);
        assert_eq!(p.effects[0].kind, "email");
        assert_eq!(p.exposures[0].operations, vec!["increment".to_string()]);
        assert_eq!(p.compositions[0].components, vec!["Counter".to_string()]);
        assert_eq!(p.compositions[0].connections[0].to, "Ledger.record");
    }

    #[test]
    fn entity_store_variants() {
        for source in [
            "entity A { store memory }",
            "entity A { store in memory }",
            "entity A { store memory { ttl: 10 } }",
        ] {
            let out = parse(source);
            assert!(out.diagnostics.is_empty(), "{}: {:?}", source, out.diagnostics);
            let store = out.program.entities[0].store.as_ref().unwrap();
            assert_eq!(store.target, "memory");
            assert_eq!(store.entity, "A");
        }
    }

    #[test]
    fn parses_transitions() {
        let out = parse(
            r#"entity Doc {
                transition status from "draft" to ["review", "published"]
                transition status from "review" to "published"
            }"#,
        );
        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let t = &out.program.entities[0].transitions;
        assert_eq!(t[0].to.len(), 2);
        assert_eq!(t[1].from, Literal::String("review".to_string()));
    }
}
