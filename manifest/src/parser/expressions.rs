// Expression parsing.
//
// Precedence, lowest first: ternary, or, and, equality (== != is in contains),
// relational, additive, multiplicative, unary, postfix (. () []), primary.

use super::{ParseResult, Parser};
use crate::ast::{Expression, Literal};
use crate::lexer::TokenKind;

impl Parser {
    pub(super) fn parse_expr(&mut self) -> ParseResult<Expression> {
        self.nested(Self::parse_ternary)
    }

    fn parse_ternary(&mut self) -> ParseResult<Expression> {
        let condition = self.parse_or()?;
        if !self.eat_op("?") {
            return Ok(condition);
        }
        self.skip_newlines();
        let consequent = self.parse_expr()?;
        self.skip_newlines();
        self.expect_punct(":")?;
        self.skip_newlines();
        let alternate = self.parse_expr()?;
        Ok(Expression::Conditional {
            condition: condition.boxed(),
            consequent: consequent.boxed(),
            alternate: alternate.boxed(),
        })
    }

    /// Matches one of `operators` or `keywords` at the cursor and returns the
    /// operator spelling to store in the AST.
    fn match_binary(&mut self, operators: &[&str], keywords: &[&str]) -> Option<String> {
        let token = self.current();
        let hit = match token.kind {
            TokenKind::Operator => operators.contains(&token.value.as_str()),
            TokenKind::Keyword => keywords.contains(&token.value.as_str()),
            _ => false,
        };
        if hit {
            Some(self.advance().value)
        } else {
            None
        }
    }

    fn parse_or(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_and()?;
        while let Some(operator) = self.match_binary(&["||", "??"], &["or"]) {
            self.skip_newlines();
            let right = self.parse_and()?;
            left = binary(operator, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_equality()?;
        while let Some(operator) = self.match_binary(&["&&"], &["and"]) {
            self.skip_newlines();
            let right = self.parse_equality()?;
            left = binary(operator, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_relational()?;
        while let Some(operator) = self.match_binary(&["==", "!="], &["is", "in", "contains"]) {
            self.skip_newlines();
            let right = self.parse_relational()?;
            left = binary(operator, left, right);
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_additive()?;
        while let Some(operator) = self.match_binary(&["<", ">", "<=", ">="], &[]) {
            self.skip_newlines();
            let right = self.parse_additive()?;
            left = binary(operator, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_multiplicative()?;
        while let Some(operator) = self.match_binary(&["+", "-"], &[]) {
            self.skip_newlines();
            let right = self.parse_multiplicative()?;
            left = binary(operator, left, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_unary()?;
        while let Some(operator) = self.match_binary(&["*", "/", "%"], &[]) {
            self.skip_newlines();
            let right = self.parse_unary()?;
            left = binary(operator, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Expression> {
        if let Some(operator) = self.match_binary(&["!", "-"], &["not"]) {
            let operand = self.nested(Self::parse_unary)?;
            return Ok(Expression::UnaryOp {
                operator,
                operand: operand.boxed(),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ParseResult<Expression> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_op(".") {
                let property = self.expect_name("member")?;
                expr = Expression::MemberAccess {
                    object: expr.boxed(),
                    property,
                };
            } else if self.eat_punct("(") {
                let arguments = self.parse_sequence(")")?;
                expr = Expression::Call {
                    callee: expr.boxed(),
                    arguments,
                };
            } else if self.eat_punct("[") {
                self.skip_newlines();
                let index = self.parse_expr()?;
                self.skip_newlines();
                self.expect_punct("]")?;
                expr = match index {
                    Expression::Literal(Literal::String(key)) => Expression::MemberAccess {
                        object: expr.boxed(),
                        property: key,
                    },
                    Expression::Literal(Literal::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                        Expression::MemberAccess {
                            object: expr.boxed(),
                            property: format!("{}", n as u64),
                        }
                    }
                    other => Expression::Index {
                        object: expr.boxed(),
                        index: other.boxed(),
                    },
                };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Comma-separated expressions up to `close` (consumed). Newlines and a
    /// trailing comma are allowed.
    fn parse_sequence(&mut self, close: &str) -> ParseResult<Vec<Expression>> {
        let mut items = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat_punct(close) {
                return Ok(items);
            }
            items.push(self.parse_expr()?);
            self.skip_newlines();
            if !self.eat_punct(",") && !self.check_punct(close) {
                return Err(self.error_at_current(format!(
                    "Expected ',' or '{}', found {}",
                    close,
                    self.describe_current()
                )));
            }
        }
    }

    pub(super) fn parse_primary(&mut self) -> ParseResult<Expression> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Number => {
                self.advance();
                let value = token.value.parse::<f64>().map_err(|_| {
                    super::ParseError {
                        message: format!("Invalid number literal '{}'", token.value),
                        position: token.position,
                    }
                })?;
                Ok(Expression::Literal(Literal::Number(value)))
            }
            TokenKind::String => {
                self.advance();
                Ok(Expression::Literal(Literal::String(token.value)))
            }
            TokenKind::Keyword => match token.value.as_str() {
                "true" => {
                    self.advance();
                    Ok(Expression::Literal(Literal::Boolean(true)))
                }
                "false" => {
                    self.advance();
                    Ok(Expression::Literal(Literal::Boolean(false)))
                }
                "null" => {
                    self.advance();
                    Ok(Expression::Literal(Literal::Null))
                }
                "self" | "this" | "user" | "context" => {
                    self.advance();
                    Ok(Expression::Identifier(token.value))
                }
                other => Err(self.error_at_current(format!(
                    "Unexpected keyword '{}' in expression",
                    other
                ))),
            },
            TokenKind::Identifier => {
                self.advance();
                if self.eat_op("=>") {
                    let body = self.parse_lambda_body()?;
                    return Ok(Expression::Lambda {
                        params: vec![token.value],
                        body: body.boxed(),
                    });
                }
                Ok(Expression::Identifier(token.value))
            }
            TokenKind::Punctuation => match token.value.as_str() {
                "(" => self.parse_parenthesized_or_lambda(),
                "[" => {
                    self.advance();
                    Ok(Expression::Array(self.parse_sequence("]")?))
                }
                "{" => self.parse_object(),
                _ => Err(self.error_at_current(format!(
                    "Unexpected {} in expression",
                    self.describe_current()
                ))),
            },
            _ => Err(self.error_at_current(format!(
                "Expected an expression, found {}",
                self.describe_current()
            ))),
        }
    }

    /// `(a, b) => body` or `(expr)`. The parameter list is scanned
    /// tentatively; without a following `=>` the cursor is rewound.
    fn parse_parenthesized_or_lambda(&mut self) -> ParseResult<Expression> {
        let checkpoint = self.checkpoint();
        if let Some(params) = self.scan_lambda_params() {
            let body = self.parse_lambda_body()?;
            return Ok(Expression::Lambda {
                params,
                body: body.boxed(),
            });
        }
        self.restore(checkpoint);
        self.expect_punct("(")?;
        self.skip_newlines();
        let inner = self.parse_expr()?;
        self.skip_newlines();
        self.expect_punct(")")?;
        Ok(inner)
    }

    /// Consumes `( ident, ... ) =>` and returns the names, or `None` (cursor
    /// position then unspecified; the caller restores).
    fn scan_lambda_params(&mut self) -> Option<Vec<String>> {
        if !self.eat_punct("(") {
            return None;
        }
        let mut params = Vec::new();
        loop {
            if self.eat_punct(")") {
                break;
            }
            if self.current().kind != TokenKind::Identifier {
                return None;
            }
            params.push(self.advance().value);
            if !self.eat_punct(",") && !self.check_punct(")") {
                return None;
            }
        }
        if self.eat_op("=>") {
            Some(params)
        } else {
            None
        }
    }

    fn parse_lambda_body(&mut self) -> ParseResult<Expression> {
        self.skip_newlines();
        self.parse_expr()
    }

    fn parse_object(&mut self) -> ParseResult<Expression> {
        self.expect_punct("{")?;
        let mut entries = Vec::new();
        loop {
            self.skip_list_separators();
            if self.eat_punct("}") {
                return Ok(Expression::Object(entries));
            }
            let key = match self.current().kind {
                TokenKind::String => self.advance().value,
                _ => self.expect_name("object key")?,
            };
            self.expect_punct(":")?;
            self.skip_newlines();
            let value = self.parse_expr()?;
            entries.push((key, value));
            if !self.check_punct(",")
                && !self.check_punct("}")
                && self.current().kind != TokenKind::Newline
            {
                return Err(self.error_at_current(format!(
                    "Expected ',' or '}}' in object, found {}",
                    self.describe_current()
                )));
            }
        }
    }
}

fn binary(operator: String, left: Expression, right: Expression) -> Expression {
    Expression::BinaryOp {
        operator,
        left: left.boxed(),
        right: right.boxed(),
    }
}
