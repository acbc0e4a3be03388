//! Lexer
//!
//! Turns Manifest source text into a flat token stream. The stream always
//! ends with an `Eof` token and tokenizing never fails: anomalies are either
//! skipped or reported as diagnostics, depending on [`UnknownCharPolicy`].
//!
//! Every token records the position *after* it was read, i.e. the line and
//! column of the next unread character. Diagnostic alignment downstream
//! depends on this convention.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::diagnostics::{codes, Diagnostic, Severity};

/// The closed set of reserved words. Any identifier-shaped token whose text
/// is in this set is typed as a keyword, wherever it appears.
pub const KEYWORDS: &[&str] = &[
    "module", "entity", "property", "computed", "derived", "hasMany", "hasOne", "belongsTo",
    "ref", "through", "with", "command", "policy", "store", "event", "flow", "effect", "expose",
    "compose", "emit", "publish", "mutate", "compute", "persist", "guard", "constraint",
    "transition", "from", "to", "return", "in", "is", "contains", "not", "and", "or", "true",
    "false", "null", "self", "this", "user", "context", "read", "write", "delete", "execute",
    "all", "override", "as",
];

/// Two-character operators, matched before single characters.
const TWO_CHAR_OPERATORS: &[&str] = &["==", "!=", "<=", ">=", "&&", "||", "=>", "->", "??"];

const ONE_CHAR_OPERATORS: &[char] = &['+', '-', '*', '/', '%', '=', '<', '>', '!', '?', '.', '&', '|'];

const PUNCTUATION: &[char] = &['(', ')', '{', '}', '[', ']', ',', ':', ';'];

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenKind {
    Keyword,
    Identifier,
    String,
    Number,
    Operator,
    Punctuation,
    Newline,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Keyword => "keyword",
            TokenKind::Identifier => "identifier",
            TokenKind::String => "string",
            TokenKind::Number => "number",
            TokenKind::Operator => "operator",
            TokenKind::Punctuation => "punctuation",
            TokenKind::Newline => "newline",
            TokenKind::Eof => "end of input",
        };
        write!(f, "{}", name)
    }
}

/// 1-based line/column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub position: Position,
}

impl Token {
    pub fn is(&self, kind: TokenKind, value: &str) -> bool {
        self.kind == kind && self.value == value
    }

    pub fn is_keyword(&self, value: &str) -> bool {
        self.is(TokenKind::Keyword, value)
    }
}

/// What to do with characters that cannot start any token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownCharPolicy {
    /// Drop silently.
    Skip,
    /// Drop and record a warning.
    #[default]
    Warn,
    /// Drop and record an error, which fails compilation.
    Error,
}

/// Tokens plus whatever anomalies the lexer recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct LexOutput {
    pub tokens: Vec<Token>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Tokenize with the silent legacy policy. Never fails, always ends in `Eof`.
pub fn tokenize(source: &str) -> Vec<Token> {
    tokenize_with(source, UnknownCharPolicy::Skip).tokens
}

pub fn tokenize_with(source: &str, policy: UnknownCharPolicy) -> LexOutput {
    let mut lexer = Lexer::new(source, policy);
    lexer.run();
    log::debug!(
        "tokenized {} chars into {} tokens ({} diagnostics)",
        source.len(),
        lexer.tokens.len(),
        lexer.diagnostics.len()
    );
    LexOutput {
        tokens: lexer.tokens,
        diagnostics: lexer.diagnostics,
    }
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    policy: UnknownCharPolicy,
    tokens: Vec<Token>,
    diagnostics: Vec<Diagnostic>,
}

impl Lexer {
    fn new(source: &str, policy: UnknownCharPolicy) -> Self {
        Lexer {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            policy,
            tokens: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn here(&self) -> Position {
        Position {
            line: self.line,
            column: self.column,
        }
    }

    fn push(&mut self, kind: TokenKind, value: impl Into<String>) {
        let position = self.here();
        self.tokens.push(Token {
            kind,
            value: value.into(),
            position,
        });
    }

    fn report(&mut self, code: &str, message: String) {
        let severity = match self.policy {
            UnknownCharPolicy::Skip => return,
            UnknownCharPolicy::Warn => Severity::Warning,
            UnknownCharPolicy::Error => Severity::Error,
        };
        log::warn!("lexer: {} at {}", message, self.here());
        self.diagnostics
            .push(Diagnostic::new(severity, message).at(self.here()).with_code(code));
    }

    fn run(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                '\n' => {
                    self.bump();
                    self.push(TokenKind::Newline, "\n");
                }
                c if c.is_whitespace() => {
                    self.bump();
                }
                '/' if self.peek_at(1) == Some('/') => self.skip_line_comment(),
                '/' if self.peek_at(1) == Some('*') => self.skip_block_comment(),
                '"' | '\'' => self.read_string(c),
                '`' => self.read_template(),
                c if c.is_ascii_digit() => self.read_number(),
                c if c.is_alphabetic() || c == '_' => self.read_word(),
                c if PUNCTUATION.contains(&c) => {
                    self.bump();
                    self.push(TokenKind::Punctuation, c.to_string());
                }
                c => {
                    if let Some(next) = self.peek_at(1) {
                        let pair: String = [c, next].iter().collect();
                        if TWO_CHAR_OPERATORS.contains(&pair.as_str()) {
                            self.bump();
                            self.bump();
                            self.push(TokenKind::Operator, pair);
                            continue;
                        }
                    }
                    if ONE_CHAR_OPERATORS.contains(&c) {
                        self.bump();
                        self.push(TokenKind::Operator, c.to_string());
                    } else {
                        self.bump();
                        self.report(
                            codes::UNKNOWN_CHARACTER,
                            format!("Unrecognized character '{}' skipped", c),
                        );
                    }
                }
            }
        }
        self.push(TokenKind::Eof, "");
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn skip_block_comment(&mut self) {
        self.bump();
        self.bump();
        while let Some(c) = self.peek() {
            if c == '*' && self.peek_at(1) == Some('/') {
                self.bump();
                self.bump();
                return;
            }
            self.bump();
        }
        self.report(codes::UNTERMINATED_COMMENT, "Unterminated block comment".to_string());
    }

    fn read_string(&mut self, quote: char) {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None => {
                    self.report(codes::UNTERMINATED_STRING, "Unterminated string literal".to_string());
                    break;
                }
                Some(c) if c == quote => break,
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some(other) => value.push(other),
                    None => {
                        self.report(codes::UNTERMINATED_STRING, "Unterminated string literal".to_string());
                        break;
                    }
                },
                Some(c) => value.push(c),
            }
        }
        self.push(TokenKind::String, value);
    }

    // Template literals are kept verbatim; `${...}` is not evaluated here.
    fn read_template(&mut self) {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None => {
                    self.report(codes::UNTERMINATED_STRING, "Unterminated template literal".to_string());
                    break;
                }
                Some('`') => break,
                Some(c) => value.push(c),
            }
        }
        self.push(TokenKind::String, value);
    }

    /// Digits with an optional fraction and exponent (`12`, `1.5`, `2e-3`).
    /// A `.` or `e` without a digit after it is left for the next token.
    fn read_number(&mut self) {
        let mut value = String::new();
        self.read_digits(&mut value);
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            value.push('.');
            self.bump();
            self.read_digits(&mut value);
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let signed = matches!(self.peek_at(1), Some('+' | '-'));
            let first_digit = if signed { 2 } else { 1 };
            if self.peek_at(first_digit).is_some_and(|c| c.is_ascii_digit()) {
                for _ in 0..first_digit {
                    if let Some(c) = self.bump() {
                        value.push(c);
                    }
                }
                self.read_digits(&mut value);
            }
        }
        self.push(TokenKind::Number, value);
    }

    fn read_digits(&mut self, value: &mut String) {
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            value.push(c);
            self.bump();
        }
    }

    fn read_word(&mut self) {
        let mut value = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                value.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let kind = if is_keyword(&value) {
            TokenKind::Keyword
        } else {
            TokenKind::Identifier
        };
        self.push(kind, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<(TokenKind, String)> {
        tokenize(source)
            .into_iter()
            .map(|t| (t.kind, t.value))
            .collect()
    }

    #[test]
    fn empty_source_yields_only_eof() {
        let tokens = tokenize("");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Eof);
        assert_eq!(tokens[0].position, Position { line: 1, column: 1 });
    }

    #[test]
    fn position_points_past_the_token() {
        let tokens = tokenize("entity User");
        assert_eq!(tokens[0].position, Position { line: 1, column: 7 });
        assert_eq!(tokens[1].position, Position { line: 1, column: 12 });
    }

    #[test]
    fn keywords_are_typed_regardless_of_position() {
        assert_eq!(
            kinds("self.user"),
            vec![
                (TokenKind::Keyword, "self".to_string()),
                (TokenKind::Operator, ".".to_string()),
                (TokenKind::Keyword, "user".to_string()),
                (TokenKind::Eof, String::new()),
            ]
        );
    }

    #[test]
    fn two_char_operators_win_over_single() {
        assert_eq!(
            kinds("a >= b => c"),
            vec![
                (TokenKind::Identifier, "a".to_string()),
                (TokenKind::Operator, ">=".to_string()),
                (TokenKind::Identifier, "b".to_string()),
                (TokenKind::Operator, "=>".to_string()),
                (TokenKind::Identifier, "c".to_string()),
                (TokenKind::Eof, String::new()),
            ]
        );
    }

    #[test]
    fn bare_dot_is_an_operator_not_a_number() {
        let k = kinds(".5");
        assert_eq!(k[0], (TokenKind::Operator, ".".to_string()));
        assert_eq!(k[1], (TokenKind::Number, "5".to_string()));
        let k = kinds("3.25");
        assert_eq!(k[0], (TokenKind::Number, "3.25".to_string()));
    }

    #[test]
    fn string_escapes_are_decoded() {
        let k = kinds(r#""a\n\"b\"" 'it\'s'"#);
        assert_eq!(k[0], (TokenKind::String, "a\n\"b\"".to_string()));
        assert_eq!(k[1], (TokenKind::String, "it's".to_string()));
    }

    #[test]
    fn template_literal_is_raw() {
        let k = kinds("`hi ${name}`");
        assert_eq!(k[0], (TokenKind::String, "hi ${name}".to_string()));
    }

    #[test]
    fn block_comment_advances_lines() {
        let tokens = tokenize("/* one\ntwo\nthree */ entity");
        assert_eq!(tokens[0].kind, TokenKind::Keyword);
        assert_eq!(tokens[0].position, Position { line: 3, column: 16 });
    }

    #[test]
    fn unterminated_block_comment_is_reported() {
        let source = "entity A {}\n/* never closed\nentity B {}";
        let out = tokenize_with(source, UnknownCharPolicy::Warn);
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].code.as_deref(), Some(codes::UNTERMINATED_COMMENT));
        assert_eq!(out.tokens.last().map(|t| t.kind), Some(TokenKind::Eof));

        let strict = tokenize_with("/* open", UnknownCharPolicy::Error);
        assert!(strict.diagnostics[0].is_error());
        assert!(tokenize_with("/* closed */", UnknownCharPolicy::Error).diagnostics.is_empty());
    }

    #[test]
    fn numbers_take_optional_exponents() {
        for source in ["1e5", "2.5E-3", "7e+2"] {
            let k = kinds(source);
            assert_eq!(k.len(), 2, "{}", source);
            assert_eq!(k[0], (TokenKind::Number, source.to_string()));
        }
        let k = kinds("3em");
        assert_eq!(k[0], (TokenKind::Number, "3".to_string()));
        assert_eq!(k[1], (TokenKind::Identifier, "em".to_string()));
        assert_eq!(kinds("4e-x")[0], (TokenKind::Number, "4".to_string()));
    }

    #[test]
    fn line_comment_keeps_the_newline() {
        let k = kinds("a // note\nb");
        assert_eq!(k[1].0, TokenKind::Newline);
        assert_eq!(k[2], (TokenKind::Identifier, "b".to_string()));
    }

    #[test]
    fn unknown_characters_follow_policy() {
        assert_eq!(kinds("a @ b").len(), 3);

        let warned = tokenize_with("a @ b", UnknownCharPolicy::Warn);
        assert_eq!(warned.diagnostics.len(), 1);
        assert_eq!(warned.diagnostics[0].severity, Severity::Warning);
        assert_eq!(warned.diagnostics[0].code.as_deref(), Some(codes::UNKNOWN_CHARACTER));

        let failed = tokenize_with("a @ b", UnknownCharPolicy::Error);
        assert!(failed.diagnostics[0].is_error());
    }
}
