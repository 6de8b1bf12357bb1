//! Target expression parsing.
//!
//! Target strings are parsed once, when a sequence is rendered, into a
//! [`TargetExpr`] tree. Grammar for compound expressions (lowest precedence
//! first):
//!
//! ```text
//! or_expr  := and_expr ( "or" and_expr )*
//! and_expr := unary ( "and" unary )*
//! unary    := "not" unary | primary
//! primary  := "(" or_expr ")" | term
//! term     := "self" | key ":" pattern | key "=" pattern | "G@" key ":" pattern
//!           | "I@" key ":" pattern | "L@" id ("," id)* | node-glob
//! ```
//!
//! Keywords are case-insensitive. Patterns accept `*` and `?` globs. A pattern
//! written as a size or size range (`size:10G:40G`, `size:50G:`, `size::60G`,
//! `size:20G`) becomes a [`TargetExpr::Size`] predicate instead.

use std::fmt;

use runbook_types::{NodeId, ResolutionError};
use serde::{Deserialize, Serialize};

use super::size::SizeBound;

/// Keyword that addresses the engine's own control node.
pub const CONTROL_KEYWORD: &str = "self";

/// How a target string is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// One node id, a node-id glob, or `self`.
    #[default]
    Single,
    /// Boolean expression over predicates.
    Compound,
    /// Comma separated node ids.
    List,
}

/// Parsed predicate tree over node identity and attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetExpr {
    /// The engine's own control node.
    Control,
    /// Node ids matching a glob (a plain id matches itself).
    NodeGlob(String),
    /// Literal node ids.
    NodeList(Vec<NodeId>),
    /// Nodes whose attribute at `key` (dotted path) matches `pattern`.
    Attribute { key: String, pattern: String },
    /// Nodes whose attribute at `key` holds a size within `bound`.
    Size { key: String, bound: SizeBound },
    And(Box<TargetExpr>, Box<TargetExpr>),
    Or(Box<TargetExpr>, Box<TargetExpr>),
    Not(Box<TargetExpr>),
}

impl TargetExpr {
    /// Parses `expression` according to `target_type`.
    pub fn parse(expression: &str, target_type: TargetType) -> Result<Self, ResolutionError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(invalid(expression, "expression is empty"));
        }

        match target_type {
            TargetType::Single => parse_single(trimmed),
            TargetType::List => parse_list(trimmed, trimmed),
            TargetType::Compound => CompoundParser::new(trimmed)?.parse(),
        }
    }

    pub fn attribute(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        TargetExpr::Attribute {
            key: key.into(),
            pattern: pattern.into(),
        }
    }

    pub fn and(self, other: TargetExpr) -> Self {
        TargetExpr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: TargetExpr) -> Self {
        TargetExpr::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        TargetExpr::Not(Box::new(self))
    }
}

impl fmt::Display for TargetExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetExpr::Control => f.write_str(CONTROL_KEYWORD),
            TargetExpr::NodeGlob(pattern) => f.write_str(pattern),
            TargetExpr::NodeList(nodes) => {
                let ids: Vec<&str> = nodes.iter().map(NodeId::as_str).collect();
                write!(f, "L@{}", ids.join(","))
            }
            TargetExpr::Attribute { key, pattern } => write!(f, "{key}:{pattern}"),
            TargetExpr::Size { key, bound } => write!(f, "{key}:{bound}"),
            TargetExpr::And(left, right) => write!(f, "({left} and {right})"),
            TargetExpr::Or(left, right) => write!(f, "({left} or {right})"),
            TargetExpr::Not(inner) => write!(f, "not {inner}"),
        }
    }
}

fn invalid(expression: &str, reason: impl Into<String>) -> ResolutionError {
    ResolutionError::InvalidExpression {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

fn parse_single(expression: &str) -> Result<TargetExpr, ResolutionError> {
    if expression.contains(char::is_whitespace) || expression.contains(',') {
        return Err(invalid(expression, "single targets address exactly one node or glob"));
    }
    if expression.contains(':') || expression.contains('=') || expression.contains('@') {
        return Err(invalid(expression, "attribute predicates require target_type 'compound'"));
    }
    if expression.eq_ignore_ascii_case(CONTROL_KEYWORD) {
        return Ok(TargetExpr::Control);
    }
    Ok(TargetExpr::NodeGlob(expression.to_string()))
}

fn parse_list(list: &str, expression: &str) -> Result<TargetExpr, ResolutionError> {
    let mut nodes = Vec::new();
    for raw in list.split(',') {
        let id = raw.trim();
        if id.is_empty() {
            return Err(invalid(expression, "list contains an empty node id"));
        }
        if id.eq_ignore_ascii_case(CONTROL_KEYWORD) {
            return Err(invalid(expression, "'self' cannot appear in a node list; use a single target"));
        }
        if id.contains(char::is_whitespace) || id.contains('*') || id.contains('?') {
            return Err(invalid(expression, format!("'{id}' is not a literal node id")));
        }
        nodes.push(NodeId::new(id));
    }
    Ok(TargetExpr::NodeList(nodes))
}

fn parse_term(term: &str, expression: &str) -> Result<TargetExpr, ResolutionError> {
    if term.eq_ignore_ascii_case(CONTROL_KEYWORD) {
        return Ok(TargetExpr::Control);
    }
    if let Some(list) = term.strip_prefix("L@") {
        return parse_list(list, expression);
    }
    let predicate = term
        .strip_prefix("G@")
        .or_else(|| term.strip_prefix("I@"))
        .unwrap_or(term);

    match predicate.find([':', '=']) {
        Some(position) => {
            let key = &predicate[..position];
            let pattern = &predicate[position + 1..];
            if key.contains('@') {
                return Err(invalid(expression, format!("unsupported matcher prefix in '{term}'")));
            }
            if key.is_empty() || key.split('.').any(str::is_empty) {
                return Err(invalid(expression, format!("predicate '{term}' has an empty attribute key")));
            }
            if pattern.is_empty() {
                return Err(invalid(expression, format!("predicate '{term}' has an empty pattern")));
            }
            match SizeBound::parse(pattern).map_err(|reason| invalid(expression, format!("predicate '{term}': {reason}")))? {
                Some(bound) => Ok(TargetExpr::Size {
                    key: key.to_string(),
                    bound,
                }),
                None => Ok(TargetExpr::attribute(key, pattern)),
            }
        }
        None if predicate.len() != term.len() => Err(invalid(expression, format!("'{term}' is missing ':<pattern>'"))),
        None if term.contains('@') => Err(invalid(expression, format!("unsupported matcher prefix in '{term}'"))),
        None => Ok(TargetExpr::NodeGlob(term.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Open,
    Close,
    And,
    Or,
    Not,
    Term(&'a str),
}

fn tokenize(expression: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;

    for (index, character) in expression.char_indices() {
        if character == '(' || character == ')' || character.is_whitespace() {
            if let Some(from) = start.take() {
                tokens.push(word_token(&expression[from..index]));
            }
            match character {
                '(' => tokens.push(Token::Open),
                ')' => tokens.push(Token::Close),
                _ => {}
            }
        } else if start.is_none() {
            start = Some(index);
        }
    }
    if let Some(from) = start {
        tokens.push(word_token(&expression[from..]));
    }
    tokens
}

fn word_token(word: &str) -> Token<'_> {
    if word.eq_ignore_ascii_case("and") {
        Token::And
    } else if word.eq_ignore_ascii_case("or") {
        Token::Or
    } else if word.eq_ignore_ascii_case("not") {
        Token::Not
    } else {
        Token::Term(word)
    }
}

struct CompoundParser<'a> {
    expression: &'a str,
    tokens: Vec<Token<'a>>,
    position: usize,
}

impl<'a> CompoundParser<'a> {
    fn new(expression: &'a str) -> Result<Self, ResolutionError> {
        let tokens = tokenize(expression);
        if tokens.is_empty() {
            return Err(invalid(expression, "expression is empty"));
        }
        Ok(Self {
            expression,
            tokens,
            position: 0,
        })
    }

    fn parse(mut self) -> Result<TargetExpr, ResolutionError> {
        let expr = self.parse_or()?;
        match self.tokens.get(self.position) {
            None => Ok(expr),
            Some(Token::Close) => Err(invalid(self.expression, "unbalanced ')'")),
            Some(token) => Err(invalid(self.expression, format!("unexpected {}", describe(token)))),
        }
    }

    fn parse_or(&mut self) -> Result<TargetExpr, ResolutionError> {
        let mut expr = self.parse_and()?;
        while self.consume(&Token::Or) {
            expr = expr.or(self.parse_and()?);
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<TargetExpr, ResolutionError> {
        let mut expr = self.parse_unary()?;
        while self.consume(&Token::And) {
            expr = expr.and(self.parse_unary()?);
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<TargetExpr, ResolutionError> {
        if self.consume(&Token::Not) {
            return Ok(self.parse_unary()?.negate());
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<TargetExpr, ResolutionError> {
        let Some(token) = self.tokens.get(self.position).cloned() else {
            return Err(invalid(self.expression, "expression ends where a predicate was expected"));
        };
        self.position += 1;
        match token {
            Token::Open => {
                let inner = self.parse_or()?;
                if !self.consume(&Token::Close) {
                    return Err(invalid(self.expression, "missing ')'"));
                }
                Ok(inner)
            }
            Token::Term(term) => parse_term(term, self.expression),
            other => Err(invalid(self.expression, format!("unexpected {}", describe(&other)))),
        }
    }

    fn consume(&mut self, expected: &Token<'_>) -> bool {
        if self.tokens.get(self.position) == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }
}

fn describe(token: &Token<'_>) -> String {
    match token {
        Token::Open => "'('".to_string(),
        Token::Close => "')'".to_string(),
        Token::And => "'and'".to_string(),
        Token::Or => "'or'".to_string(),
        Token::Not => "'not'".to_string(),
        Token::Term(term) => format!("'{term}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compound(expression: &str) -> TargetExpr {
        TargetExpr::parse(expression, TargetType::Compound).expect("parse compound")
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let parsed = compound("roles:mon or roles:storage and os:SUSE");
        let expected = TargetExpr::attribute("roles", "mon")
            .or(TargetExpr::attribute("roles", "storage").and(TargetExpr::attribute("os", "SUSE")));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn parentheses_and_negation_override_precedence() {
        let parsed = compound("(roles:mon OR roles:storage) AND NOT self");
        let expected = TargetExpr::attribute("roles", "mon")
            .or(TargetExpr::attribute("roles", "storage"))
            .and(TargetExpr::Control.negate());
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), "((roles:mon or roles:storage) and not self)");
    }

    #[test]
    fn salt_style_prefixes_are_accepted() {
        assert_eq!(compound("I@roles:storage"), TargetExpr::attribute("roles", "storage"));
        assert_eq!(compound("G@os=SUSE"), TargetExpr::attribute("os", "SUSE"));
        assert_eq!(
            compound("L@node-1,node-2"),
            TargetExpr::NodeList(vec![NodeId::new("node-1"), NodeId::new("node-2")])
        );
        assert_eq!(compound("storage-*"), TargetExpr::NodeGlob("storage-*".into()));
    }

    #[test]
    fn size_patterns_become_size_predicates() {
        assert_eq!(
            compound("size:10G:40G"),
            TargetExpr::Size {
                key: "size".into(),
                bound: SizeBound::Between {
                    low: 10_000_000_000,
                    high: 40_000_000_000,
                },
            }
        );
        assert_eq!(compound("G@size=2TB").to_string(), "size:2TB");
        assert_eq!(compound("size::60G").to_string(), "size::60GB");
        assert_eq!(compound("mac:aa:bb"), TargetExpr::attribute("mac", "aa:bb"));
    }

    #[test]
    fn single_and_list_targets() {
        assert_eq!(TargetExpr::parse(" self ", TargetType::Single), Ok(TargetExpr::Control));
        assert_eq!(
            TargetExpr::parse("admin.ceph", TargetType::Single),
            Ok(TargetExpr::NodeGlob("admin.ceph".into()))
        );
        assert_eq!(
            TargetExpr::parse("a, b,c", TargetType::List),
            Ok(TargetExpr::NodeList(vec![NodeId::new("a"), NodeId::new("b"), NodeId::new("c")]))
        );
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for expression in [
            "",
            "roles:storage and",
            "(roles:storage",
            "roles:storage)",
            "and roles:storage",
            "roles:",
            ":storage",
            "G@roles",
            "X@roles:storage",
            "roles:a roles:b",
            "size:40G:10G",
            "size::",
            "size:10G:big",
        ] {
            let result = TargetExpr::parse(expression, TargetType::Compound);
            assert!(
                matches!(result, Err(ResolutionError::InvalidExpression { .. })),
                "expected '{expression}' to be rejected, got {result:?}"
            );
        }
        assert!(TargetExpr::parse("roles:storage", TargetType::Single).is_err());
        assert!(TargetExpr::parse("a b", TargetType::Single).is_err());
        assert!(TargetExpr::parse("a,,b", TargetType::List).is_err());
        assert!(TargetExpr::parse("a,self", TargetType::List).is_err());
    }
}
