//! Tag expressions used to scope hooks, retries and assignment predicates.
//!
//! The dialect is the usual boolean one: `@tag`, `and`, `or`, `not` and
//! parentheses, e.g. `@web and not (@flaky or @slow)`. Expressions are
//! parsed once when the support library (or run options) are built, so a
//! malformed expression is rejected before any test case runs.

use thiserror::Error;

/// Errors raised while parsing a tag expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagExpressionError {
    #[error("unexpected end of tag expression")]
    UnexpectedEnd,
    #[error("unexpected token {0:?} in tag expression")]
    UnexpectedToken(String),
    #[error("unbalanced parenthesis in tag expression")]
    UnbalancedParen,
}

/// A parsed, evaluatable tag expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagExpression {
    Tag(String),
    Not(Box<TagExpression>),
    And(Box<TagExpression>, Box<TagExpression>),
    Or(Box<TagExpression>, Box<TagExpression>),
}

impl TagExpression {
    /// Parse `source` into an expression tree.
    ///
    /// # Errors
    ///
    /// Returns a [`TagExpressionError`] when the expression is malformed.
    pub fn parse(source: &str) -> Result<Self, TagExpressionError> {
        let tokens = tokenize(source);
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some(tok) => Err(TagExpressionError::UnexpectedToken(tok.clone())),
        }
    }

    /// Evaluate the expression against a case's tag set.
    #[must_use]
    pub fn evaluate(&self, tags: &[String]) -> bool {
        match self {
            Self::Tag(tag) => tags.iter().any(|t| t == tag),
            Self::Not(inner) => !inner.evaluate(tags),
            Self::And(lhs, rhs) => lhs.evaluate(tags) && rhs.evaluate(tags),
            Self::Or(lhs, rhs) => lhs.evaluate(tags) || rhs.evaluate(tags),
        }
    }
}

fn tokenize(source: &str) -> Vec<String> {
    source
        .replace('(', " ( ")
        .replace(')', " ) ")
        .split_whitespace()
        .map(ToOwned::to_owned)
        .collect()
}

struct Parser {
    tokens: Vec<String>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&String> { self.tokens.get(self.pos) }

    fn next(&mut self) -> Option<String> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    // or-expression := and-expression ("or" and-expression)*
    fn parse_or(&mut self) -> Result<TagExpression, TagExpressionError> {
        let mut lhs = self.parse_and()?;
        while self.peek().is_some_and(|t| t == "or") {
            self.next();
            let rhs = self.parse_and()?;
            lhs = TagExpression::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // and-expression := unary ("and" unary)*
    fn parse_and(&mut self) -> Result<TagExpression, TagExpressionError> {
        let mut lhs = self.parse_unary()?;
        while self.peek().is_some_and(|t| t == "and") {
            self.next();
            let rhs = self.parse_unary()?;
            lhs = TagExpression::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<TagExpression, TagExpressionError> {
        match self.next() {
            None => Err(TagExpressionError::UnexpectedEnd),
            Some(tok) if tok == "not" => {
                Ok(TagExpression::Not(Box::new(self.parse_unary()?)))
            }
            Some(tok) if tok == "(" => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(close) if close == ")" => Ok(inner),
                    _ => Err(TagExpressionError::UnbalancedParen),
                }
            }
            Some(tok) if tok == ")" => Err(TagExpressionError::UnbalancedParen),
            Some(tok) if tok == "and" || tok == "or" => {
                Err(TagExpressionError::UnexpectedToken(tok))
            }
            Some(tag) => Ok(TagExpression::Tag(tag)),
        }
    }
}
