//! Step expression compilation.
//!
//! Step definitions are written either as literal expressions
//! (`"a {int} step"`, with optional text `(s)` and alternation `a/b`) or
//! as raw regular expressions. Both compile to an anchored [`Regex`] whose
//! capture groups line up with a list of parameter-type names, so the
//! matcher can extract and transform arguments positionally. Compilation
//! happens at library-build time; a malformed pattern never reaches a run.

use regex::Regex;
use thiserror::Error;

use crate::param::ParameterTypeRegistry;

/// Errors raised while compiling a step pattern.
#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("undefined parameter type {{{0}}}")]
    UndefinedParameterType(String),
    #[error("unbalanced '{{' in expression {0:?}")]
    UnbalancedBrace(String),
    #[error("unbalanced '(' in expression {0:?}")]
    UnbalancedParen(String),
    #[error("parameter types cannot be nested inside optional text in {0:?}")]
    ParameterInOptional(String),
    #[error("invalid regular expression {pattern:?}: {source}")]
    InvalidRegexp {
        pattern: String,
        source: regex::Error,
    },
}

/// A compiled step pattern.
///
/// `parameters` holds one entry per capture group: the parameter-type name
/// for expression placeholders, or `None` for raw-regex groups (which
/// transform through the anonymous type).
#[derive(Clone, Debug)]
pub struct StepExpression {
    source: String,
    regex: Regex,
    parameters: Vec<Option<String>>,
}

impl StepExpression {
    /// Compile a literal expression against the registry.
    ///
    /// # Errors
    ///
    /// Returns an [`ExpressionError`] for unknown placeholders, unbalanced
    /// delimiters, or fragments that fail regex compilation.
    pub fn expression(
        source: &str,
        registry: &ParameterTypeRegistry,
    ) -> Result<Self, ExpressionError> {
        let (pattern, parameters) = compile_expression(source, registry)?;
        let regex = Regex::new(&pattern).map_err(|source_err| ExpressionError::InvalidRegexp {
            pattern: pattern.clone(),
            source: source_err,
        })?;
        Ok(Self {
            source: source.to_owned(),
            regex,
            parameters,
        })
    }

    /// Wrap a raw regular expression, anchoring it if unanchored.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::InvalidRegexp`] when the pattern does not
    /// compile.
    pub fn regex(source: &str) -> Result<Self, ExpressionError> {
        let mut pattern = source.to_owned();
        if !pattern.starts_with('^') {
            pattern.insert(0, '^');
        }
        if !pattern.ends_with('$') {
            pattern.push('$');
        }
        let regex = Regex::new(&pattern).map_err(|source_err| ExpressionError::InvalidRegexp {
            pattern: pattern.clone(),
            source: source_err,
        })?;
        let parameters = vec![None; regex.captures_len() - 1];
        Ok(Self {
            source: source.to_owned(),
            regex,
            parameters,
        })
    }

    /// The pattern as originally registered, for diagnostics.
    #[must_use]
    pub fn source(&self) -> &str { &self.source }

    pub(crate) fn parameters(&self) -> &[Option<String>] { &self.parameters }

    /// Match step text, returning the raw captured fragments on success.
    #[must_use]
    pub fn captures(&self, text: &str) -> Option<Vec<String>> {
        self.regex.captures(text).map(|caps| {
            caps.iter()
                .skip(1)
                .map(|m| m.map(|m| m.as_str().to_owned()).unwrap_or_default())
                .collect()
        })
    }
}

enum Node {
    Text(Vec<(char, bool)>),
    Whitespace(String),
    Parameter(String),
    Optional(String),
}

fn compile_expression(
    source: &str,
    registry: &ParameterTypeRegistry,
) -> Result<(String, Vec<Option<String>>), ExpressionError> {
    let nodes = scan(source)?;
    let mut pattern = String::from("^");
    let mut parameters = Vec::new();
    for node in nodes {
        match node {
            Node::Whitespace(ws) => pattern.push_str(&regex::escape(&ws)),
            Node::Text(chars) => pattern.push_str(&render_word(&chars)),
            Node::Optional(text) => {
                pattern.push_str("(?:");
                pattern.push_str(&regex::escape(&text));
                pattern.push_str(")?");
            }
            Node::Parameter(name) => {
                let parameter = registry
                    .lookup(&name)
                    .ok_or_else(|| ExpressionError::UndefinedParameterType(name.clone()))?;
                let regexps = parameter.regexps();
                if let [only] = regexps {
                    pattern.push('(');
                    pattern.push_str(only);
                    pattern.push(')');
                } else {
                    let alternatives: Vec<String> =
                        regexps.iter().map(|r| format!("(?:{r})")).collect();
                    pattern.push('(');
                    pattern.push_str(&alternatives.join("|"));
                    pattern.push(')');
                }
                parameters.push(Some(name));
            }
        }
    }
    pattern.push('$');
    Ok((pattern, parameters))
}

fn scan(source: &str) -> Result<Vec<Node>, ExpressionError> {
    let mut nodes = Vec::new();
    let mut word: Vec<(char, bool)> = Vec::new();
    let mut chars = source.chars().peekable();

    let flush = |word: &mut Vec<(char, bool)>, nodes: &mut Vec<Node>| {
        if !word.is_empty() {
            nodes.push(Node::Text(std::mem::take(word)));
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => word.push((escaped, true)),
                None => word.push(('\\', true)),
            },
            '{' => {
                flush(&mut word, &mut nodes);
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(inner) => name.push(inner),
                        None => return Err(ExpressionError::UnbalancedBrace(source.to_owned())),
                    }
                }
                nodes.push(Node::Parameter(name));
            }
            '(' => {
                flush(&mut word, &mut nodes);
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(')') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => text.push(escaped),
                            None => {
                                return Err(ExpressionError::UnbalancedParen(source.to_owned()));
                            }
                        },
                        Some('{') => {
                            return Err(ExpressionError::ParameterInOptional(source.to_owned()));
                        }
                        Some(inner) => text.push(inner),
                        None => return Err(ExpressionError::UnbalancedParen(source.to_owned())),
                    }
                }
                nodes.push(Node::Optional(text));
            }
            c if c.is_whitespace() => {
                flush(&mut word, &mut nodes);
                let mut ws = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() {
                        ws.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                nodes.push(Node::Whitespace(ws));
            }
            c => word.push((c, false)),
        }
    }
    flush(&mut word, &mut nodes);
    Ok(nodes)
}

/// Render one word, expanding unescaped `/` into an alternation group.
fn render_word(chars: &[(char, bool)]) -> String {
    let mut alternatives: Vec<String> = vec![String::new()];
    let mut split = false;
    for &(c, escaped) in chars {
        if c == '/' && !escaped {
            split = true;
            alternatives.push(String::new());
        } else if let Some(current) = alternatives.last_mut() {
            current.push(c);
        }
    }
    if split {
        let escaped: Vec<String> = alternatives.iter().map(|a| regex::escape(a)).collect();
        format!("(?:{})", escaped.join("|"))
    } else {
        regex::escape(&alternatives.remove(0))
    }
}
