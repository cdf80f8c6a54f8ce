//! Parameter types backing `{placeholder}` captures in step expressions.
//!
//! A [`ParameterType`] pairs one or more regular-expression fragments with
//! a transform that turns the captured text into a typed
//! [`serde_json::Value`]. The [`ParameterTypeRegistry`] is frozen into the
//! support library at build time; the built-in `int`, `float`, `word`,
//! `string` and anonymous (`{}`) types are always present and user types
//! may be added before any step definitions reference them.

use std::{collections::HashMap, fmt, sync::Arc};

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Error produced by a parameter transform.
///
/// Transform failures are captured during matching but only surface once
/// the step actually executes; they report as a step failure, never as a
/// match failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("could not transform {raw:?} into {type_name}: {message}")]
pub struct TransformError {
    pub type_name: String,
    pub raw: String,
    pub message: String,
}

/// Errors raised while defining parameter types.
#[derive(Debug, Error)]
pub enum ParameterTypeError {
    #[error("parameter type {0:?} is already defined")]
    Duplicate(String),
    #[error("parameter type {name:?} has an invalid regexp {pattern:?}: {source}")]
    InvalidRegexp {
        name: String,
        pattern: String,
        source: regex::Error,
    },
    #[error("parameter type {name:?} regexp {pattern:?} may not contain capture groups")]
    CaptureGroup { name: String, pattern: String },
}

type Transform = Arc<dyn Fn(&str) -> Result<Value, TransformError> + Send + Sync>;

/// A named capture class usable as `{name}` inside step expressions.
#[derive(Clone)]
pub struct ParameterType {
    name: String,
    regexps: Vec<String>,
    transform: Transform,
}

impl fmt::Debug for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterType")
            .field("name", &self.name)
            .field("regexps", &self.regexps)
            .finish_non_exhaustive()
    }
}

impl ParameterType {
    /// Define a parameter type with a single regexp fragment.
    pub fn new<F>(name: impl Into<String>, regexp: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&str) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            regexps: vec![regexp.into()],
            transform: Arc::new(transform),
        }
    }

    /// Define a parameter type matching any of several regexp fragments.
    pub fn with_regexps<F>(
        name: impl Into<String>,
        regexps: Vec<String>,
        transform: F,
    ) -> Self
    where
        F: Fn(&str) -> Result<Value, TransformError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            regexps,
            transform: Arc::new(transform),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    pub(crate) fn regexps(&self) -> &[String] { &self.regexps }

    /// Run the transform over a captured fragment.
    pub(crate) fn transform(&self, raw: &str) -> Result<Value, TransformError> {
        (self.transform)(raw)
    }
}

/// Frozen lookup table of parameter types.
#[derive(Clone, Debug)]
pub struct ParameterTypeRegistry {
    types: HashMap<String, ParameterType>,
}

impl Default for ParameterTypeRegistry {
    fn default() -> Self {
        let mut registry = Self {
            types: HashMap::new(),
        };
        for builtin in builtin_types() {
            // Built-in names are distinct and their regexps are well formed.
            let _ = registry.define(builtin);
        }
        registry
    }
}

impl ParameterTypeRegistry {
    /// Register a parameter type.
    ///
    /// # Errors
    ///
    /// Rejects duplicate names, regexps that do not compile, and regexps
    /// containing capture groups (which would desynchronize argument
    /// extraction).
    pub fn define(&mut self, parameter_type: ParameterType) -> Result<(), ParameterTypeError> {
        if self.types.contains_key(parameter_type.name()) {
            return Err(ParameterTypeError::Duplicate(parameter_type.name().to_owned()));
        }
        for pattern in parameter_type.regexps() {
            let compiled = Regex::new(pattern).map_err(|source| {
                ParameterTypeError::InvalidRegexp {
                    name: parameter_type.name().to_owned(),
                    pattern: pattern.clone(),
                    source,
                }
            })?;
            if compiled.captures_len() > 1 {
                return Err(ParameterTypeError::CaptureGroup {
                    name: parameter_type.name().to_owned(),
                    pattern: pattern.clone(),
                });
            }
        }
        self.types
            .insert(parameter_type.name().to_owned(), parameter_type);
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ParameterType> { self.types.get(name) }
}

fn transform_error(type_name: &str, raw: &str, message: impl Into<String>) -> TransformError {
    TransformError {
        type_name: type_name.to_owned(),
        raw: raw.to_owned(),
        message: message.into(),
    }
}

fn builtin_types() -> Vec<ParameterType> {
    vec![
        ParameterType::new("int", r"-?\d+", |raw| {
            raw.parse::<i64>()
                .map(Value::from)
                .map_err(|e| transform_error("int", raw, e.to_string()))
        }),
        ParameterType::new(
            "float",
            r"[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?",
            |raw| {
                let parsed = raw
                    .parse::<f64>()
                    .map_err(|e| transform_error("float", raw, e.to_string()))?;
                serde_json::Number::from_f64(parsed)
                    .map(Value::Number)
                    .ok_or_else(|| transform_error("float", raw, "not a finite number"))
            },
        ),
        ParameterType::new("word", r"[^\s]+", |raw| Ok(Value::from(raw))),
        ParameterType::new("string", r#""[^"]*"|'[^']*'"#, |raw| {
            let unquoted = raw
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .or_else(|| raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
                .unwrap_or(raw);
            Ok(Value::from(unquoted))
        }),
        // Anonymous `{}` captures anything and stays a string.
        ParameterType::new("", r".*", |raw| Ok(Value::from(raw))),
    ]
}
