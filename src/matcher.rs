//! Step matching against the registered step definitions.
//!
//! Matching tries *every* definition and collects all successful matches
//! before deciding between matched, undefined and ambiguous, so ambiguity
//! is never masked by registration order. It is a pure function of the
//! library and the step text: argument transforms run eagerly, but a
//! transform failure is carried inside the match and only surfaces as a
//! step failure when the step is actually executed.

use serde_json::Value;

use crate::{
    param::TransformError,
    support::SupportCodeLibrary,
};

/// A successful match: which definition won and the extracted arguments.
#[derive(Clone, Debug)]
pub struct MatchedStep {
    /// Index of the winning definition in the library's step list.
    pub def_index: usize,
    /// Stable id of the winning definition.
    pub def_id: u64,
    /// Transformed arguments, or the first transform failure.
    pub args: Result<Vec<Value>, TransformError>,
}

/// Outcome of resolving one step's text.
#[derive(Clone, Debug)]
pub enum MatchOutcome {
    Matched(MatchedStep),
    /// No definition's pattern matched the text.
    Undefined,
    /// Two or more definitions matched; carries their ids for diagnostics.
    Ambiguous(Vec<u64>),
}

/// Resolve `text` against every step definition in the library.
#[must_use]
pub fn match_step(library: &SupportCodeLibrary, text: &str) -> MatchOutcome {
    let mut matches: Vec<(usize, Vec<String>)> = Vec::new();
    for (index, def) in library.steps().iter().enumerate() {
        if let Some(captures) = def.expression().captures(text) {
            matches.push((index, captures));
        }
    }
    match matches.len() {
        0 => MatchOutcome::Undefined,
        1 => {
            let (def_index, captures) = matches.remove(0);
            let def = &library.steps()[def_index];
            MatchOutcome::Matched(MatchedStep {
                def_index,
                def_id: def.id(),
                args: transform_captures(library, def_index, &captures),
            })
        }
        _ => MatchOutcome::Ambiguous(
            matches
                .iter()
                .map(|(index, _)| library.steps()[*index].id())
                .collect(),
        ),
    }
}

fn transform_captures(
    library: &SupportCodeLibrary,
    def_index: usize,
    captures: &[String],
) -> Result<Vec<Value>, TransformError> {
    let def = &library.steps()[def_index];
    let mut args = Vec::with_capacity(captures.len());
    for (raw, parameter) in captures.iter().zip(def.expression().parameters()) {
        let value = match parameter.as_deref() {
            // Raw-regex groups transform through the anonymous type.
            None | Some("") => anonymous_transform(library, raw)?,
            Some(name) => match library.registry().lookup(name) {
                Some(parameter_type) => parameter_type.transform(raw)?,
                // The expression compiled, so the type existed at build
                // time; treat a missing entry as an anonymous capture.
                None => Value::from(raw.as_str()),
            },
        };
        args.push(value);
    }
    Ok(args)
}

fn anonymous_transform(
    library: &SupportCodeLibrary,
    raw: &str,
) -> Result<Value, TransformError> {
    match library.registry().lookup("") {
        Some(anonymous) => anonymous.transform(raw),
        None => Ok(Value::from(raw)),
    }
}
