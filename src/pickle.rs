//! Compiled test-case model consumed by the execution runtime.
//!
//! A [`Pickle`] is one fully-resolved, executable scenario produced by the
//! (external) specification parser: an ordered list of steps plus the tags
//! and source locations needed for filtering and reporting. Pickles are
//! immutable; the runtime shares them across adapters and workers via
//! [`std::sync::Arc`] and never mutates them.

use serde::Serialize;

/// Position of an element in its source document, 1-based.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl Location {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self { Self { line, column } }
}

/// Keyword classification of a step, already normalized by the parser.
///
/// Conjunction keywords (`And`/`But`) inherit the semantics of the
/// preceding step; the runtime treats all four classes identically and
/// carries the classification through to the message stream only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKeyword {
    Context,
    Action,
    Outcome,
    Conjunction,
}

/// Structured argument attached to a step: a multiline text block or a
/// table of cells.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StepArgument {
    DocString {
        media_type: Option<String>,
        content: String,
    },
    DataTable {
        rows: Vec<Vec<String>>,
    },
}

/// One line of a test case, matched against a step definition pattern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PickleStep {
    /// Stable identifier assigned by the parser, echoed in step messages.
    pub id: String,
    pub text: String,
    pub keyword: StepKeyword,
    pub argument: Option<StepArgument>,
    pub location: Location,
}

impl PickleStep {
    /// Convenience constructor for a bare step with no structured argument.
    #[must_use]
    pub fn new(id: impl Into<String>, keyword: StepKeyword, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            keyword,
            argument: None,
            location: Location::default(),
        }
    }

    /// Attach a structured argument to the step.
    #[must_use]
    pub fn with_argument(mut self, argument: StepArgument) -> Self {
        self.argument = Some(argument);
        self
    }
}

/// An immutable, fully-resolved scenario.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pickle {
    /// Stable identifier assigned by the parser.
    pub id: String,
    /// Display name shown by formatters.
    pub name: String,
    /// Source document the scenario was compiled from.
    pub uri: String,
    pub location: Location,
    pub steps: Vec<PickleStep>,
    /// Tags inherited from the feature and scenario, `@`-prefixed.
    pub tags: Vec<String>,
}

impl Pickle {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<PickleStep>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            uri: String::new(),
            location: Location::default(),
            steps,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the pickle carries the given tag.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool { self.tags.iter().any(|t| t == tag) }
}
