//! Support code library: the frozen snapshot of step definitions, hooks,
//! parameter types and per-run callbacks consumed by the executor.
//!
//! The library is produced by [`SupportCodeBuilder`], an explicit builder
//! passed down by the embedding application — never a process-wide
//! singleton. Registration methods return [`Result<Self>`] so chains fail
//! at build time: a malformed step pattern or tag expression is rejected
//! before any test case runs. Once built, the library is read-only and
//! shared by every concurrent executor in the process; worker pools
//! rebuild their own copy from the same registration sources via a
//! factory closure.

use std::{any::Any, fmt, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::{
    expression::{ExpressionError, StepExpression},
    param::{ParameterType, ParameterTypeError, ParameterTypeRegistry},
    pickle::{Pickle, StepArgument},
    sink::AttachmentSink,
    tags::{TagExpression, TagExpressionError},
};

/// Default handler timeout when neither the definition nor the builder
/// overrides it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while building a support code library.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    #[error(transparent)]
    TagExpression(#[from] TagExpressionError),
    #[error(transparent)]
    ParameterType(#[from] ParameterTypeError),
}

/// Signal returned by handler code to fail a unit or mark it pending.
///
/// Returning `Ok(())` passes the unit. Panics inside a handler are caught
/// by the executor and reported like [`HandlerError::Failure`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The step is acknowledged but its implementation is not done yet.
    #[error("pending")]
    Pending,
    /// The handler failed with the given description.
    #[error("{0}")]
    Failure(String),
}

impl HandlerError {
    /// Shorthand for a failure with a formatted description.
    pub fn failure(message: impl Into<String>) -> Self { Self::Failure(message.into()) }
}

/// Outcome of one handler invocation.
pub type HandlerResult = Result<(), HandlerError>;

/// The per-test-case sandbox object exposed to handler code.
///
/// A fresh world is constructed for every execution attempt and dropped
/// when the attempt finishes; it is never shared across cases or workers.
/// State a handler wants to carry between steps of the same case belongs
/// here and nowhere else.
pub struct World {
    inner: Box<dyn Any + Send>,
}

/// Cloneable handle to the attempt's [`World`].
///
/// Handler futures are `'static`, so they reach the world through this
/// handle rather than a borrow. The mutex is uncontended by construction:
/// only one step or hook of a case is ever in flight at a time.
#[derive(Clone)]
pub struct WorldHandle {
    inner: Arc<tokio::sync::Mutex<World>>,
}

impl WorldHandle {
    pub(crate) fn new(world: World) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(world)),
        }
    }

    /// Lock the world for the duration of one handler's work.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, World> { self.inner.lock().await }
}

impl fmt::Debug for WorldHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldHandle").finish_non_exhaustive()
    }
}

impl World {
    #[must_use]
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            inner: Box::new(value),
        }
    }

    /// Borrow the inner value if it has the expected type.
    #[must_use]
    pub fn get<T: Any>(&self) -> Option<&T> { self.inner.downcast_ref() }

    /// Mutably borrow the inner value if it has the expected type.
    #[must_use]
    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> { self.inner.downcast_mut() }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World").finish_non_exhaustive()
    }
}

/// Context handed to a step handler.
pub struct StepContext {
    /// Handle to the per-case world.
    pub world: WorldHandle,
    /// Typed arguments extracted from the step text, in capture order.
    pub args: Vec<Value>,
    /// Structured argument attached to the step, if any.
    pub argument: Option<StepArgument>,
    /// Sink for diagnostic logs and attachments, scoped to this step.
    pub sink: AttachmentSink,
}

/// Context handed to a hook handler.
pub struct HookContext {
    /// Handle to the per-case world.
    pub world: WorldHandle,
    /// Tags of the test case the hook is wrapping.
    pub tags: Vec<String>,
    /// Sink for diagnostic logs and attachments, scoped to this hook.
    pub sink: AttachmentSink,
}

/// Alias for asynchronous step handlers.
///
/// A handler owns its context, so its future is `'static` and can be
/// awaited under a timeout without borrowing executor state.
pub type StepHandler =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Alias for asynchronous hook handlers.
pub type HookHandler = Arc<dyn Fn(HookContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Constructor for the per-case [`World`], given the run's opaque
/// world parameters.
pub type WorldConstructor = Arc<dyn Fn(&Value) -> World + Send + Sync>;

/// Predicate deciding whether a queued case may run alongside the cases
/// currently in flight on other workers.
pub type ParallelCanAssign = Arc<dyn Fn(&Pickle, &[Arc<Pickle>]) -> bool + Send + Sync>;

/// Phase a hook is registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookPhase {
    BeforeCase,
    AfterCase,
    BeforeStep,
    AfterStep,
}

/// A registered step definition.
#[derive(Clone)]
pub struct StepDef {
    id: u64,
    expression: StepExpression,
    handler: StepHandler,
    timeout: Option<Duration>,
}

impl StepDef {
    /// Stable identity for reporting and ambiguity diagnostics.
    #[must_use]
    pub fn id(&self) -> u64 { self.id }

    #[must_use]
    pub fn expression(&self) -> &StepExpression { &self.expression }

    pub(crate) fn handler(&self) -> &StepHandler { &self.handler }

    pub(crate) fn timeout(&self) -> Option<Duration> { self.timeout }
}

impl fmt::Debug for StepDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDef")
            .field("id", &self.id)
            .field("expression", &self.expression.source())
            .finish_non_exhaustive()
    }
}

/// A registered hook definition.
#[derive(Clone)]
pub struct HookDef {
    id: u64,
    phase: HookPhase,
    handler: HookHandler,
    tag_filter: Option<TagExpression>,
    timeout: Option<Duration>,
}

impl HookDef {
    #[must_use]
    pub fn id(&self) -> u64 { self.id }

    #[must_use]
    pub fn phase(&self) -> HookPhase { self.phase }

    /// Whether the hook applies to a case with the given tags.
    #[must_use]
    pub fn applies_to(&self, tags: &[String]) -> bool {
        self.tag_filter.as_ref().is_none_or(|f| f.evaluate(tags))
    }

    pub(crate) fn handler(&self) -> &HookHandler { &self.handler }

    pub(crate) fn timeout(&self) -> Option<Duration> { self.timeout }
}

impl fmt::Debug for HookDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDef")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Builder producing one immutable [`SupportCodeLibrary`] snapshot.
///
/// Parameter types must be defined before the step definitions that
/// reference them, since step patterns compile eagerly on registration.
pub struct SupportCodeBuilder {
    registry: ParameterTypeRegistry,
    steps: Vec<StepDef>,
    before_case: Vec<HookDef>,
    after_case: Vec<HookDef>,
    before_step: Vec<HookDef>,
    after_step: Vec<HookDef>,
    default_timeout: Duration,
    world: WorldConstructor,
    parallel_can_assign: ParallelCanAssign,
    next_id: u64,
}

impl Default for SupportCodeBuilder {
    fn default() -> Self { Self::new() }
}

impl SupportCodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: ParameterTypeRegistry::default(),
            steps: Vec::new(),
            before_case: Vec::new(),
            after_case: Vec::new(),
            before_step: Vec::new(),
            after_step: Vec::new(),
            default_timeout: DEFAULT_TIMEOUT,
            world: Arc::new(|_| World::new(())),
            parallel_can_assign: Arc::new(|_, _| true),
            next_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Define a custom parameter type for use in later step expressions.
    ///
    /// # Errors
    ///
    /// Propagates [`ParameterTypeError`] for duplicates and malformed
    /// regexps.
    pub fn parameter_type(mut self, parameter_type: ParameterType) -> Result<Self, LibraryError> {
        self.registry.define(parameter_type)?;
        Ok(self)
    }

    /// Register a step definition with a literal expression pattern.
    ///
    /// # Errors
    ///
    /// Fails when the expression does not compile against the registry.
    pub fn step(self, pattern: &str, handler: StepHandler) -> Result<Self, LibraryError> {
        self.step_with_timeout(pattern, None, handler)
    }

    /// Register a step definition with a per-handler timeout override.
    ///
    /// # Errors
    ///
    /// Fails when the expression does not compile against the registry.
    pub fn step_with_timeout(
        mut self,
        pattern: &str,
        timeout: Option<Duration>,
        handler: StepHandler,
    ) -> Result<Self, LibraryError> {
        let expression = StepExpression::expression(pattern, &self.registry)?;
        let id = self.next_id();
        self.steps.push(StepDef {
            id,
            expression,
            handler,
            timeout,
        });
        Ok(self)
    }

    /// Register a step definition backed by a raw regular expression.
    ///
    /// # Errors
    ///
    /// Fails when the pattern is not a valid regular expression.
    pub fn step_regex(mut self, pattern: &str, handler: StepHandler) -> Result<Self, LibraryError> {
        let expression = StepExpression::regex(pattern)?;
        let id = self.next_id();
        self.steps.push(StepDef {
            id,
            expression,
            handler,
            timeout: None,
        });
        Ok(self)
    }

    /// Register a hook for the given phase, optionally tag-filtered.
    ///
    /// Before-phase hooks run in registration order; after-phase hooks run
    /// in reverse registration order, so the outermost hook wraps the
    /// innermost.
    ///
    /// # Errors
    ///
    /// Fails when the tag filter does not parse.
    pub fn hook(
        mut self,
        phase: HookPhase,
        tag_filter: Option<&str>,
        timeout: Option<Duration>,
        handler: HookHandler,
    ) -> Result<Self, LibraryError> {
        let tag_filter = tag_filter.map(TagExpression::parse).transpose()?;
        let id = self.next_id();
        let def = HookDef {
            id,
            phase,
            handler,
            tag_filter,
            timeout,
        };
        match phase {
            HookPhase::BeforeCase => self.before_case.push(def),
            HookPhase::AfterCase => self.after_case.push(def),
            HookPhase::BeforeStep => self.before_step.push(def),
            HookPhase::AfterStep => self.after_step.push(def),
        }
        Ok(self)
    }

    /// Override the library-wide default handler timeout.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Install a custom world constructor.
    #[must_use]
    pub fn world(mut self, constructor: WorldConstructor) -> Self {
        self.world = constructor;
        self
    }

    /// Install the parallel assignment predicate consulted by the worker
    /// pool before dispatching a case alongside in-flight ones.
    #[must_use]
    pub fn parallel_can_assign(mut self, predicate: ParallelCanAssign) -> Self {
        self.parallel_can_assign = predicate;
        self
    }

    /// Freeze the builder into an immutable library snapshot.
    #[must_use]
    pub fn build(self) -> SupportCodeLibrary {
        SupportCodeLibrary {
            registry: self.registry,
            steps: self.steps,
            before_case: self.before_case,
            after_case: self.after_case,
            before_step: self.before_step,
            after_step: self.after_step,
            default_timeout: self.default_timeout,
            world: self.world,
            parallel_can_assign: self.parallel_can_assign,
        }
    }
}

/// Frozen snapshot of all registered support code.
#[derive(Clone)]
pub struct SupportCodeLibrary {
    registry: ParameterTypeRegistry,
    steps: Vec<StepDef>,
    before_case: Vec<HookDef>,
    after_case: Vec<HookDef>,
    before_step: Vec<HookDef>,
    after_step: Vec<HookDef>,
    default_timeout: Duration,
    world: WorldConstructor,
    parallel_can_assign: ParallelCanAssign,
}

impl fmt::Debug for SupportCodeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupportCodeLibrary")
            .field("steps", &self.steps.len())
            .field("before_case", &self.before_case.len())
            .field("after_case", &self.after_case.len())
            .field("before_step", &self.before_step.len())
            .field("after_step", &self.after_step.len())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl SupportCodeLibrary {
    #[must_use]
    pub fn steps(&self) -> &[StepDef] { &self.steps }

    /// Hooks for a phase, in registration order.
    #[must_use]
    pub fn hooks(&self, phase: HookPhase) -> &[HookDef] {
        match phase {
            HookPhase::BeforeCase => &self.before_case,
            HookPhase::AfterCase => &self.after_case,
            HookPhase::BeforeStep => &self.before_step,
            HookPhase::AfterStep => &self.after_step,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ParameterTypeRegistry { &self.registry }

    #[must_use]
    pub fn default_timeout(&self) -> Duration { self.default_timeout }

    /// Construct a fresh world for one execution attempt.
    #[must_use]
    pub fn make_world(&self, parameters: &Value) -> World { (self.world)(parameters) }

    pub(crate) fn can_assign(&self, candidate: &Pickle, in_flight: &[Arc<Pickle>]) -> bool {
        (self.parallel_can_assign)(candidate, in_flight)
    }

    /// Whether any step or hook definitions were registered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
            && self.before_case.is_empty()
            && self.after_case.is_empty()
            && self.before_step.is_empty()
            && self.after_step.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    fn noop_step() -> StepHandler { Arc::new(|_| async { Ok(()) }.boxed()) }

    fn noop_hook() -> HookHandler { Arc::new(|_| async { Ok(()) }.boxed()) }

    #[test]
    fn invalid_pattern_is_rejected_at_registration() {
        let result = SupportCodeBuilder::new().step("a {bogus} step", noop_step());
        assert!(matches!(
            result,
            Err(LibraryError::Expression(ExpressionError::UndefinedParameterType(_)))
        ));
    }

    #[test]
    fn invalid_tag_filter_is_rejected_at_registration() {
        let result = SupportCodeBuilder::new().hook(
            HookPhase::BeforeCase,
            Some("@a and"),
            None,
            noop_hook(),
        );
        assert!(matches!(result, Err(LibraryError::TagExpression(_))));
    }

    #[test]
    fn definitions_receive_distinct_ids() {
        let library = SupportCodeBuilder::new()
            .step("first", noop_step())
            .unwrap()
            .step("second", noop_step())
            .unwrap()
            .hook(HookPhase::AfterCase, None, None, noop_hook())
            .unwrap()
            .build();
        let mut ids: Vec<u64> = library.steps().iter().map(StepDef::id).collect();
        ids.extend(library.hooks(HookPhase::AfterCase).iter().map(HookDef::id));
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn empty_library_reports_empty() {
        assert!(SupportCodeBuilder::new().build().is_empty());
    }

    #[test]
    fn hook_tag_filter_scopes_applicability() {
        let library = SupportCodeBuilder::new()
            .hook(HookPhase::BeforeCase, Some("@db"), None, noop_hook())
            .unwrap()
            .build();
        let hook = &library.hooks(HookPhase::BeforeCase)[0];
        assert!(hook.applies_to(&["@db".to_owned()]));
        assert!(!hook.applies_to(&["@web".to_owned()]));
    }

    #[test]
    fn world_downcasts() {
        let mut world = World::new(7u32);
        assert_eq!(world.get::<u32>(), Some(&7));
        *world.get_mut::<u32>().unwrap() = 9;
        assert_eq!(world.get::<u32>(), Some(&9));
        assert!(world.get::<String>().is_none());
    }
}
