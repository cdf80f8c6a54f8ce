//! Attachment and log sink scoped to the currently executing step or hook.
//!
//! Handler code receives a cloneable [`AttachmentSink`] handle and may push
//! free-text log lines or binary attachments at any point while it runs.
//! The executor switches the sink's active context exactly at each phase
//! transition, so every pushed item lands on the unit that was running
//! when it was pushed and never leaks into a sibling's result.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::event::UnitRef;

/// Media type used for plain log lines pushed via [`AttachmentSink::log`].
pub const LOG_MEDIA_TYPE: &str = "text/x.log+plain";

/// One item captured by the sink while a unit was active.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkItem {
    Log { text: String },
    Attachment { media_type: String, body: Vec<u8> },
}

#[derive(Debug, Default)]
struct Inner {
    active: Option<UnitRef>,
    items: Vec<(UnitRef, SinkItem)>,
}

/// Cloneable handle to the per-attempt attachment buffer.
#[derive(Clone, Debug, Default)]
pub struct AttachmentSink {
    inner: Arc<Mutex<Inner>>,
}

impl AttachmentSink {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a diagnostic log line against the active step or hook.
    pub fn log(&self, text: impl Into<String>) {
        self.push(SinkItem::Log { text: text.into() });
    }

    /// Record a binary attachment with its media type against the active
    /// step or hook.
    pub fn attach(&self, body: Vec<u8>, media_type: impl Into<String>) {
        self.push(SinkItem::Attachment {
            media_type: media_type.into(),
            body,
        });
    }

    fn push(&self, item: SinkItem) {
        let mut inner = self.lock();
        match inner.active.clone() {
            Some(unit) => inner.items.push((unit, item)),
            // Pushes outside any unit have no owner to report under.
            None => warn!("attachment pushed outside a step or hook context; dropped"),
        }
    }

    /// Point the sink at the unit about to run, or at nothing between
    /// units.
    pub(crate) fn set_active(&self, unit: Option<UnitRef>) { self.lock().active = unit; }

    /// Remove and return every item recorded for `unit`.
    pub(crate) fn drain(&self, unit: &UnitRef) -> Vec<SinkItem> {
        let mut inner = self.lock();
        let mut drained = Vec::new();
        let mut kept = Vec::with_capacity(inner.items.len());
        for (owner, item) in inner.items.drain(..) {
            if owner == *unit {
                drained.push(item);
            } else {
                kept.push((owner, item));
            }
        }
        inner.items = kept;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_unit(id: &str) -> UnitRef { UnitRef::Step { id: id.to_owned() } }

    #[test]
    fn items_follow_the_active_unit() {
        let sink = AttachmentSink::new();
        sink.set_active(Some(step_unit("s1")));
        sink.log("from s1");
        sink.set_active(Some(step_unit("s2")));
        sink.attach(vec![1, 2, 3], "application/octet-stream");

        assert_eq!(
            sink.drain(&step_unit("s1")),
            vec![SinkItem::Log {
                text: "from s1".to_owned()
            }]
        );
        assert_eq!(
            sink.drain(&step_unit("s2")),
            vec![SinkItem::Attachment {
                media_type: "application/octet-stream".to_owned(),
                body: vec![1, 2, 3],
            }]
        );
    }

    #[test]
    fn pushes_outside_a_context_are_dropped() {
        let sink = AttachmentSink::new();
        sink.log("orphan");
        sink.set_active(Some(step_unit("s1")));
        assert!(sink.drain(&step_unit("s1")).is_empty());
    }

    #[test]
    fn draining_one_unit_leaves_siblings_intact() {
        let sink = AttachmentSink::new();
        sink.set_active(Some(step_unit("a")));
        sink.log("a1");
        sink.set_active(Some(step_unit("b")));
        sink.log("b1");
        sink.set_active(Some(step_unit("a")));
        sink.log("a2");

        let a_items = sink.drain(&step_unit("a"));
        assert_eq!(a_items.len(), 2);
        assert_eq!(sink.drain(&step_unit("b")).len(), 1);
    }
}
