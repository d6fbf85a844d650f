//! Notifications from the engine to the UI layer.

use crate::session::SessionState;
use crate::store::{ChatRecord, FileRecord};

/// UI-facing sink. Called from engine threads, so implementations must not block.
pub trait EventSink: Send + Sync {
    fn on_state_changed(&self, state: SessionState);
    /// A chat was sent or received and has been persisted.
    fn on_chat(&self, record: &ChatRecord);
    fn on_vibrate(&self);
    /// A transfer task was created and persisted.
    fn on_new_task(&self, record: &FileRecord);
}

/// Sink that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn on_state_changed(&self, _state: SessionState) {}
    fn on_chat(&self, _record: &ChatRecord) {}
    fn on_vibrate(&self) {}
    fn on_new_task(&self, _record: &FileRecord) {}
}
