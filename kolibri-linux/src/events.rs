//! Channel-backed UI sink: engine notifications become [`Event`]s on an unbounded queue.

use kolibri_core::{ChatRecord, EventSink, FileRecord, SessionState};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StateChanged(SessionState),
    Chat(ChatRecord),
    Vibrate,
    NewTask(FileRecord),
}

/// Forwards notifications to an unbounded channel; never blocks the engine.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: Event) {
        // receiver gone means the UI went away; nothing left to tell
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelSink {
    fn on_state_changed(&self, state: SessionState) {
        self.emit(Event::StateChanged(state));
    }

    fn on_chat(&self, record: &ChatRecord) {
        self.emit(Event::Chat(record.clone()));
    }

    fn on_vibrate(&self) {
        self.emit(Event::Vibrate);
    }

    fn on_new_task(&self, record: &FileRecord) {
        self.emit(Event::NewTask(record.clone()));
    }
}
