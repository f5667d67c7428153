//! Race window collection.
//!
//! Actors write race events to a collection path; the controller buffers the
//! events it observes and defers resolution for a short window after the
//! first one. Network jitter means the first *observed* write is not reliably
//! the first *performed* action, so the window plus event-carried local
//! timestamps approximates real-world ordering instead of store-arrival
//! order.

use std::collections::HashMap;

use uuid::Uuid;

use crate::engine::records::RaceEvent;

/// What the collector wants the driver to do after observing new events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAction {
    /// Nothing: a window is already pending or a resolution is in flight.
    Ignored,
    /// Start the collection window now.
    Opened,
}

/// In-memory buffer of competing race events, one entry per actor
/// (last write per actor wins).
#[derive(Debug, Default)]
pub struct RaceWindow {
    cache: HashMap<Uuid, RaceEvent>,
    window_open: bool,
    resolving: bool,
}

impl RaceWindow {
    /// Empty collector with no window pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an observed snapshot of the race collection into the cache.
    ///
    /// Returns [`WindowAction::Opened`] when this observation should start
    /// the collection window: there is at least one event, no window is
    /// already pending, and no resolution is in flight. Events observed
    /// while resolving stay cached for a later window.
    pub fn observe(&mut self, events: impl IntoIterator<Item = RaceEvent>) -> WindowAction {
        for event in events {
            self.cache.insert(event.actor_id, event);
        }

        if !self.cache.is_empty() && !self.window_open && !self.resolving {
            self.window_open = true;
            WindowAction::Opened
        } else {
            WindowAction::Ignored
        }
    }

    /// Close the window and hand the batch to the resolver, flipping the
    /// re-entrancy guard so concurrent observations cannot start another
    /// resolution.
    pub fn begin_resolution(&mut self) -> Vec<RaceEvent> {
        self.window_open = false;
        self.resolving = true;
        self.cache.drain().map(|(_, event)| event).collect()
    }

    /// Mark the in-flight resolution finished. Returns true when events
    /// cached during the resolution warrant opening a fresh window.
    pub fn finish_resolution(&mut self) -> bool {
        self.resolving = false;
        if self.cache.is_empty() {
            false
        } else {
            self.window_open = true;
            true
        }
    }

    /// Drop everything: the pending race was cancelled by the controller.
    pub fn cancel(&mut self) {
        self.cache.clear();
        self.window_open = false;
        self.resolving = false;
    }

    /// Whether any events are currently buffered.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(actor: Uuid, local_ts: i64) -> RaceEvent {
        RaceEvent {
            actor_id: actor,
            local_ts,
            offset_ms: 0,
        }
    }

    #[test]
    fn first_event_opens_the_window_once() {
        let mut window = RaceWindow::new();
        let actor = Uuid::new_v4();

        assert_eq!(window.observe([event(actor, 10)]), WindowAction::Opened);
        assert_eq!(
            window.observe([event(Uuid::new_v4(), 12)]),
            WindowAction::Ignored
        );
    }

    #[test]
    fn duplicate_buzz_from_one_actor_keeps_a_single_entry() {
        let mut window = RaceWindow::new();
        let actor = Uuid::new_v4();
        window.observe([event(actor, 10)]);
        window.observe([event(actor, 25)]);

        let batch = window.begin_resolution();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].local_ts, 25);
    }

    #[test]
    fn events_during_resolution_reopen_a_fresh_window() {
        let mut window = RaceWindow::new();
        window.observe([event(Uuid::new_v4(), 10)]);
        let batch = window.begin_resolution();
        assert_eq!(batch.len(), 1);

        // Late arrival while the resolver is running: cached, not resolved.
        assert_eq!(
            window.observe([event(Uuid::new_v4(), 40)]),
            WindowAction::Ignored
        );
        assert!(window.finish_resolution());

        let second = window.begin_resolution();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].local_ts, 40);
    }

    #[test]
    fn finish_without_new_events_stays_idle() {
        let mut window = RaceWindow::new();
        window.observe([event(Uuid::new_v4(), 10)]);
        window.begin_resolution();
        assert!(!window.finish_resolution());
        assert!(window.is_empty());
    }

    #[test]
    fn cancel_resets_all_guards() {
        let mut window = RaceWindow::new();
        window.observe([event(Uuid::new_v4(), 10)]);
        window.begin_resolution();
        window.cancel();

        // A fresh event may open a new window immediately.
        assert_eq!(window.observe([event(Uuid::new_v4(), 50)]), WindowAction::Opened);
    }
}
