//! Event schedules
//!
//! Always sorted ascending by fire time. Identity is the event id: two
//! events may share a fire time, but inserting an id that already exists
//! replaces the old entry.

use crate::sync::Event;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schedule {
    events: Vec<Event>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an unordered list; later duplicates of an id win
    pub fn from_events(events: impl IntoIterator<Item = Event>) -> Self {
        let mut schedule = Self::new();
        for event in events {
            schedule.insert(event);
        }
        schedule
    }

    /// Insert or replace by id. Returns the replaced event.
    pub fn insert(&mut self, event: Event) -> Option<Event> {
        let replaced = self.remove(&event.id);
        // Equal fire times keep insertion order
        let at = self
            .events
            .partition_point(|e| e.fire_time.total_cmp(&event.fire_time).is_le());
        self.events.insert(at, event);
        replaced
    }

    pub fn remove(&mut self, id: &str) -> Option<Event> {
        let idx = self.events.iter().position(|e| e.id == id)?;
        Some(self.events.remove(idx))
    }

    pub fn get(&self, id: &str) -> Option<&Event> {
        self.events.iter().find(|e| e.id == id)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn to_vec(&self) -> Vec<Event> {
        self.events.clone()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Last event at or before `elapsed_secs`
    pub fn current_at(&self, elapsed_secs: f64) -> Option<&Event> {
        let idx = self
            .events
            .partition_point(|e| e.fire_time.total_cmp(&elapsed_secs).is_le());
        idx.checked_sub(1).map(|i| &self.events[i])
    }

    /// First event strictly after `elapsed_secs`
    pub fn next_after(&self, elapsed_secs: f64) -> Option<&Event> {
        let idx = self
            .events
            .partition_point(|e| e.fire_time.total_cmp(&elapsed_secs).is_le());
        self.events.get(idx)
    }
}
