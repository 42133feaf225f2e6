//! The result of processing one batch.

use crate::core::Event;
use serde::{Deserialize, Serialize};

/// Maps downstream stage names to the events that should flow there.
///
/// Routes keep insertion order; routing to the same stage twice appends to the
/// existing entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    routes: Vec<(String, Vec<Event>)>,
}

impl StageOutput {
    /// Ends this branch of the pipeline.
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    /// Routes events to a single downstream stage.
    #[must_use]
    pub fn route(stage: impl Into<String>, events: Vec<Event>) -> Self {
        Self::done().and(stage, events)
    }

    /// Adds another route.
    #[must_use]
    pub fn and(mut self, stage: impl Into<String>, events: Vec<Event>) -> Self {
        self.push(stage, events);
        self
    }

    /// Adds events for a stage in place.
    pub fn push(&mut self, stage: impl Into<String>, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let stage = stage.into();
        match self.routes.iter_mut().find(|(name, _)| *name == stage) {
            Some((_, existing)) => existing.extend(events),
            None => self.routes.push((stage, events)),
        }
    }

    /// Returns true if nothing flows downstream.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Returns the number of downstream stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns the events routed to a stage.
    #[must_use]
    pub fn events_for(&self, stage: &str) -> Option<&[Event]> {
        self.routes
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, events)| events.as_slice())
    }

    /// Consumes the output, yielding `(stage, events)` pairs.
    #[must_use]
    pub fn into_routes(self) -> Vec<(String, Vec<Event>)> {
        self.routes
    }
}

impl FromIterator<(String, Vec<Event>)> for StageOutput {
    fn from_iter<I: IntoIterator<Item = (String, Vec<Event>)>>(iter: I) -> Self {
        let mut output = Self::done();
        for (stage, events) in iter {
            output.push(stage, events);
        }
        output
    }
}
