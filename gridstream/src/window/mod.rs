//! Node-local event windows.
//!
//! A window buffers events for stages running on one node. Its eviction policy
//! is opaque to the pipeline; the pipeline only needs to reset windows and read
//! their sizes for metrics.

use crate::core::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;

/// An ordered, evictable event container shared by the stages of one node.
pub trait Window: Send + Sync + Debug {
    /// Returns the window name. Must be unique within a pipeline.
    fn name(&self) -> &str;

    /// Appends events, evicting older ones if the policy requires it.
    fn put(&self, events: Vec<Event>);

    /// Returns the retained events, oldest first.
    fn get(&self) -> Vec<Event>;

    /// Removes and returns up to `max` evicted events, oldest first.
    fn poll_evicted(&self, max: usize) -> Vec<Event>;

    /// Returns the number of retained events.
    fn size(&self) -> usize;

    /// Returns the number of evicted events not yet polled.
    fn eviction_queue_size(&self) -> usize;

    /// Clears all content.
    fn reset(&self);

    /// Called once when the owning pipeline starts.
    fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the owning pipeline stops.
    fn on_stop(&self) {}
}

#[derive(Debug, Default)]
struct Buffers {
    retained: VecDeque<Event>,
    evicted: VecDeque<Event>,
}

impl Buffers {
    fn poll_evicted(&mut self, max: usize) -> Vec<Event> {
        let n = max.min(self.evicted.len());
        self.evicted.drain(..n).collect()
    }

    fn clear(&mut self) {
        self.retained.clear();
        self.evicted.clear();
    }
}

/// A window that never evicts.
#[derive(Debug)]
pub struct UnboundedWindow {
    name: String,
    buffers: Mutex<Buffers>,
}

impl UnboundedWindow {
    /// Creates an empty unbounded window.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffers: Mutex::new(Buffers::default()),
        }
    }
}

impl Window for UnboundedWindow {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, events: Vec<Event>) {
        self.buffers.lock().retained.extend(events);
    }

    fn get(&self) -> Vec<Event> {
        self.buffers.lock().retained.iter().cloned().collect()
    }

    fn poll_evicted(&self, max: usize) -> Vec<Event> {
        self.buffers.lock().poll_evicted(max)
    }

    fn size(&self) -> usize {
        self.buffers.lock().retained.len()
    }

    fn eviction_queue_size(&self) -> usize {
        self.buffers.lock().evicted.len()
    }

    fn reset(&self) {
        self.buffers.lock().clear();
    }
}

/// A FIFO window retaining at most `max_size` events.
///
/// Overflowing events move to the eviction queue.
#[derive(Debug)]
pub struct SizeBoundedWindow {
    name: String,
    max_size: usize,
    buffers: Mutex<Buffers>,
}

impl SizeBoundedWindow {
    /// Creates an empty window of the given capacity.
    #[must_use]
    pub fn new(name: impl Into<String>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            max_size,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    /// Returns the capacity.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Window for SizeBoundedWindow {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, events: Vec<Event>) {
        let mut buffers = self.buffers.lock();
        buffers.retained.extend(events);
        while buffers.retained.len() > self.max_size {
            if let Some(old) = buffers.retained.pop_front() {
                buffers.evicted.push_back(old);
            }
        }
    }

    fn get(&self) -> Vec<Event> {
        self.buffers.lock().retained.iter().cloned().collect()
    }

    fn poll_evicted(&self, max: usize) -> Vec<Event> {
        self.buffers.lock().poll_evicted(max)
    }

    fn size(&self) -> usize {
        self.buffers.lock().retained.len()
    }

    fn eviction_queue_size(&self) -> usize {
        self.buffers.lock().evicted.len()
    }

    fn reset(&self) {
        self.buffers.lock().clear();
    }
}

/// The windows of one pipeline. The first window is the default one.
#[derive(Debug, Clone)]
pub struct WindowSet {
    windows: Vec<Arc<dyn Window>>,
}

impl WindowSet {
    /// Creates a window set; callers validate that it is non-empty.
    #[must_use]
    pub fn new(windows: Vec<Arc<dyn Window>>) -> Self {
        Self { windows }
    }

    /// Returns the default window.
    #[must_use]
    pub fn default_window(&self) -> Option<&Arc<dyn Window>> {
        self.windows.first()
    }

    /// Looks a window up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Window>> {
        self.windows.iter().find(|w| w.name() == name)
    }

    /// Iterates windows in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Window>> {
        self.windows.iter()
    }

    /// Returns the number of windows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Returns true if there are no windows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unbounded_window_keeps_order() {
        let window = UnboundedWindow::new("w");
        window.put(vec![json!(1), json!(2)]);
        window.put(vec![json!(3)]);

        assert_eq!(window.get(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(window.size(), 3);
        assert_eq!(window.eviction_queue_size(), 0);
    }

    #[test]
    fn test_size_bounded_window_evicts_oldest() {
        let window = SizeBoundedWindow::new("w", 2);
        window.put(vec![json!(1), json!(2), json!(3)]);

        assert_eq!(window.get(), vec![json!(2), json!(3)]);
        assert_eq!(window.eviction_queue_size(), 1);
        assert_eq!(window.poll_evicted(10), vec![json!(1)]);
        assert_eq!(window.eviction_queue_size(), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let window = SizeBoundedWindow::new("w", 1);
        window.put(vec![json!(1), json!(2)]);
        window.reset();

        assert_eq!(window.size(), 0);
        assert_eq!(window.eviction_queue_size(), 0);
    }

    #[test]
    fn test_window_set_default_is_first() {
        let set = WindowSet::new(vec![
            Arc::new(UnboundedWindow::new("first")),
            Arc::new(UnboundedWindow::new("second")),
        ]);

        assert_eq!(set.default_window().map(|w| w.name()), Some("first"));
        assert!(set.get("second").is_some());
        assert!(set.get("third").is_none());
        assert_eq!(set.len(), 2);
    }
}
