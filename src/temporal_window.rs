//! Context frames for propagation: the first annotated frame plus a FIFO of
//! the most recently propagated ones.

use std::collections::VecDeque;

use candle_core::Tensor;

/// A frame and its soft label at feature resolution.
#[derive(Debug, Clone)]
pub struct ContextEntry {
    /// `[3, H, W]` normalized frame.
    pub frame: Tensor,
    /// `[1, num_classes, H / p, W / p]` soft label.
    pub label: Tensor,
}

impl ContextEntry {
    pub fn new(frame: Tensor, label: Tensor) -> Self {
        Self { frame, label }
    }
}

/// Fixed head plus a bounded FIFO tail.
///
/// The head (the first frame with its ground-truth label) is never evicted
/// and always leads [`TemporalWindow::context`]. Pushing into a full tail
/// drops the oldest tail entry.
#[derive(Debug, Clone)]
pub struct TemporalWindow<T> {
    first: T,
    recent: VecDeque<T>,
    capacity: usize,
}

impl<T> TemporalWindow<T> {
    pub fn new(first: T, capacity: usize) -> Self {
        Self {
            first,
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `entry`, returning the evicted entry if the tail was full.
    ///
    /// With zero capacity nothing is retained and `entry` itself is returned.
    pub fn push(&mut self, entry: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(entry);
        }
        let evicted = if self.recent.len() == self.capacity {
            self.recent.pop_front()
        } else {
            None
        };
        self.recent.push_back(entry);
        evicted
    }

    pub fn first(&self) -> &T {
        &self.first
    }

    /// Evictable entries, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &T> {
        self.recent.iter()
    }

    /// The first entry followed by the recent ones, oldest first.
    pub fn context(&self) -> impl Iterator<Item = &T> {
        std::iter::once(&self.first).chain(self.recent.iter())
    }

    /// Number of entries in [`TemporalWindow::context`].
    pub fn context_len(&self) -> usize {
        1 + self.recent.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of evictable entries currently held.
    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.recent.len() == self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_most_recent_in_fifo_order() {
        let capacity = 7;
        let mut window = TemporalWindow::new(0, capacity);
        for frame in 1..=(capacity + 4) {
            window.push(frame);
        }
        let recent: Vec<_> = window.recent().copied().collect();
        assert_eq!(recent, (5..=11).collect::<Vec<_>>());
        assert_eq!(window.len(), capacity);
        assert!(window.is_full());
    }

    #[test]
    fn test_first_always_leads_context() {
        let mut window = TemporalWindow::new("first", 2);
        assert_eq!(window.context().copied().collect::<Vec<_>>(), vec!["first"]);
        window.push("a");
        window.push("b");
        window.push("c");
        assert_eq!(
            window.context().copied().collect::<Vec<_>>(),
            vec!["first", "b", "c"]
        );
        assert_eq!(window.context_len(), 3);
        assert!(window.recent().all(|e| *e != "first"));
    }

    #[test]
    fn test_push_returns_evicted() {
        let mut window = TemporalWindow::new(0, 2);
        assert_eq!(window.push(1), None);
        assert_eq!(window.push(2), None);
        assert_eq!(window.push(3), Some(1));
        assert_eq!(window.push(4), Some(2));
    }

    #[test]
    fn test_zero_capacity_uses_first_only() {
        let mut window = TemporalWindow::new(0, 0);
        assert_eq!(window.push(1), Some(1));
        assert!(window.is_empty());
        assert_eq!(window.context().copied().collect::<Vec<_>>(), vec![0]);
    }
}
