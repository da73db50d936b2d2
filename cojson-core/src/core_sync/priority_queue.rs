//! Outgoing message queue with three traffic lanes
//!
//! Entries are thunks, not payloads: the message is only built when its
//! slot is actually sent, so a backed-up peer holds closures instead of
//! serialized content. `High` drains before `Medium` before `Low`; within a
//! lane order is FIFO.

use crate::core_covalue::CoValuePriority;
use std::collections::VecDeque;

/// Deferred message; `None` means nothing is left to send by the time it runs
pub type Thunk<T> = Box<dyn FnOnce() -> Option<T> + Send>;

pub struct PriorityQueue<T> {
    high: VecDeque<Thunk<T>>,
    medium: VecDeque<Thunk<T>>,
    low: VecDeque<Thunk<T>>,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self { high: VecDeque::new(), medium: VecDeque::new(), low: VecDeque::new() }
    }

    fn lane(&mut self, priority: CoValuePriority) -> &mut VecDeque<Thunk<T>> {
        match priority {
            CoValuePriority::High => &mut self.high,
            CoValuePriority::Medium => &mut self.medium,
            CoValuePriority::Low => &mut self.low,
        }
    }

    pub fn push_lazy(&mut self, priority: CoValuePriority, thunk: Thunk<T>) {
        self.lane(priority).push_back(thunk);
    }

    /// Enqueue an already built value
    pub fn push(&mut self, priority: CoValuePriority, value: T)
    where
        T: Send + 'static,
    {
        self.push_lazy(priority, Box::new(move || Some(value)));
    }

    /// Next thunk without running it, for callers that must not hold a lock meanwhile
    pub fn pop_thunk(&mut self) -> Option<Thunk<T>> {
        self.high
            .pop_front()
            .or_else(|| self.medium.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// Materialize the next value, skipping thunks that produce nothing
    pub fn pop(&mut self) -> Option<T> {
        loop {
            if let Some(value) = self.pop_thunk()?() {
                return Some(value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.high.clear();
        self.medium.clear();
        self.low.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_drains_high_then_medium_then_low() {
        let mut queue = PriorityQueue::new();
        queue.push(CoValuePriority::Low, "low-1");
        queue.push(CoValuePriority::Medium, "medium-1");
        queue.push(CoValuePriority::High, "high-1");
        queue.push(CoValuePriority::Low, "low-2");
        queue.push(CoValuePriority::High, "high-2");

        let drained: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, vec!["high-1", "high-2", "medium-1", "low-1", "low-2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_thunks_materialize_only_when_popped() {
        let built = Arc::new(AtomicUsize::new(0));
        let mut queue = PriorityQueue::new();
        for i in 0..3 {
            let built = built.clone();
            queue.push_lazy(
                CoValuePriority::Medium,
                Box::new(move || {
                    built.fetch_add(1, Ordering::SeqCst);
                    Some(i)
                }),
            );
        }
        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop(), Some(0));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_thunks_are_skipped() {
        let mut queue: PriorityQueue<u32> = PriorityQueue::new();
        queue.push_lazy(CoValuePriority::High, Box::new(|| None));
        queue.push(CoValuePriority::Low, 9);
        assert_eq!(queue.pop(), Some(9));
        assert_eq!(queue.pop(), None);
    }
}
