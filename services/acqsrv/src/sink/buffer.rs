//! Bounded, insertion-ordered sample buffer

use std::collections::VecDeque;

use super::Sample;

/// Append-only queue that never grows past its capacity
///
/// When full, the oldest entry is dropped to make room and counted.
#[derive(Debug)]
pub struct BatchBuffer {
    entries: VecDeque<Sample>,
    capacity: usize,
    dropped: u64,
}

impl BatchBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append; returns how many old entries were dropped to make room
    pub fn push(&mut self, sample: Sample) -> usize {
        let mut dropped = 0;
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
            dropped += 1;
        }
        self.entries.push_back(sample);
        self.dropped += dropped as u64;
        dropped
    }

    /// Take every entry, leaving an empty buffer behind
    pub fn take(&mut self) -> Vec<Sample> {
        std::mem::take(&mut self.entries).into()
    }

    /// Put a failed batch back ahead of anything pushed since it was taken
    ///
    /// Returns how many of the oldest entries were dropped to stay within
    /// capacity.
    pub fn requeue(&mut self, batch: Vec<Sample>) -> usize {
        let newer = std::mem::take(&mut self.entries);
        self.entries = batch.into();
        self.entries.extend(newer);

        let excess = self.entries.len().saturating_sub(self.capacity);
        self.entries.drain(..excess);
        self.dropped += excess as u64;
        excess
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries dropped over the buffer's lifetime
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::sink::Point;

    fn sample(n: i64) -> Sample {
        Sample::new("b", Point::new("m", Utc::now()).field("n", n))
    }

    fn ids(samples: &[Sample]) -> Vec<String> {
        samples
            .iter()
            .map(|s| s.point.fields[0].1.to_string())
            .collect()
    }

    #[test]
    fn test_push_drops_oldest_at_capacity() {
        let mut buffer = BatchBuffer::new(3);
        for n in 0..5 {
            buffer.push(sample(n));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(ids(&buffer.take()), vec!["2i", "3i", "4i"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_requeue_goes_ahead_of_newer_entries() {
        let mut buffer = BatchBuffer::new(10);
        buffer.push(sample(0));
        buffer.push(sample(1));
        let batch = buffer.take();
        buffer.push(sample(2));

        assert_eq!(buffer.requeue(batch), 0);
        assert_eq!(ids(&buffer.take()), vec!["0i", "1i", "2i"]);
    }

    #[test]
    fn test_requeue_trims_oldest_beyond_capacity() {
        let mut buffer = BatchBuffer::new(3);
        buffer.push(sample(0));
        buffer.push(sample(1));
        let batch = buffer.take();
        buffer.push(sample(2));
        buffer.push(sample(3));

        assert_eq!(buffer.requeue(batch), 1);
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(ids(&buffer.take()), vec!["1i", "2i", "3i"]);
    }
}
