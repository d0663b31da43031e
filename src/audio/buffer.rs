use ringbuf::{traits::*, HeapRb};

/// Fixed-capacity sample history kept ahead of a speech onset
///
/// Writes past capacity overwrite the oldest samples.
pub struct PreRollBuffer {
    ring: HeapRb<f32>,
}

impl PreRollBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.ring.push_slice_overwrite(samples);
    }

    /// Take everything buffered, oldest first
    pub fn drain(&mut self) -> Vec<f32> {
        self.ring.pop_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_drain() {
        let mut buffer = PreRollBuffer::new(1024);
        let data: Vec<f32> = (0..100).map(|i| i as f32).collect();
        buffer.push(&data);
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.drain(), data);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let mut buffer = PreRollBuffer::new(10);
        let data: Vec<f32> = (0..20).map(|i| i as f32).collect();
        buffer.push(&data);
        let kept = buffer.drain();
        assert_eq!(kept.len(), 10);
        assert_eq!(kept.first(), Some(&10.0));
        assert_eq!(kept.last(), Some(&19.0));
    }
}
