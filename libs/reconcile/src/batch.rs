//! Slow-start batch sizing for instance creation.

/// Iterator over batch sizes that start small and double after each batch.
///
/// The executor runs one batch at a time and stops at the first batch with a
/// failure, so a systematic error (quota, invalid template) costs one call
/// instead of `count` calls.
#[derive(Debug, Clone)]
pub struct SlowStart {
    remaining: usize,
    next: usize,
}

impl SlowStart {
    /// Sizes for creating `count` items, starting with `initial` per batch.
    pub fn new(count: usize, initial: usize) -> Self {
        Self {
            remaining: count,
            next: initial.max(1),
        }
    }
}

impl Iterator for SlowStart {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let size = self.next.min(self.remaining);
        self.remaining -= size;
        self.next = self.next.saturating_mul(2);
        Some(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_start_doubles() {
        let sizes: Vec<_> = SlowStart::new(10, 1).collect();
        assert_eq!(sizes, vec![1, 2, 4, 3]);
    }

    #[test]
    fn test_slow_start_empty_and_exact() {
        assert_eq!(SlowStart::new(0, 1).count(), 0);
        assert_eq!(SlowStart::new(7, 1).collect::<Vec<_>>(), vec![1, 2, 4]);
        assert_eq!(SlowStart::new(3, 0).collect::<Vec<_>>(), vec![1, 2]);
    }
}
