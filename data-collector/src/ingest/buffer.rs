//! Bounded per-table batch buffer.

use std::time::{Duration, Instant};

/// Buffer with two flush triggers: a size threshold and an age threshold
/// measured from the first row after the last flush. A hard cap bounds
/// growth during store outages; the caller stops accepting rows at the cap
/// so backpressure reaches the stream clients.
#[derive(Debug)]
pub struct TableBuffer<T> {
    rows: Vec<T>,
    max_size: usize,
    max_age: Duration,
    hard_cap: usize,
    first_row_at: Option<Instant>,
}

impl<T> TableBuffer<T> {
    pub fn new(max_size: usize, max_age: Duration, hard_cap: usize) -> Self {
        Self {
            rows: Vec::with_capacity(max_size),
            max_size,
            max_age,
            hard_cap: hard_cap.max(max_size),
            first_row_at: None,
        }
    }

    /// Add a row. Returns false when the hard cap is reached and the row
    /// was not stored; the caller must stop pulling from its queue.
    pub fn push(&mut self, row: T) -> bool {
        if self.rows.len() >= self.hard_cap {
            return false;
        }
        if self.rows.is_empty() {
            self.first_row_at = Some(Instant::now());
        }
        self.rows.push(row);
        true
    }

    /// True when either flush trigger has fired.
    pub fn should_flush(&self) -> bool {
        if self.rows.is_empty() {
            return false;
        }
        if self.rows.len() >= self.max_size {
            return true;
        }
        self.first_row_at
            .map(|t| t.elapsed() >= self.max_age)
            .unwrap_or(false)
    }

    /// True when the buffer is at its hard cap.
    pub fn at_hard_cap(&self) -> bool {
        self.rows.len() >= self.hard_cap
    }

    /// Take all buffered rows, resetting the age clock.
    pub fn drain(&mut self) -> Vec<T> {
        self.first_row_at = None;
        std::mem::take(&mut self.rows)
    }

    /// Put rows back after a failed flush, preserving order.
    pub fn restore(&mut self, mut rows: Vec<T>) {
        if rows.is_empty() {
            return;
        }
        if self.first_row_at.is_none() {
            self.first_row_at = Some(Instant::now());
        }
        rows.extend(self.rows.drain(..));
        self.rows = rows;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_on_size() {
        let mut buffer = TableBuffer::new(3, Duration::from_secs(60), 100);
        assert!(!buffer.should_flush());
        buffer.push(1);
        buffer.push(2);
        assert!(!buffer.should_flush());
        buffer.push(3);
        assert!(buffer.should_flush());
        assert_eq!(buffer.drain(), vec![1, 2, 3]);
        assert!(!buffer.should_flush());
    }

    #[test]
    fn test_flush_on_age() {
        let mut buffer = TableBuffer::new(1000, Duration::from_millis(0), 10_000);
        buffer.push(1);
        // Zero max age means any non-empty buffer is due.
        assert!(buffer.should_flush());
    }

    #[test]
    fn test_empty_buffer_never_flushes() {
        let buffer: TableBuffer<u32> = TableBuffer::new(1, Duration::from_millis(0), 10);
        assert!(!buffer.should_flush());
    }

    #[test]
    fn test_hard_cap_rejects_rows() {
        let mut buffer = TableBuffer::new(2, Duration::from_secs(60), 4);
        assert!(buffer.push(1));
        assert!(buffer.push(2));
        assert!(buffer.push(3));
        assert!(buffer.push(4));
        assert!(buffer.at_hard_cap());
        assert!(!buffer.push(5));
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn test_restore_preserves_order() {
        let mut buffer = TableBuffer::new(10, Duration::from_secs(60), 100);
        buffer.push(3);
        buffer.push(4);
        buffer.restore(vec![1, 2]);
        assert_eq!(buffer.drain(), vec![1, 2, 3, 4]);
    }
}
