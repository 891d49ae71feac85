//! Lightweight peak tracking for the arena.
//!
//! Keep this cheap; it sits on every allocation. The arena is exclusively
//! owned, so a plain counter is enough.

#[derive(Default)]
pub struct PeakTracker {
    peak_bytes: usize,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self { peak_bytes: 0 }
    }

    /// Record a new "used bytes" value; updates the peak if higher.
    pub fn record(&mut self, used_bytes: usize) {
        if used_bytes > self.peak_bytes {
            self.peak_bytes = used_bytes;
            #[cfg(feature = "tracing")]
            tracing::trace!(used_bytes, "arena peak");
        }
    }

    pub fn peak(&self) -> usize {
        self.peak_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_only_rises() {
        let mut t = PeakTracker::new();
        t.record(10);
        t.record(5);
        assert_eq!(t.peak(), 10);
        t.record(25);
        assert_eq!(t.peak(), 25);
    }
}
