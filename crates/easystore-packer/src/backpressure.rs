//! Adaptive claim batch sizing
//!
//! The provider batch size is the pipeline's flow-control primitive: there
//! are no unbounded in-memory queues, so the only way the packer can get
//! ahead of a struggling source is by asking for too much at once.
//!
//! [`BatchSizer`] applies AIMD: sustained success grows the batch
//! additively, any fetch/claim failure halves it. The size is always within
//! `[1, max]`.

/// AIMD controller for the per-shard claim batch size.
#[derive(Debug, Clone)]
pub struct BatchSizer {
    current: u32,
    max: u32,
    step: u32,
}

impl BatchSizer {
    pub fn new(max: u32) -> Self {
        let max = max.max(1);
        Self {
            current: max.min(16),
            max,
            step: (max / 10).max(1),
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Additive increase after a fully successful batch.
    pub fn on_success(&mut self) {
        self.current = (self.current + self.step).min(self.max);
    }

    /// Multiplicative decrease after a claim or fetch failure.
    pub fn on_failure(&mut self) {
        self.current = (self.current / 2).max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_is_bounded_by_max() {
        let mut sizer = BatchSizer::new(100);
        for _ in 0..50 {
            sizer.on_success();
        }
        assert_eq!(sizer.current(), 100);
    }

    #[test]
    fn test_failure_halves_down_to_one() {
        let mut sizer = BatchSizer::new(100);
        for _ in 0..50 {
            sizer.on_success();
        }
        sizer.on_failure();
        assert_eq!(sizer.current(), 50);
        for _ in 0..10 {
            sizer.on_failure();
        }
        assert_eq!(sizer.current(), 1);
    }

    #[test]
    fn test_recovery_after_failures() {
        let mut sizer = BatchSizer::new(40);
        for _ in 0..10 {
            sizer.on_failure();
        }
        assert_eq!(sizer.current(), 1);
        for _ in 0..100 {
            sizer.on_success();
        }
        assert_eq!(sizer.current(), 40);
    }

    #[test]
    fn test_degenerate_max() {
        let mut sizer = BatchSizer::new(0);
        assert_eq!(sizer.current(), 1);
        sizer.on_success();
        assert_eq!(sizer.current(), 1);
    }
}
