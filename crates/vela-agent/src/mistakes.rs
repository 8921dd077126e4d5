//! Consecutive-mistake accounting

/// Default number of consecutive mistakes before the user is consulted
pub const DEFAULT_MISTAKE_LIMIT: u32 = 3;

/// Counts consecutive turns that made no progress.
///
/// Turns without a tool call and rejected tool parameters count as mistakes;
/// a successful tool execution resets the count.
#[derive(Debug, Clone)]
pub struct MistakeTracker {
    count: u32,
    limit: u32,
}

impl MistakeTracker {
    pub fn new(limit: u32) -> Self {
        Self {
            count: 0,
            limit: limit.max(1),
        }
    }

    /// Record a mistake and return the new count
    pub fn record(&mut self) -> u32 {
        self.count += 1;
        tracing::debug!("Consecutive mistakes: {}/{}", self.count, self.limit);
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Whether the next turn must escalate to the user first
    pub fn limit_reached(&self) -> bool {
        self.count >= self.limit
    }
}

impl Default for MistakeTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MISTAKE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_and_reset() {
        let mut m = MistakeTracker::default();
        m.record();
        m.record();
        assert!(!m.limit_reached());
        assert_eq!(m.record(), 3);
        assert!(m.limit_reached());
        m.reset();
        assert_eq!(m.count(), 0);
        assert!(!m.limit_reached());
    }

    #[test]
    fn test_zero_limit_clamped() {
        let m = MistakeTracker::new(0);
        assert_eq!(m.limit(), 1);
    }
}
