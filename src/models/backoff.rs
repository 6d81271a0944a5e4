/// Upper bound for [`BackoffState::block_count`]
pub const MAX_BLOCK_COUNT: u32 = 10;

/// Per (target, endpoint) cooldown bookkeeping.
///
/// All instants are epoch milliseconds. The zero value means "never used,
/// never blocked" and is what a missing entry stands for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    /// Consecutive failures, saturating at [`MAX_BLOCK_COUNT`]
    pub block_count: u32,
    /// The endpoint is usable for the target once this instant has passed
    pub unblock_at: i64,
    /// Last time the endpoint was selected for the target
    pub used_at: i64,
}

impl BackoffState {
    /// Cooldown applied after `block_count` consecutive failures: `(n + 2)^3` seconds
    pub fn cooldown_ms(block_count: u32) -> i64 {
        let n = i64::from(block_count) + 2;
        n * n * n * 1000
    }

    pub fn is_unblocked(&self, now: i64) -> bool {
        self.unblock_at < now
    }

    pub fn mark_used(&mut self, now: i64) {
        self.used_at = now;
    }

    /// Record a failed attempt
    pub fn block(&mut self, now: i64) {
        if self.block_count < MAX_BLOCK_COUNT {
            self.block_count += 1;
        }
        self.unblock_at = now + Self::cooldown_ms(self.block_count);
    }

    /// Record a good response
    pub fn reset(&mut self) {
        self.block_count = 0;
        self.unblock_at = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_state_is_unblocked() {
        let state = BackoffState::default();
        assert!(state.is_unblocked(1));
        assert_eq!(state.block_count, 0);
    }

    #[test]
    fn test_cooldown_curve() {
        assert_eq!(BackoffState::cooldown_ms(1), 27_000);
        assert_eq!(BackoffState::cooldown_ms(MAX_BLOCK_COUNT), 1_728_000);
    }

    #[test]
    fn test_block_saturates_and_reset_clears() {
        let now = 1_000_000;
        let mut state = BackoffState::default();

        state.block(now);
        assert_eq!(state.block_count, 1);
        assert_eq!(state.unblock_at, now + 27_000);
        assert!(!state.is_unblocked(now));

        for _ in 0..20 {
            state.block(now);
        }
        assert_eq!(state.block_count, MAX_BLOCK_COUNT);
        assert_eq!(state.unblock_at, now + 1_728_000);

        state.reset();
        assert_eq!(state.block_count, 0);
        assert!(state.is_unblocked(now));
    }
}
