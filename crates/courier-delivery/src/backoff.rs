//! 指数退避

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::QueueConfig;

/// 指数上限的硬限制，防止乘法溢出
const MAX_EXPONENT: u32 = 20;

/// 退避策略：第 n 次失败后等待 `base × 2^min(n-1, cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: u32) -> Self {
        Self {
            base,
            cap: cap.min(MAX_EXPONENT),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.base_backoff(), config.backoff_cap)
    }

    /// 第 `attempt` 次失败之后的等待时长
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(self.cap);
        self.base.saturating_mul(1u32 << exponent)
    }

    /// 计算下一次尝试时间，不早于之前安排的时间
    pub fn next_attempt_at(
        &self,
        attempt: u32,
        now: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let candidate = now.checked_add_signed(delay).unwrap_or(now);
        candidate.max(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 3);
        let delays: Vec<u64> = (1..=6).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
    }

    #[test]
    fn test_huge_cap_does_not_overflow() {
        let policy = BackoffPolicy::new(Duration::from_secs(3600), u32::MAX);
        assert!(policy.delay(u32::MAX) >= Duration::from_secs(3600));
    }

    #[test]
    fn test_next_attempt_never_moves_backwards() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), 6);
        let now = Utc::now();
        let previous = now + chrono::Duration::hours(1);
        assert_eq!(policy.next_attempt_at(1, now, previous), previous);
        assert_eq!(
            policy.next_attempt_at(2, now, now),
            now + chrono::Duration::seconds(20)
        );
    }
}
