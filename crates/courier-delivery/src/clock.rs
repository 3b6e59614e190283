//! 时钟抽象，测试中可手动推进

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

#[async_trait]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// 等待到 `deadline`
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(remaining) = (deadline - Utc::now()).to_std() {
            tokio::time::sleep(remaining).await;
        }
    }
}

/// 手动时钟，只有调用 `advance`/`set` 时才前进
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    changed: Notify,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            changed: Notify::new(),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.update(|now| *now + by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.update(|_| to);
    }

    fn update(&self, f: impl FnOnce(&DateTime<Utc>) -> DateTime<Utc>) {
        {
            let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
            *now = f(&*now);
        }
        self.changed.notify_waiters();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        loop {
            // 先注册再检查，避免错过 advance 的通知
            let changed = self.changed.notified();
            if self.now() >= deadline {
                return;
            }
            changed.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_manual_clock_wakes_sleeper() {
        let clock = Arc::new(ManualClock::default());
        let deadline = clock.now() + chrono::Duration::seconds(30);

        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep_until(deadline).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sleeper.is_finished());

        clock.advance(chrono::Duration::seconds(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sleeper.is_finished());

        clock.advance(chrono::Duration::seconds(20));
        tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_system_clock_past_deadline_returns() {
        let clock = SystemClock;
        let past = clock.now() - chrono::Duration::seconds(5);
        tokio::time::timeout(Duration::from_millis(100), clock.sleep_until(past))
            .await
            .unwrap();
    }
}
