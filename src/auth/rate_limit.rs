//! 滑动窗口限流器
//! 每个键保存窗口内的请求时间戳，DashMap 按键分片加锁

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 限流判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    /// retry_after_secs 为最早请求离开窗口前的秒数（向上取整，至少 1）
    Limited { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// 基于滑动窗口的限流器
pub struct SlidingWindowLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    max_requests: u32,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// 每分钟限流
    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// 检查并记录一次请求
    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut entry = self.windows.entry(key.to_string()).or_default();
        let requests = entry.value_mut();

        // 窗口内不保留早于 now - window 的时间戳
        while let Some(&front) = requests.front() {
            if now.saturating_duration_since(front) < self.window {
                break;
            }
            requests.pop_front();
        }

        if (requests.len() as u32) < self.max_requests {
            requests.push_back(now);
            return RateDecision::Allowed {
                remaining: self.max_requests - requests.len() as u32,
            };
        }

        let retry_after_secs = requests
            .front()
            .map(|&oldest| {
                let until_exit = (oldest + self.window).saturating_duration_since(now);
                let secs = until_exit.as_secs() + u64::from(until_exit.subsec_nanos() > 0);
                secs.max(1)
            })
            .unwrap_or(1);

        RateDecision::Limited { retry_after_secs }
    }

    /// 清除空窗口或完全过期的键
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, requests| {
            requests
                .back()
                .is_some_and(|&last| now.saturating_duration_since(last) < self.window)
        });
        before.saturating_sub(self.windows.len())
    }

    /// 当前跟踪的键数量
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
