//! IP 信誉跟踪
//! 连续安全失败计数达到阈值后 IP 进入可疑集合，只能由管理员清除

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct FailureCounter {
    count: u32,
    last_failure: Instant,
}

/// 记录一次失败后的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub count: u32,
    /// 本次失败使该 IP 首次越过阈值
    pub newly_flagged: bool,
}

pub struct IpReputation {
    failures: DashMap<IpAddr, FailureCounter>,
    flagged: DashMap<IpAddr, DateTime<Utc>>,
    threshold: u32,
    failure_ttl: Duration,
}

impl IpReputation {
    pub fn new(threshold: u32, failure_ttl: Duration) -> Self {
        Self {
            failures: DashMap::new(),
            flagged: DashMap::new(),
            threshold,
            failure_ttl,
        }
    }

    pub fn record_failure(&self, ip: IpAddr) -> FailureRecord {
        let now = Instant::now();
        let count = {
            let mut counter = self.failures.entry(ip).or_insert(FailureCounter {
                count: 0,
                last_failure: now,
            });
            // 空闲过久的计数重新开始
            if now.saturating_duration_since(counter.last_failure) >= self.failure_ttl {
                counter.count = 0;
            }
            counter.count = counter.count.saturating_add(1);
            counter.last_failure = now;
            counter.count
        };

        let mut newly_flagged = false;
        if count >= self.threshold {
            self.flagged.entry(ip).or_insert_with(|| {
                newly_flagged = true;
                Utc::now()
            });
        }

        FailureRecord {
            count,
            newly_flagged,
        }
    }

    /// 成功认证后重置连续失败计数（不影响已标记状态）
    pub fn record_success(&self, ip: IpAddr) {
        self.failures.remove(&ip);
    }

    pub fn failure_count(&self, ip: IpAddr) -> u32 {
        self.failures.get(&ip).map(|c| c.count).unwrap_or(0)
    }

    pub fn is_flagged(&self, ip: IpAddr) -> bool {
        self.flagged.contains_key(&ip)
    }

    /// 管理员清除标记与失败计数，返回之前是否被标记
    pub fn clear(&self, ip: IpAddr) -> bool {
        self.failures.remove(&ip);
        self.flagged.remove(&ip).is_some()
    }

    pub fn flagged_ips(&self) -> Vec<(IpAddr, DateTime<Utc>)> {
        let mut ips: Vec<_> = self
            .flagged
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        ips.sort_by_key(|(_, at)| *at);
        ips
    }

    /// 清理过期的失败计数；可疑集合不过期
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.failures.len();
        self.failures
            .retain(|_, counter| now.saturating_duration_since(counter.last_failure) < self.failure_ttl);
        before.saturating_sub(self.failures.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([203, 0, 113, last])
    }

    #[test]
    fn test_flag_after_threshold() {
        let reputation = IpReputation::new(3, Duration::from_secs(3600));

        assert!(!reputation.record_failure(ip(1)).newly_flagged);
        assert!(!reputation.record_failure(ip(1)).newly_flagged);
        let third = reputation.record_failure(ip(1));
        assert_eq!(third.count, 3);
        assert!(third.newly_flagged);
        assert!(reputation.is_flagged(ip(1)));

        // 已标记的 IP 不会再次触发
        assert!(!reputation.record_failure(ip(1)).newly_flagged);
        assert!(!reputation.is_flagged(ip(2)));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let reputation = IpReputation::new(3, Duration::from_secs(3600));
        reputation.record_failure(ip(5));
        reputation.record_failure(ip(5));
        reputation.record_success(ip(5));
        assert_eq!(reputation.failure_count(ip(5)), 0);
        assert!(!reputation.record_failure(ip(5)).newly_flagged);
    }

    #[test]
    fn test_clear_removes_flag() {
        let reputation = IpReputation::new(1, Duration::from_secs(3600));
        reputation.record_failure(ip(9));
        assert_eq!(reputation.flagged_ips().len(), 1);

        assert!(reputation.clear(ip(9)));
        assert!(!reputation.is_flagged(ip(9)));
        assert!(!reputation.clear(ip(9)));
    }

    #[test]
    fn test_sweep_keeps_flags() {
        let reputation = IpReputation::new(1, Duration::from_millis(1));
        reputation.record_failure(ip(7));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(reputation.sweep(), 1);
        assert!(reputation.is_flagged(ip(7)));
    }
}
