//! 请求模式异常评分
//! 按用户保留最近 10 次请求，路径过于分散或请求间隔过短时提高分数

use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use uuid::Uuid;

const HISTORY_LEN: usize = 10;
const DISTINCT_PATH_LIMIT: usize = 8;
const BURST_INTERVAL: Duration = Duration::from_millis(100);

/// 达到该分数（两项信号同时出现）记录 ANOMALY_DETECTED
pub const ANOMALY_ALERT_SCORE: f64 = 0.7;

#[derive(Debug, Clone)]
struct RequestSample {
    path: String,
    at: Instant,
}

pub struct AnomalyTracker {
    history: DashMap<Uuid, VecDeque<RequestSample>>,
    idle_ttl: Duration,
}

impl AnomalyTracker {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            history: DashMap::new(),
            idle_ttl,
        }
    }

    /// 记录一次请求并返回 0.0..=1.0 的分数
    pub fn observe(&self, user_id: Uuid, path: &str) -> f64 {
        self.observe_at(user_id, path, Instant::now())
    }

    pub fn observe_at(&self, user_id: Uuid, path: &str, at: Instant) -> f64 {
        let mut entry = self.history.entry(user_id).or_default();
        let samples = entry.value_mut();

        samples.push_back(RequestSample {
            path: path.to_string(),
            at,
        });
        while samples.len() > HISTORY_LEN {
            samples.pop_front();
        }

        score(samples)
    }

    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.history.len();
        self.history.retain(|_, samples| {
            samples
                .back()
                .is_some_and(|last| now.saturating_duration_since(last.at) < self.idle_ttl)
        });
        before.saturating_sub(self.history.len())
    }
}

fn score(samples: &VecDeque<RequestSample>) -> f64 {
    // 以十分之一为单位累加，避免浮点误差影响阈值比较
    let mut tenths: u32 = 0;

    let distinct: HashSet<&str> = samples.iter().map(|s| s.path.as_str()).collect();
    if distinct.len() > DISTINCT_PATH_LIMIT {
        tenths += 3;
    }

    if samples.len() >= 2 {
        let (first, last) = (&samples[0], &samples[samples.len() - 1]);
        let span = last.at.saturating_duration_since(first.at);
        let mean = span / (samples.len() as u32 - 1);
        if mean < BURST_INTERVAL {
            tenths += 4;
        }
    }

    f64::from(tenths.min(10)) / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calm_user_scores_zero() {
        let tracker = AnomalyTracker::new(Duration::from_secs(3600));
        let user = Uuid::new_v4();
        let start = Instant::now();

        let mut last = 0.0;
        for i in 0..5 {
            last = tracker.observe_at(user, "/api/v1/products", start + Duration::from_secs(i));
        }
        assert_eq!(last, 0.0);
    }

    #[test]
    fn test_burst_across_many_paths() {
        let tracker = AnomalyTracker::new(Duration::from_secs(3600));
        let user = Uuid::new_v4();
        let start = Instant::now();

        let mut last = 0.0;
        for i in 0..10u64 {
            last = tracker.observe_at(
                user,
                &format!("/api/v1/resource/{}", i),
                start + Duration::from_millis(i * 5),
            );
        }
        assert_eq!(last, 0.7);
        assert!(last >= ANOMALY_ALERT_SCORE);
    }

    #[test]
    fn test_single_sample_has_no_interval_signal() {
        let tracker = AnomalyTracker::new(Duration::from_secs(3600));
        assert_eq!(tracker.observe(Uuid::new_v4(), "/"), 0.0);
    }
}
