// Copyright 2025 the slatemq authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Replication quota enforcement.
//!
//! Traffic is sampled over a fixed number of rolling time windows. When the
//! observed rate exceeds the configured bytes/sec, the caller is handed a
//! delay to sleep instead of an error: enforcement shapes latency, it never
//! rejects work.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::log::now_ms;
use crate::QuotaConfig;

/// Which replication path a bucket covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaDirection {
    /// Leader side: serving follower fetches.
    ServeFetch,
    /// Follower side: issuing fetches to leaders.
    IssueFetch,
}

#[derive(Debug)]
struct Sample {
    window_start_ms: i64,
    bytes: u64,
}

/// Byte counts bucketed into rolling windows.
#[derive(Debug)]
struct SampledRate {
    samples: VecDeque<Sample>,
    window_size_ms: u64,
    window_num: usize,
}

impl SampledRate {
    fn new(window_size_ms: u64, window_num: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window_num),
            window_size_ms,
            window_num,
        }
    }

    fn record(&mut self, bytes: u64, now: i64) {
        let window_start = now - now.rem_euclid(self.window_size_ms as i64);
        match self.samples.back_mut() {
            Some(sample) if sample.window_start_ms == window_start => sample.bytes += bytes,
            _ => {
                self.samples.push_back(Sample {
                    window_start_ms: window_start,
                    bytes,
                });
                while self.samples.len() > self.window_num {
                    self.samples.pop_front();
                }
            }
        }
    }

    /// (total bytes, elapsed ms) over the retained windows.
    fn totals(&self, now: i64) -> (u64, u64) {
        let total: u64 = self.samples.iter().map(|s| s.bytes).sum();
        let elapsed = match self.samples.front() {
            Some(oldest) => (now - oldest.window_start_ms).max(1) as u64,
            None => 1,
        };
        (total, elapsed)
    }
}

/// A single rate limiter: record traffic, get back the delay that brings
/// the observed rate down to the configured limit.
#[derive(Debug)]
pub struct QuotaLimiter {
    bytes_per_second: u64,
    samples: Mutex<SampledRate>,
}

impl QuotaLimiter {
    pub fn new(bytes_per_second: u64, window_size_ms: u64, window_num: usize) -> Self {
        Self {
            bytes_per_second,
            samples: Mutex::new(SampledRate::new(window_size_ms, window_num)),
        }
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.bytes_per_second
    }

    /// Records `bytes` of traffic and returns how long the caller must wait
    /// before continuing. Zero when under quota.
    pub fn record_and_delay(&self, bytes: u64) -> Duration {
        if self.bytes_per_second == u64::MAX {
            return Duration::ZERO;
        }
        let now = now_ms();
        let mut samples = self.samples.lock();
        samples.record(bytes, now);
        let (total, elapsed_ms) = samples.totals(now);
        let max_delay_ms = samples.window_size_ms * samples.window_num as u64;
        drop(samples);

        let allowed = self.bytes_per_second.saturating_mul(elapsed_ms) / 1000;
        if total <= allowed {
            return Duration::ZERO;
        }
        let overage = total - allowed;
        let delay_ms = (overage.saturating_mul(1000) / self.bytes_per_second.max(1))
            .min(max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Records traffic and sleeps off any resulting delay.
    pub async fn throttle(&self, bytes: u64) {
        let delay = self.record_and_delay(bytes);
        if !delay.is_zero() {
            trace!("quota throttling for {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }
}

/// Per-direction quota buckets with optional per-client overrides.
#[derive(Debug)]
pub struct QuotaManager {
    config: QuotaConfig,
    serve_default: Arc<QuotaLimiter>,
    issue_default: Arc<QuotaLimiter>,
    overrides: DashMap<(QuotaDirection, String), Arc<QuotaLimiter>>,
}

impl QuotaManager {
    pub fn new(config: QuotaConfig) -> Self {
        let serve_default = Arc::new(QuotaLimiter::new(
            config.leader_replication_rate,
            config.window_size_ms,
            config.window_num,
        ));
        let issue_default = Arc::new(QuotaLimiter::new(
            config.follower_replication_rate,
            config.window_size_ms,
            config.window_num,
        ));
        Self {
            config,
            serve_default,
            issue_default,
            overrides: DashMap::new(),
        }
    }

    /// Sets a client-specific rate, distinguished by client identity.
    pub fn set_client_rate(
        &self,
        direction: QuotaDirection,
        client_id: impl Into<String>,
        bytes_per_second: u64,
    ) {
        let limiter = Arc::new(QuotaLimiter::new(
            bytes_per_second,
            self.config.window_size_ms,
            self.config.window_num,
        ));
        self.overrides.insert((direction, client_id.into()), limiter);
    }

    pub fn limiter(
        &self,
        direction: QuotaDirection,
        client_id: Option<&str>,
    ) -> Arc<QuotaLimiter> {
        if let Some(client_id) = client_id {
            if let Some(limiter) = self
                .overrides
                .get(&(direction, client_id.to_string()))
            {
                return limiter.clone();
            }
        }
        match direction {
            QuotaDirection::ServeFetch => self.serve_default.clone(),
            QuotaDirection::IssueFetch => self.issue_default.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_quota_never_delays() {
        let limiter = QuotaLimiter::new(u64::MAX, 100, 10);
        assert_eq!(limiter.record_and_delay(u64::MAX / 2), Duration::ZERO);
    }

    #[test]
    fn test_burst_over_quota_is_delayed_not_rejected() {
        let limiter = QuotaLimiter::new(1000, 1000, 11);
        // a 10x burst in a single window
        let delay = limiter.record_and_delay(10_000);
        assert!(delay > Duration::ZERO);
        // shaping, not admission control: the bytes were still recorded
        assert!(delay <= Duration::from_millis(11_000));
    }

    #[test]
    fn test_delay_proportional_to_overage() {
        let limiter = QuotaLimiter::new(1000, 1000, 11);
        let small = limiter.record_and_delay(2_000);
        let large = limiter.record_and_delay(8_000);
        assert!(large > small);
    }

    #[test]
    fn test_client_override_takes_precedence() {
        let manager = QuotaManager::new(QuotaConfig {
            leader_replication_rate: 1_000,
            follower_replication_rate: 1_000,
            window_num: 11,
            window_size_ms: 1_000,
        });
        manager.set_client_rate(QuotaDirection::ServeFetch, "follower-7", 50);

        let default = manager.limiter(QuotaDirection::ServeFetch, Some("follower-1"));
        let custom = manager.limiter(QuotaDirection::ServeFetch, Some("follower-7"));
        assert_eq!(default.bytes_per_second(), 1_000);
        assert_eq!(custom.bytes_per_second(), 50);
    }

    #[test]
    fn test_sampled_rate_drops_old_windows() {
        let mut rate = SampledRate::new(100, 2);
        rate.record(10, 0);
        rate.record(10, 100);
        rate.record(10, 200);
        let (total, _) = rate.totals(200);
        assert_eq!(total, 20);
    }
}
