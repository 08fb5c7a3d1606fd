//! Sliding-window rate limiting.
//!
//! Per-process by default; the [`RateStore`] trait is the swap-point when a
//! deployment needs cross-worker fairness from a shared keyspace.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::cost::UserTier;

/// Sentinel meaning "no limit".
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    Hourly,
    Daily,
}

impl Window {
    pub fn duration(&self) -> Duration {
        match self {
            Window::Hourly => Duration::hours(1),
            Window::Daily => Duration::hours(24),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Hourly => "hourly",
            Window::Daily => "daily",
        }
    }
}

/// Result of one check-and-record call.
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed {
        limit: i64,
        remaining: i64,
        reset_at: DateTime<Utc>,
    },
    Denied {
        limit: i64,
        reset_at: DateTime<Utc>,
        retry_after: Duration,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    pub fn remaining(&self) -> i64 {
        match self {
            RateDecision::Allowed { remaining, .. } => *remaining,
            RateDecision::Denied { .. } => 0,
        }
    }
}

/// Storage for window entries. The in-memory implementation below is the
/// default; a shared store satisfies the same contract.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Prune entries older than the window, then either record `now` and
    /// allow, or deny with the time until the oldest entry expires.
    async fn check_and_record(
        &self,
        key: &str,
        window: Window,
        limit: i64,
        now: DateTime<Utc>,
    ) -> RateDecision;

    /// Undo the most recent record for `key`. Used when a later check in
    /// the same request denies and the speculative earlier record must not
    /// consume quota.
    async fn rollback(&self, key: &str);

    /// Evict keys with no live entries. Returns how many were dropped.
    async fn prune(&self, now: DateTime<Utc>) -> usize;
}

#[async_trait]
impl<T: RateStore + ?Sized> RateStore for std::sync::Arc<T> {
    async fn check_and_record(
        &self,
        key: &str,
        window: Window,
        limit: i64,
        now: DateTime<Utc>,
    ) -> RateDecision {
        (**self).check_and_record(key, window, limit, now).await
    }

    async fn rollback(&self, key: &str) {
        (**self).rollback(key).await
    }

    async fn prune(&self, now: DateTime<Utc>) -> usize {
        (**self).prune(now).await
    }
}

/// Per-process sliding-window store.
#[derive(Default)]
pub struct MemoryRateStore {
    entries: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn check_and_record(
        &self,
        key: &str,
        window: Window,
        limit: i64,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let window_start = now - window.duration();
        let reset_full = now + window.duration();

        if limit == UNLIMITED {
            return RateDecision::Allowed {
                limit: UNLIMITED,
                remaining: UNLIMITED,
                reset_at: reset_full,
            };
        }

        let mut entries = self.entries.lock().expect("rate store poisoned");
        let bucket = entries.entry(key.to_string()).or_default();
        bucket.retain(|ts| *ts > window_start);

        if bucket.len() as i64 >= limit {
            let oldest = bucket.iter().min().copied().unwrap_or(now);
            let reset_at = oldest + window.duration();
            let retry_after = (reset_at - now).max(Duration::seconds(1));
            return RateDecision::Denied {
                limit,
                reset_at,
                retry_after,
            };
        }

        bucket.push(now);
        RateDecision::Allowed {
            limit,
            remaining: limit - bucket.len() as i64,
            reset_at: reset_full,
        }
    }

    async fn rollback(&self, key: &str) {
        let mut entries = self.entries.lock().expect("rate store poisoned");
        if let Some(bucket) = entries.get_mut(key) {
            bucket.pop();
            if bucket.is_empty() {
                entries.remove(key);
            }
        }
    }

    async fn prune(&self, now: DateTime<Utc>) -> usize {
        let daily_start = now - Window::Daily.duration();
        let mut entries = self.entries.lock().expect("rate store poisoned");
        let before = entries.len();
        entries.retain(|_, bucket| {
            bucket.retain(|ts| *ts > daily_start);
            !bucket.is_empty()
        });
        before - entries.len()
    }
}

/// (hourly, daily) limits for one key class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimits {
    pub hourly: i64,
    pub daily: i64,
}

/// Per-tier submission limits.
pub fn user_limits(tier: UserTier) -> WindowLimits {
    match tier {
        UserTier::Free => WindowLimits { hourly: 5, daily: 10 },
        UserTier::Starter => WindowLimits { hourly: 10, daily: 30 },
        UserTier::Pro => WindowLimits { hourly: 30, daily: 100 },
        UserTier::Premium => WindowLimits { hourly: 30, daily: 150 },
        UserTier::Enterprise => WindowLimits {
            hourly: UNLIMITED,
            daily: UNLIMITED,
        },
    }
}

/// Per-platform limits; platforms throttle aggressive automation so these
/// are deliberately tighter than the tier caps.
pub fn platform_limits(platform: &str) -> WindowLimits {
    match platform {
        "linkedin" => WindowLimits { hourly: 8, daily: 40 },
        "indeed" => WindowLimits { hourly: 15, daily: 80 },
        "workday" => WindowLimits { hourly: 10, daily: 60 },
        _ => WindowLimits { hourly: 20, daily: 120 },
    }
}

/// HTTP surface of the most restrictive decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            pairs.push(("Retry-After", retry_after.num_seconds().max(1).to_string()));
        }
        pairs
    }
}

/// A denied submission, carrying the headers for the 429 response.
#[derive(Debug, thiserror::Error)]
#[error("rate limit exceeded for {scope}, retry after {}s", .headers.retry_after.map(|d| d.num_seconds()).unwrap_or(0))]
pub struct RateLimitExceeded {
    pub scope: String,
    pub headers: RateLimitHeaders,
}

/// Orchestrates the user-tier check followed by the per-platform check,
/// rolling back speculative records when a later window denies.
pub struct RateGate<S: RateStore> {
    store: S,
}

impl<S: RateStore> RateGate<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Check all four windows for one submission. On success the request is
    /// recorded in every window; on denial nothing is consumed.
    pub async fn check(
        &self,
        user_id: &str,
        tier: UserTier,
        platform: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitHeaders, RateLimitExceeded> {
        // Enterprise short-circuits: no windows recorded at all.
        if tier == UserTier::Enterprise {
            return Ok(RateLimitHeaders {
                limit: UNLIMITED,
                remaining: UNLIMITED,
                reset_at: now + Window::Daily.duration(),
                retry_after: None,
            });
        }

        let user = user_limits(tier);
        let platform_caps = platform_limits(platform);
        let checks: [(String, Window, i64, &str); 4] = [
            (
                format!("user:{user_id}:{}", Window::Hourly.as_str()),
                Window::Hourly,
                user.hourly,
                "user",
            ),
            (
                format!("user:{user_id}:{}", Window::Daily.as_str()),
                Window::Daily,
                user.daily,
                "user",
            ),
            (
                format!("platform:{user_id}:{platform}:{}", Window::Hourly.as_str()),
                Window::Hourly,
                platform_caps.hourly,
                "platform",
            ),
            (
                format!("platform:{user_id}:{platform}:{}", Window::Daily.as_str()),
                Window::Daily,
                platform_caps.daily,
                "platform",
            ),
        ];

        let mut recorded: Vec<&str> = Vec::new();
        let mut most_restrictive: Option<RateLimitHeaders> = None;

        for (key, window, limit, scope) in &checks {
            match self.store.check_and_record(key, *window, *limit, now).await {
                RateDecision::Allowed {
                    limit, remaining, reset_at,
                } => {
                    if limit != UNLIMITED {
                        recorded.push(key);
                        let tighter = most_restrictive
                            .as_ref()
                            .map(|h| remaining < h.remaining)
                            .unwrap_or(true);
                        if tighter {
                            most_restrictive = Some(RateLimitHeaders {
                                limit,
                                remaining,
                                reset_at,
                                retry_after: None,
                            });
                        }
                    }
                }
                RateDecision::Denied {
                    limit, reset_at, retry_after,
                } => {
                    // Give back everything recorded so far in this request.
                    for key in recorded.drain(..).rev() {
                        self.store.rollback(key).await;
                    }
                    return Err(RateLimitExceeded {
                        scope: format!("{scope}:{}", window.as_str()),
                        headers: RateLimitHeaders {
                            limit,
                            remaining: 0,
                            reset_at,
                            retry_after: Some(retry_after),
                        },
                    });
                }
            }
        }

        Ok(most_restrictive.unwrap_or(RateLimitHeaders {
            limit: UNLIMITED,
            remaining: UNLIMITED,
            reset_at: now + Window::Daily.duration(),
            retry_after: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn allows_up_to_the_limit_then_denies() {
        let store = MemoryRateStore::new();
        let t = now();
        for i in 0..3 {
            let decision = store.check_and_record("k", Window::Hourly, 3, t).await;
            assert!(decision.is_allowed(), "request {i} should pass");
        }
        let denied = store.check_and_record("k", Window::Hourly, 3, t).await;
        match denied {
            RateDecision::Denied { retry_after, .. } => {
                assert!(retry_after > Duration::zero());
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn window_expiry_frees_capacity() {
        let store = MemoryRateStore::new();
        let t0 = now();
        for _ in 0..2 {
            assert!(store.check_and_record("k", Window::Hourly, 2, t0).await.is_allowed());
        }
        assert!(!store.check_and_record("k", Window::Hourly, 2, t0).await.is_allowed());

        // 61 minutes later the old entries have slid out.
        let t1 = t0 + Duration::minutes(61);
        assert!(store.check_and_record("k", Window::Hourly, 2, t1).await.is_allowed());
    }

    #[tokio::test]
    async fn rollback_pops_the_latest_entry() {
        let store = MemoryRateStore::new();
        let t = now();
        assert!(store.check_and_record("k", Window::Hourly, 1, t).await.is_allowed());
        assert!(!store.check_and_record("k", Window::Hourly, 1, t).await.is_allowed());

        store.rollback("k").await;
        assert!(store.check_and_record("k", Window::Hourly, 1, t).await.is_allowed());
    }

    #[tokio::test]
    async fn unlimited_sentinel_never_records() {
        let store = MemoryRateStore::new();
        let t = now();
        for _ in 0..100 {
            let decision = store.check_and_record("k", Window::Hourly, UNLIMITED, t).await;
            match decision {
                RateDecision::Allowed { limit, remaining, .. } => {
                    assert_eq!(limit, UNLIMITED);
                    assert_eq!(remaining, UNLIMITED);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(store.prune(t).await, 0);
    }

    #[tokio::test]
    async fn prune_evicts_dead_keys() {
        let store = MemoryRateStore::new();
        let t0 = now();
        store.check_and_record("a", Window::Hourly, 5, t0).await;
        store.check_and_record("b", Window::Hourly, 5, t0).await;

        let evicted = store.prune(t0 + Duration::hours(25)).await;
        assert_eq!(evicted, 2);
    }

    #[tokio::test]
    async fn platform_denial_rolls_back_user_quota() {
        let gate = RateGate::new(MemoryRateStore::new());
        let t = now();

        // Exhaust the linkedin hourly cap (8) for this user.
        for _ in 0..8 {
            gate.check("u1", UserTier::Pro, "linkedin", t).await.unwrap();
        }
        let err = gate.check("u1", UserTier::Pro, "linkedin", t).await.unwrap_err();
        assert!(err.scope.starts_with("platform"));

        // The denied request must not have consumed user-tier quota: the
        // pro hourly cap is 30, and exactly 8 requests went through.
        let decision = gate
            .store()
            .check_and_record("user:u1:hourly", Window::Hourly, 30, t)
            .await;
        assert_eq!(decision.remaining(), 30 - 8 - 1);
    }

    #[tokio::test]
    async fn enterprise_short_circuits() {
        let gate = RateGate::new(MemoryRateStore::new());
        let t = now();
        for _ in 0..500 {
            let headers = gate
                .check("boss", UserTier::Enterprise, "linkedin", t)
                .await
                .unwrap();
            assert_eq!(headers.limit, UNLIMITED);
        }
    }

    #[tokio::test]
    async fn headers_reflect_most_restrictive_window() {
        let gate = RateGate::new(MemoryRateStore::new());
        let t = now();
        let headers = gate.check("u2", UserTier::Free, "linkedin", t).await.unwrap();
        // Free hourly cap is 5: after one request, 4 remain, which is the
        // tightest of the four windows.
        assert_eq!(headers.limit, 5);
        assert_eq!(headers.remaining, 4);
    }

    #[test]
    fn denial_headers_include_retry_after() {
        let headers = RateLimitHeaders {
            limit: 5,
            remaining: 0,
            reset_at: now() + Duration::minutes(10),
            retry_after: Some(Duration::minutes(10)),
        };
        let pairs = headers.pairs();
        assert!(pairs.iter().any(|(name, _)| *name == "Retry-After"));
        assert_eq!(pairs.len(), 4);
    }
}
