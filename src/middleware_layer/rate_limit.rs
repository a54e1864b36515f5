use std::sync::Arc;
use std::time::Duration;

use http::Method;

use crate::clock::SharedClock;
use crate::config::RateLimitConfig;
use crate::middleware_layer::policy::RoutePolicy;
use crate::repositories::{RateLimitStore, bounded};

/// Which budget a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitClass {
    Login,
    Sensitive,
    Default,
}

impl LimitClass {
    /// Login paths first, then sensitive operations, else the default budget.
    pub fn classify(policy: &RoutePolicy, path: &str, method: &Method) -> Self {
        if policy.is_login(path) {
            LimitClass::Login
        } else if policy.is_sensitive(path, method) {
            LimitClass::Sensitive
        } else {
            LimitClass::Default
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitClass::Login => "login",
            LimitClass::Sensitive => "sensitive",
            LimitClass::Default => "default",
        }
    }
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    /// Over budget; retry after this many seconds.
    Exceeded { retry_after_secs: u64 },
}

/// Fixed-window limiter per `(ip, class)`.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    rules: RateLimitConfig,
    clock: SharedClock,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        rules: RateLimitConfig,
        clock: SharedClock,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            rules,
            clock,
            store_timeout,
        }
    }

    /// Counts one request against the `(ip, class)` window.
    ///
    /// A counter store that fails or times out lets the request through.
    pub async fn check(&self, ip: &str, class: LimitClass) -> LimitDecision {
        let rule = self.rules.rule_for(class);
        let key = format!("{}:{}", class.as_str(), ip);

        let window = match bounded(
            self.store_timeout,
            "rate limit counter",
            self.store.hit(&key, rule.window, self.clock.now()),
        )
        .await
        {
            Ok(window) => window,
            Err(e) => {
                tracing::warn!(
                    class = class.as_str(),
                    "⚠️ Rate limit store unavailable, allowing request: {}",
                    e
                );
                return LimitDecision::Allowed;
            }
        };

        if window.count > rule.requests as u64 {
            let retry_after_secs = window.resets_in.as_millis().div_ceil(1000) as u64;
            tracing::debug!(
                class = class.as_str(),
                count = window.count,
                retry_after_secs,
                "Rate limit exceeded"
            );
            LimitDecision::Exceeded { retry_after_secs }
        } else {
            LimitDecision::Allowed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RateLimitRule;
    use crate::repositories::rate_limit::MemoryRateLimitStore;

    fn limiter(clock: &ManualClock, store: Arc<dyn RateLimitStore>) -> RateLimiter {
        let rules = RateLimitConfig {
            login: RateLimitRule::new(2, Duration::from_secs(900)),
            ..RateLimitConfig::default()
        };
        RateLimiter::new(store, rules, Arc::new(clock.clone()), Duration::from_secs(1))
    }

    #[test]
    fn classification_order() {
        let policy = RoutePolicy::default();
        assert_eq!(
            LimitClass::classify(&policy, "/api/auth/login", &Method::POST),
            LimitClass::Login
        );
        assert_eq!(
            LimitClass::classify(&policy, "/api/parents", &Method::POST),
            LimitClass::Sensitive
        );
        assert_eq!(
            LimitClass::classify(&policy, "/api/parents", &Method::GET),
            LimitClass::Default
        );
    }

    #[tokio::test]
    async fn third_login_is_rejected_with_retry_after() {
        let clock = ManualClock::default();
        let limiter = limiter(&clock, Arc::new(MemoryRateLimitStore::new()));

        assert_eq!(limiter.check("1.2.3.4", LimitClass::Login).await, LimitDecision::Allowed);
        assert_eq!(limiter.check("1.2.3.4", LimitClass::Login).await, LimitDecision::Allowed);

        clock.advance(chrono::Duration::milliseconds(100_500));
        assert_eq!(
            limiter.check("1.2.3.4", LimitClass::Login).await,
            LimitDecision::Exceeded { retry_after_secs: 800 }
        );

        // Other classes and IPs keep their own budget.
        assert_eq!(limiter.check("1.2.3.4", LimitClass::Default).await, LimitDecision::Allowed);
        assert_eq!(limiter.check("5.6.7.8", LimitClass::Login).await, LimitDecision::Allowed);
    }

    #[tokio::test]
    async fn window_resets() {
        let clock = ManualClock::default();
        let limiter = limiter(&clock, Arc::new(MemoryRateLimitStore::new()));

        for _ in 0..3 {
            limiter.check("1.2.3.4", LimitClass::Login).await;
        }
        clock.advance(chrono::Duration::seconds(901));
        assert_eq!(limiter.check("1.2.3.4", LimitClass::Login).await, LimitDecision::Allowed);
    }
}
