//! Sliding-window rate limiting and the abuse gate.
//!
//! Windows live in the volatile store as sorted sets: score = epoch
//! millis, member = `<millis>:<nonce>`. Each check prunes entries older
//! than the window, reads the cardinality, and inserts only when allowed.
//! A volatile outage fails open; limiting is protection, not correctness.

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use tracing::warn;

use crate::config::{RateLimitConfig, RateLimitRule};
use crate::datetime::now_millis;
use crate::events::{Event, EventSink};
use crate::user::Role;
use crate::volatile::{keys, VolatileStore};
use crate::{Result, StrataError};

/// Operation class being limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    Upload,
    Download,
    Auth,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Upload => "upload",
            LimitType::Download => "download",
            LimitType::Auth => "auth",
        }
    }
}

/// Who is being limited: an authenticated principal or an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    User(i64),
    Ip(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::User(id) => write!(f, "user:{id}"),
            Identifier::Ip(addr) => write!(f, "ip:{addr}"),
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the window after this one.
    pub remaining: u32,
    /// Seconds until the oldest entry leaves the window; zero when allowed.
    pub retry_after_secs: u64,
}

fn allowance(rule: &RateLimitRule, identifier: &Identifier, role: Option<Role>) -> u32 {
    match identifier {
        Identifier::Ip(_) => rule.anonymous,
        Identifier::User(_) => match role.unwrap_or(Role::Free) {
            Role::Free => rule.free,
            Role::Premium => rule.premium,
            Role::Admin => rule.admin,
        },
    }
}

/// Sliding-window rate limiter.
pub struct RateLimiter {
    volatile: Arc<VolatileStore>,
    config: RateLimitConfig,
    events: Arc<dyn EventSink>,
}

impl RateLimiter {
    pub fn new(
        volatile: Arc<VolatileStore>,
        config: RateLimitConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            volatile,
            config,
            events,
        }
    }

    fn rule(&self, limit_type: LimitType) -> &RateLimitRule {
        match limit_type {
            LimitType::Upload => &self.config.upload,
            LimitType::Download => &self.config.download,
            LimitType::Auth => &self.config.auth,
        }
    }

    /// Check and, when allowed, consume one slot.
    pub fn check(
        &self,
        limit_type: LimitType,
        identifier: &Identifier,
        role: Option<Role>,
    ) -> RateLimitDecision {
        let rule = self.rule(limit_type);
        let limit = allowance(rule, identifier, role);
        let window_ms = rule.window_secs as i64 * 1000;
        let now = now_millis();
        let key = format!("{}{}:{identifier}", keys::RATE_LIMIT, limit_type.as_str());

        let outcome = (|| -> crate::volatile::VolatileResult<RateLimitDecision> {
            self.volatile
                .zremrangebyscore(&key, 0.0, (now - window_ms) as f64)?;
            let count = self.volatile.zcard(&key)? as u32;

            if count < limit {
                let nonce: u32 = rand::thread_rng().gen();
                self.volatile
                    .zadd(&key, now as f64, format!("{now}:{nonce}"))?;
                self.volatile.expire(&key, rule.window_secs)?;
                return Ok(RateLimitDecision {
                    allowed: true,
                    remaining: limit - count - 1,
                    retry_after_secs: 0,
                });
            }

            let oldest = self.volatile.zrange_with_scores(&key, 0, 0)?;
            let retry_ms = oldest
                .first()
                .map(|(_, score)| *score as i64 + window_ms - now)
                .unwrap_or(window_ms);
            let retry_after_secs =
                (((retry_ms + 999) / 1000).max(1) as u64).min(rule.window_secs);
            Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs,
            })
        })();

        match outcome {
            Ok(decision) => {
                if !decision.allowed {
                    self.events.emit(&Event::RateLimitRejected {
                        limit_type: limit_type.as_str(),
                        identifier: identifier.to_string(),
                    });
                }
                decision
            }
            Err(e) => {
                // Fail open: an unreachable window store must not take the
                // service down with it.
                warn!(%identifier, error = %e, "rate limiter degraded, allowing");
                RateLimitDecision {
                    allowed: true,
                    remaining: limit,
                    retry_after_secs: 0,
                }
            }
        }
    }

    /// Enforce the decision as a typed error.
    pub fn enforce(
        &self,
        limit_type: LimitType,
        identifier: &Identifier,
        role: Option<Role>,
    ) -> Result<RateLimitDecision> {
        let decision = self.check(limit_type, identifier, role);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(StrataError::RateLimitExceeded {
                retry_after_secs: decision.retry_after_secs,
            })
        }
    }

    /// Record a policy violation for an address (traversal attempt,
    /// repeated chunk validation failure). Fails open.
    pub fn record_violation(&self, ip: &str) {
        let key = format!("{}{ip}", keys::ABUSE);
        match self.volatile.incr(&key) {
            Ok(score) => {
                if score == 1 {
                    let _ = self
                        .volatile
                        .expire(&key, self.config.abuse_window_secs);
                }
                if score == self.config.abuse_threshold {
                    self.events.emit(&Event::AbuseBlocked { ip: ip.to_string() });
                }
            }
            Err(e) => warn!(%ip, error = %e, "abuse counter unavailable"),
        }
    }

    /// Reject requests from addresses over the abuse threshold. The block
    /// lasts until the counter's TTL runs out. Fails open.
    pub fn check_blocked(&self, ip: &str) -> Result<()> {
        let key = format!("{}{ip}", keys::ABUSE);
        let score = match self.volatile.get(&key) {
            Ok(Some(raw)) => raw.parse::<i64>().unwrap_or(0),
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(%ip, error = %e, "abuse gate degraded, allowing");
                return Ok(());
            }
        };

        if score >= self.config.abuse_threshold {
            let retry_after_secs = match self.volatile.ttl(&key) {
                Ok(Some(ttl)) if ttl > 0 => ttl as u64,
                _ => self.config.abuse_window_secs,
            };
            return Err(StrataError::IpBlocked { retry_after_secs });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;

    fn limiter_with(config: RateLimitConfig) -> (Arc<VolatileStore>, Arc<MemoryEventSink>, RateLimiter) {
        let volatile = Arc::new(VolatileStore::new());
        let events = Arc::new(MemoryEventSink::new());
        let limiter = RateLimiter::new(
            Arc::clone(&volatile),
            config,
            Arc::clone(&events) as Arc<dyn EventSink>,
        );
        (volatile, events, limiter)
    }

    fn tight_config(limit: u32, window_secs: u64) -> RateLimitConfig {
        let rule = RateLimitRule {
            window_secs,
            free: limit,
            premium: limit * 10,
            admin: limit * 10,
            anonymous: limit,
        };
        RateLimitConfig {
            upload: rule,
            download: rule,
            auth: rule,
            abuse_threshold: 3,
            abuse_window_secs: 60,
        }
    }

    #[test]
    fn test_budget_enforced() {
        let (_volatile, _events, limiter) = limiter_with(tight_config(3, 60));
        let who = Identifier::User(1);

        for i in 0..3 {
            let decision = limiter.check(LimitType::Upload, &who, Some(Role::Free));
            assert!(decision.allowed, "request {i} should pass");
            assert_eq!(decision.remaining, 2 - i);
        }

        let denied = limiter.check(LimitType::Upload, &who, Some(Role::Free));
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs >= 1 && denied.retry_after_secs <= 60);
    }

    #[test]
    fn test_identifiers_isolated() {
        let (_volatile, _events, limiter) = limiter_with(tight_config(1, 60));

        assert!(limiter
            .check(LimitType::Download, &Identifier::User(1), Some(Role::Free))
            .allowed);
        assert!(!limiter
            .check(LimitType::Download, &Identifier::User(1), Some(Role::Free))
            .allowed);

        // A different user and a raw address each get their own window.
        assert!(limiter
            .check(LimitType::Download, &Identifier::User(2), Some(Role::Free))
            .allowed);
        assert!(limiter
            .check(
                LimitType::Download,
                &Identifier::Ip("10.0.0.1".into()),
                None
            )
            .allowed);
    }

    #[test]
    fn test_types_isolated() {
        let (_volatile, _events, limiter) = limiter_with(tight_config(1, 60));
        let who = Identifier::User(7);
        assert!(limiter.check(LimitType::Upload, &who, Some(Role::Free)).allowed);
        assert!(limiter.check(LimitType::Download, &who, Some(Role::Free)).allowed);
        assert!(limiter.check(LimitType::Auth, &who, Some(Role::Free)).allowed);
    }

    #[test]
    fn test_role_allowance() {
        let (_volatile, _events, limiter) = limiter_with(tight_config(1, 60));
        let who = Identifier::User(9);

        // Premium allowance is 10x the free one in this config.
        for _ in 0..10 {
            assert!(limiter
                .check(LimitType::Upload, &who, Some(Role::Premium))
                .allowed);
        }
        assert!(!limiter
            .check(LimitType::Upload, &who, Some(Role::Premium))
            .allowed);
    }

    #[test]
    fn test_fail_open_on_outage() {
        let (volatile, _events, limiter) = limiter_with(tight_config(1, 60));
        volatile.set_available(false);

        for _ in 0..20 {
            assert!(limiter
                .check(LimitType::Upload, &Identifier::User(1), Some(Role::Free))
                .allowed);
        }
    }

    #[test]
    fn test_enforce_maps_to_error() {
        let (_volatile, _events, limiter) = limiter_with(tight_config(1, 60));
        let who = Identifier::Ip("10.1.1.1".into());

        limiter.enforce(LimitType::Auth, &who, None).unwrap();
        let err = limiter.enforce(LimitType::Auth, &who, None).unwrap_err();
        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(err.status_code(), 429);
    }

    #[test]
    fn test_rejection_emits_event() {
        let (_volatile, events, limiter) = limiter_with(tight_config(1, 60));
        let who = Identifier::User(3);
        limiter.check(LimitType::Upload, &who, Some(Role::Free));
        limiter.check(LimitType::Upload, &who, Some(Role::Free));

        assert!(events
            .events()
            .iter()
            .any(|e| matches!(e, Event::RateLimitRejected { .. })));
    }

    #[test]
    fn test_abuse_block_after_threshold() {
        let (_volatile, events, limiter) = limiter_with(tight_config(100, 60));

        limiter.check_blocked("1.2.3.4").unwrap();
        for _ in 0..3 {
            limiter.record_violation("1.2.3.4");
        }

        let err = limiter.check_blocked("1.2.3.4").unwrap_err();
        assert_eq!(err.code(), "IP_BLOCKED");
        if let StrataError::IpBlocked { retry_after_secs } = err {
            assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
        }

        // Other addresses stay clean.
        limiter.check_blocked("5.6.7.8").unwrap();

        assert!(events
            .events()
            .iter()
            .any(|e| matches!(e, Event::AbuseBlocked { .. })));
    }

    #[test]
    fn test_abuse_gate_fails_open() {
        let (volatile, _events, limiter) = limiter_with(tight_config(1, 60));
        for _ in 0..5 {
            limiter.record_violation("9.9.9.9");
        }
        volatile.set_available(false);
        limiter.check_blocked("9.9.9.9").unwrap();
    }
}
