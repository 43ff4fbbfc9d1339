//! Per-source rate limiters
//!
//! Every caller that talks to the same source in this process shares one
//! limiter, so concurrent pipelines and resolver lookups cannot together
//! exceed the configured ceiling.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use kgdb_common::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Registered {
    requests_per_second: f64,
    limiter: Arc<DefaultDirectRateLimiter>,
}

/// Process-wide registry of source limiters
#[derive(Clone, Default)]
pub struct RateLimiterRegistry {
    limiters: Arc<Mutex<HashMap<String, Registered>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limiter for `source`, created on first use.
    ///
    /// A changed rate (config reload) replaces the limiter; callers holding
    /// the old one keep using it until they are rebuilt.
    pub fn limiter_for(
        &self,
        source: &str,
        requests_per_second: f64,
    ) -> Result<Arc<DefaultDirectRateLimiter>> {
        let mut limiters = self
            .limiters
            .lock()
            .map_err(|_| Error::Internal("rate limiter registry poisoned".to_string()))?;

        if let Some(existing) = limiters.get(source) {
            if existing.requests_per_second == requests_per_second {
                return Ok(existing.limiter.clone());
            }
            tracing::info!(
                source,
                old_rate = existing.requests_per_second,
                new_rate = requests_per_second,
                "Rate limit changed, replacing limiter"
            );
        }

        let limiter = Arc::new(RateLimiter::direct(quota_for(requests_per_second)?));
        limiters.insert(
            source.to_string(),
            Registered {
                requests_per_second,
                limiter: limiter.clone(),
            },
        );
        Ok(limiter)
    }
}

/// One request per `1/rate` seconds, no bursting
fn quota_for(requests_per_second: f64) -> Result<Quota> {
    if !(requests_per_second > 0.0) || !requests_per_second.is_finite() {
        return Err(Error::Config(format!(
            "requests_per_second must be positive, got {}",
            requests_per_second
        )));
    }
    let period = Duration::from_secs_f64(1.0 / requests_per_second);
    Quota::with_period(period).ok_or_else(|| {
        Error::Config(format!(
            "requests_per_second {} is too high to express as an interval",
            requests_per_second
        ))
    })
}
