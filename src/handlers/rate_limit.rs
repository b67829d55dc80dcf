//! Per-client-address rate limiting in three categories. In-memory and
//! process-local, which is enough for a single control plane. Every
//! rate-limited response advertises its remaining quota; over-limit requests
//! get a 429 with the same headers zeroed out.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::HeaderValue;
use axum::response::{IntoResponseParts, ResponseParts};
use strum::Display;
use tracing::warn;

use super::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    Deploy,
    Upload,
    Api,
}

impl Category {
    pub fn limit(self) -> u32 {
        match self {
            Category::Deploy => 10,
            Category::Upload => 5,
            Category::Api => 100,
        }
    }

    pub fn window(self) -> Duration {
        match self {
            Category::Deploy | Category::Upload => Duration::from_secs(3600),
            Category::Api => Duration::from_secs(60),
        }
    }
}

/// What is left of the window after a successful check. Returned by
/// [`RateLimiter::check`] so handlers can hand it back as response parts.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitQuota {
    pub limit: u32,
    pub remaining: u32,
}

impl IntoResponseParts for RateLimitQuota {
    type Error = Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        let headers = res.headers_mut();
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        Ok(res)
    }
}

#[derive(Clone, Default)]
pub struct RateLimiter {
    requests: Arc<Mutex<HashMap<(Category, IpAddr), Vec<Instant>>>>,
}

impl RateLimiter {
    /// Records one request and returns the remaining quota, or the 429 error
    /// when the window is already full.
    pub fn check(&self, category: Category, client: IpAddr) -> Result<RateLimitQuota, Error> {
        let mut requests = self.requests.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let window = category.window();

        let seen = requests.entry((category, client)).or_default();
        seen.retain(|at| now.duration_since(*at) < window);

        if seen.len() >= category.limit() as usize {
            warn!(%client, %category, "rate limit exceeded");
            return Err(Error::RateLimited {
                category,
                limit: category.limit(),
            });
        }

        seen.push(now);
        Ok(RateLimitQuota {
            limit: category.limit(),
            remaining: category.limit() - seen.len() as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn eleventh_deploy_is_rejected() {
        let limiter = RateLimiter::default();

        for n in 0..10 {
            let quota = limiter.check(Category::Deploy, client()).unwrap();
            assert_eq!(quota.limit, 10);
            assert_eq!(quota.remaining, 10 - n - 1);
        }

        let err = limiter.check(Category::Deploy, client()).unwrap_err();
        assert!(matches!(
            err,
            Error::RateLimited {
                category: Category::Api | Category::Deploy | Category::Upload,
                limit: 10
            }
        ));
    }

    #[test]
    fn categories_and_clients_are_independent() {
        let limiter = RateLimiter::default();
        let other: IpAddr = "10.0.0.2".parse().unwrap();

        for _ in 0..10 {
            limiter.check(Category::Deploy, client()).unwrap();
        }
        assert!(limiter.check(Category::Deploy, client()).is_err());

        // Same category, different address.
        assert!(limiter.check(Category::Deploy, other).is_ok());
        // Same address, different category.
        let quota = limiter.check(Category::Api, client()).unwrap();
        assert_eq!(quota.remaining, 99);
    }
}
