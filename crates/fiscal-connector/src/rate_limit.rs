//! Per-client-IP rate limiting for pairing.
//!
//! Token bucket per IP (governor), buckets kept in a `DashMap` and pruned
//! when idle.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::{debug, warn};

/// Limiter consulted by the pairing service.
pub trait PairingRateLimiter: Send + Sync {
    /// `Err(wait)` when `ip` is over quota.
    fn check(&self, ip: IpAddr) -> Result<(), Duration>;
}

struct Bucket {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    last_access: Instant,
}

/// governor-backed per-IP limiter.
pub struct IpRateLimiter {
    buckets: DashMap<IpAddr, Bucket>,
    quota: Quota,
    clock: DefaultClock,
}

impl IpRateLimiter {
    /// `attempts` per minute per IP, burst of the same size.
    pub fn per_minute(attempts: u32) -> Self {
        let attempts = NonZeroU32::new(attempts).unwrap_or(NonZeroU32::MIN);
        IpRateLimiter {
            buckets: DashMap::new(),
            quota: Quota::per_minute(attempts),
            clock: DefaultClock::default(),
        }
    }

    /// Drops buckets idle for longer than `max_age`.
    pub fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        self.buckets.retain(|ip, bucket| {
            let keep = now.duration_since(bucket.last_access) < max_age;
            if !keep {
                debug!(ip = %ip, "Removing idle rate limit bucket");
            }
            keep
        });
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl PairingRateLimiter for IpRateLimiter {
    fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        let mut bucket = self.buckets.entry(ip).or_insert_with(|| Bucket {
            limiter: RateLimiter::direct(self.quota),
            last_access: Instant::now(),
        });
        bucket.last_access = Instant::now();

        match bucket.limiter.check() {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                warn!(ip = %ip, wait_ms = wait.as_millis() as u64, "Pairing rate limit hit");
                Err(wait)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_quota_per_ip() {
        let limiter = IpRateLimiter::per_minute(3);
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        for _ in 0..3 {
            assert!(limiter.check(a).is_ok());
        }
        let wait = limiter.check(a).unwrap_err();
        assert!(wait > Duration::ZERO);

        // Other clients are unaffected
        assert!(limiter.check(b).is_ok());
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_cleanup_drops_idle_buckets() {
        let limiter = IpRateLimiter::per_minute(3);
        limiter.check(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();

        limiter.cleanup(Duration::from_secs(60));
        assert_eq!(limiter.bucket_count(), 1);

        limiter.cleanup(Duration::ZERO);
        assert_eq!(limiter.bucket_count(), 0);
    }
}
