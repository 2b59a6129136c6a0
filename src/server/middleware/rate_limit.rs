use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::{net::IpAddr, num::NonZeroU32, sync::Arc};

/// A rate limiter for new connections, keyed by peer IP.
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    /// The underlying rate limiter instance, shared across clones.
    limiter: Arc<DefaultKeyedRateLimiter<IpAddr>>,
}

impl ConnectionRateLimiter {
    /// Creates a limiter allowing `per_second` new connections per IP, with an equal burst.
    ///
    /// # Arguments
    ///
    /// * `per_second` - Sustained connection rate per peer IP.
    pub fn new(per_second: NonZeroU32) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::keyed(Quota::per_second(per_second))),
        }
    }

    /// Whether a connection from `ip` fits its quota. Never waits: the accept loop
    /// drops a connection over quota instead of delaying it.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.limiter.check_key(&ip).is_ok()
    }

    /// Forgets peers whose quota has fully replenished.
    pub fn prune(&self) {
        self.limiter.retain_recent();
    }

    /// Number of peers currently tracked.
    pub fn tracked_peers(&self) -> usize {
        self.limiter.len()
    }
}
