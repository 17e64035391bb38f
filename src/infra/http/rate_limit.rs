//! Per-client admission control for the conversion route.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use dashmap::DashMap;

use crate::config::RateLimitSettings;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Who a request is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientId {
    Peer(IpAddr),
    /// No peer address is known; all such requests share one budget.
    Unknown,
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientId::Peer(ip) => write!(f, "{ip}"),
            ClientId::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { remaining: u32 },
    Throttled { retry_after: Duration },
}

/// Sliding window of admitted requests per client.
///
/// Clients are identified by the socket peer. `x-forwarded-for` is consulted
/// only when explicitly trusted, and only when its first hop parses as an IP
/// address.
#[derive(Debug)]
pub struct ClientRateLimiter {
    window: Duration,
    capacity: u32,
    trust_forwarded_for: bool,
    history: DashMap<ClientId, VecDeque<Instant>>,
}

impl ClientRateLimiter {
    pub fn new(window: Duration, capacity: u32) -> Self {
        Self {
            window,
            capacity,
            trust_forwarded_for: false,
            history: DashMap::new(),
        }
    }

    pub fn trusting_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn identify(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> ClientId {
        if self.trust_forwarded_for {
            let forwarded = headers
                .get(FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .and_then(|hop| hop.trim().parse::<IpAddr>().ok());
            if let Some(ip) = forwarded {
                return ClientId::Peer(ip);
            }
        }
        peer.map_or(ClientId::Unknown, ClientId::Peer)
    }

    pub fn admit(&self, client: ClientId) -> Admission {
        self.admit_at(client, Instant::now())
    }

    fn admit_at(&self, client: ClientId, now: Instant) -> Admission {
        let mut history = self.history.entry(client).or_default();
        while history
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= self.window)
        {
            history.pop_front();
        }

        let used = u32::try_from(history.len()).unwrap_or(u32::MAX);
        if used >= self.capacity {
            let oldest = history.front().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            return Admission::Throttled { retry_after };
        }

        history.push_back(now);
        Admission::Admitted {
            remaining: self.capacity - used - 1,
        }
    }

    /// Forget clients with nothing left inside the window.
    pub fn prune(&self) {
        let now = Instant::now();
        self.history.retain(|_, history| {
            history
                .back()
                .is_some_and(|at| now.saturating_duration_since(*at) < self.window)
        });
    }

    pub fn tracked_clients(&self) -> usize {
        self.history.len()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl From<&RateLimitSettings> for ClientRateLimiter {
    fn from(settings: &RateLimitSettings) -> Self {
        Self::new(
            Duration::from_secs(u64::from(settings.window_seconds.get())),
            settings.max_requests.get(),
        )
        .trusting_forwarded_for(settings.trust_forwarded_for)
    }
}

/// `Retry-After` carries whole seconds; round up and never advertise zero.
pub(super) fn retry_after_header_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 4));

    fn forwarded(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, value.parse().expect("header value"));
        headers
    }

    #[test]
    fn throttles_once_capacity_is_used() {
        let limiter = ClientRateLimiter::new(Duration::from_secs(60), 2);
        let client = ClientId::Peer(PEER);
        let now = Instant::now();

        assert_eq!(
            limiter.admit_at(client, now),
            Admission::Admitted { remaining: 1 }
        );
        assert_eq!(
            limiter.admit_at(client, now + Duration::from_secs(10)),
            Admission::Admitted { remaining: 0 }
        );
        assert_eq!(
            limiter.admit_at(client, now + Duration::from_secs(15)),
            Admission::Throttled {
                retry_after: Duration::from_secs(45)
            }
        );
    }

    #[test]
    fn slots_free_up_as_the_window_slides() {
        let limiter = ClientRateLimiter::new(Duration::from_secs(60), 1);
        let client = ClientId::Peer(PEER);
        let now = Instant::now();

        assert!(matches!(
            limiter.admit_at(client, now),
            Admission::Admitted { .. }
        ));
        assert!(matches!(
            limiter.admit_at(client, now + Duration::from_secs(59)),
            Admission::Throttled { .. }
        ));
        assert!(matches!(
            limiter.admit_at(client, now + Duration::from_secs(60)),
            Admission::Admitted { .. }
        ));
    }

    #[test]
    fn forwarded_for_is_ignored_unless_trusted() {
        let limiter = ClientRateLimiter::new(Duration::from_secs(60), 1);

        let client = limiter.identify(&forwarded("203.0.113.7"), Some(PEER));
        assert_eq!(client, ClientId::Peer(PEER));
        assert_eq!(
            limiter.identify(&HeaderMap::new(), None),
            ClientId::Unknown
        );
    }

    #[test]
    fn trusted_forwarded_for_uses_the_first_valid_hop() {
        let limiter =
            ClientRateLimiter::new(Duration::from_secs(60), 1).trusting_forwarded_for(true);

        assert_eq!(
            limiter.identify(&forwarded("203.0.113.7, 10.0.0.1"), Some(PEER)),
            ClientId::Peer("203.0.113.7".parse().expect("ip"))
        );
        assert_eq!(
            limiter.identify(&forwarded("not-an-ip"), Some(PEER)),
            ClientId::Peer(PEER)
        );
    }

    #[test]
    fn prune_forgets_idle_clients() {
        let limiter = ClientRateLimiter::new(Duration::from_millis(10), 5);
        limiter.admit(ClientId::Peer(PEER));
        assert_eq!(limiter.tracked_clients(), 1);

        std::thread::sleep(Duration::from_millis(20));
        limiter.prune();
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn retry_after_rounds_up_to_whole_seconds() {
        assert_eq!(retry_after_header_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_header_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_header_secs(Duration::from_secs(45)), 45);
    }
}
