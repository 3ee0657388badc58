//! Per-identity fixed-window admission control.
//!
//! Identities are hashed onto a fixed number of stripes, each guarded by its
//! own mutex, so admission for unrelated identities never contends on one
//! lock and memory stays proportional to active identities. The check and
//! the increment happen inside the same critical section.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasher;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_STRIPES: usize = 64;

/// Who a quota is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// An authenticated API key.
    Key(String),
    /// An anonymous caller, bucketed by network address.
    Address(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Never log a full key.
            Identity::Key(key) => write!(f, "key:{}…", key.chars().take(8).collect::<String>()),
            Identity::Address(addr) => write!(f, "addr:{}", addr),
        }
    }
}

/// Limits applied to one identity. `u64::MAX` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaTier {
    pub requests: u64,
    pub characters: u64,
    pub window: Duration,
}

impl QuotaTier {
    pub fn new(requests: Option<u64>, characters: Option<u64>, window: Duration) -> Self {
        Self {
            requests: requests.unwrap_or(u64::MAX),
            characters: characters.unwrap_or(u64::MAX),
            window,
        }
    }
}

/// How anonymous callers are grouped into quota buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AddressScope {
    /// One bucket per client address.
    #[default]
    Address,
    /// One bucket per network prefix.
    Subnet { ipv4_prefix: u8, ipv6_prefix: u8 },
    /// A single bucket shared by every anonymous caller.
    Global,
}

impl AddressScope {
    /// Map a client address to its quota identity.
    pub fn bucket(&self, address: &str) -> Identity {
        match self {
            AddressScope::Address => Identity::Address(address.to_string()),
            AddressScope::Global => Identity::Address("*".to_string()),
            AddressScope::Subnet {
                ipv4_prefix,
                ipv6_prefix,
            } => match address.parse::<IpAddr>() {
                Ok(IpAddr::V4(ip)) => {
                    let prefix = u32::from((*ipv4_prefix).min(32));
                    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
                    let network = std::net::Ipv4Addr::from(u32::from(ip) & mask);
                    Identity::Address(format!("{}/{}", network, prefix))
                }
                Ok(IpAddr::V6(ip)) => {
                    let prefix = u32::from((*ipv6_prefix).min(128));
                    let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
                    let network = std::net::Ipv6Addr::from(u128::from(ip) & mask);
                    Identity::Address(format!("{}/{}", network, prefix))
                }
                Err(_) => Identity::Address(address.to_string()),
            },
        }
    }
}

/// Counters for one identity in its current window.
#[derive(Debug, Clone, Copy)]
struct QuotaWindow {
    started: Instant,
    length: Duration,
    requests: u64,
    characters: u64,
}

impl QuotaWindow {
    fn fresh(now: Instant, length: Duration) -> Self {
        Self {
            started: now,
            length,
            requests: 0,
            characters: 0,
        }
    }

    fn ends(&self) -> Instant {
        self.started + self.length
    }

    /// Advance to the window containing `now`, keeping boundaries contiguous.
    fn roll(&mut self, now: Instant, length: Duration) {
        if length != self.length || length.is_zero() {
            *self = Self::fresh(now, length);
            return;
        }
        if now < self.ends() {
            return;
        }
        let length_ns = length.as_nanos();
        let skipped = (now - self.started).as_nanos() / length_ns * length_ns;
        self.started += Duration::from_nanos(u64::try_from(skipped).unwrap_or(u64::MAX));
        self.requests = 0;
        self.characters = 0;
    }
}

/// Which limit a rejection hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaResource {
    Requests,
    Characters,
}

/// A request that was not admitted. Counters were left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRejection {
    pub resource: QuotaResource,
    pub limit: u64,
    pub requested: u64,
    pub window: Duration,
    /// Time until the window rolls; `None` when waiting cannot help.
    pub retry_after: Option<Duration>,
    /// The request alone is larger than the whole window allowance.
    pub permanent: bool,
}

/// Remaining allowance after an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub requests_remaining: u64,
    pub characters_remaining: u64,
    pub resets_in: Duration,
}

/// Snapshot of an identity's consumption in its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub requests: u64,
    pub characters: u64,
}

type Stripe = Mutex<HashMap<Identity, QuotaWindow>>;

/// Striped fixed-window rate limiter.
pub struct RateLimiter {
    stripes: Box<[Stripe]>,
    hasher: RandomState,
}

impl RateLimiter {
    pub fn new(stripes: usize) -> Self {
        let count = stripes.max(1).next_power_of_two();
        Self {
            stripes: (0..count).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn stripe(&self, identity: &Identity) -> &Stripe {
        let hash = self.hasher.hash_one(identity) as usize;
        &self.stripes[hash & (self.stripes.len() - 1)]
    }

    /// Check `characters` plus one request against `tier` and record them if
    /// both fit.
    pub fn admit(
        &self,
        identity: &Identity,
        tier: &QuotaTier,
        characters: u64,
    ) -> Result<Admission, QuotaRejection> {
        let now = Instant::now();
        // Counters are only written after all checks pass, so a poisoned
        // stripe still holds consistent values.
        let mut stripe = self
            .stripe(identity)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let window = stripe
            .entry(identity.clone())
            .or_insert_with(|| QuotaWindow::fresh(now, tier.window));
        window.roll(now, tier.window);

        let resets_in = window.ends().saturating_duration_since(now);
        let reject = |resource, limit, permanent: bool| QuotaRejection {
            resource,
            limit,
            requested: characters,
            window: tier.window,
            retry_after: (!permanent).then_some(resets_in),
            permanent,
        };

        if characters > tier.characters {
            return Err(reject(QuotaResource::Characters, tier.characters, true));
        }
        if tier.requests == 0 {
            return Err(reject(QuotaResource::Requests, 0, true));
        }
        if window.requests >= tier.requests {
            return Err(reject(QuotaResource::Requests, tier.requests, false));
        }
        if characters > tier.characters.saturating_sub(window.characters) {
            return Err(reject(QuotaResource::Characters, tier.characters, false));
        }

        window.requests += 1;
        window.characters += characters;

        Ok(Admission {
            requests_remaining: tier.requests.saturating_sub(window.requests),
            characters_remaining: tier.characters.saturating_sub(window.characters),
            resets_in,
        })
    }

    /// Consumption in the identity's current window, if it has one.
    pub fn usage(&self, identity: &Identity) -> Option<QuotaUsage> {
        let now = Instant::now();
        let stripe = self
            .stripe(identity)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        stripe.get(identity).map(|window| {
            if now < window.ends() {
                QuotaUsage {
                    requests: window.requests,
                    characters: window.characters,
                }
            } else {
                QuotaUsage {
                    requests: 0,
                    characters: 0,
                }
            }
        })
    }

    /// Drop identities whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for stripe in self.stripes.iter() {
            let mut stripe = stripe.lock().unwrap_or_else(PoisonError::into_inner);
            let before = stripe.len();
            stripe.retain(|_, window| now < window.ends());
            removed += before - stripe.len();
        }
        removed
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.stripes
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
