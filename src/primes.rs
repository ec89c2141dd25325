//! Deterministic, domain-separated, rate-limited `agent_id -> prime` map.
//!
//! `PrimeRegistry` memoizes [`Context::hash_to_prime`] so that every caller
//! in a process sees the same prime for the same agent id without
//! recomputing Miller–Rabin on every lookup, and bounds how fast *new*
//! primes can be minted — the DoS lever this registry exists to bound.
//!
//! ## Rate limiting: the global-counter reading
//!
//! A per-id dictionary-based cooldown lets each *distinct* id through
//! once a second regardless of how many other ids were also requested that
//! second, which could mean "100 distinct ids per second, globally" or "one
//! id per id per second" — the two readings diverge under a burst of
//! distinct ids. This registry implements the former — a single
//! shared [`governor::RateLimiter`] counts *all* new-prime derivations
//! across every agent id, capped at [`MAX_REQUESTS_PER_WINDOW`] per rolling
//! second — because a per-id cooldown does not actually bound how much
//! Miller–Rabin work a burst of distinct ids can trigger.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::RwLock;

use governor::{Quota, RateLimiter};

use crate::context::Context;
use crate::Int;

/// New-prime derivations allowed per rolling one-second window, shared
/// across every agent id.
pub const MAX_REQUESTS_PER_WINDOW: u32 = 100;

/// Errors surfaced by [`PrimeRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum PrimeError {
    #[error("more than {MAX_REQUESTS_PER_WINDOW} new primes requested within one second")]
    RateLimited,
    #[error(transparent)]
    Context(#[from] crate::context::ContextError),
}

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Deterministic, append-only `agent_id -> prime` cache, guarded by a
/// shared new-prime rate limiter.
///
/// Entries are never evicted: replaying an old witness list must always
/// resolve the same agent ids to the same primes, for as long as the
/// process that registered them is alive.
pub struct PrimeRegistry {
    cache: RwLock<HashMap<String, Int>>,
    limiter: DirectLimiter,
}

impl Default for PrimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PrimeRegistry {
    pub fn new() -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(MAX_REQUESTS_PER_WINDOW).expect("MAX_REQUESTS_PER_WINDOW is non-zero"),
        );
        Self { cache: RwLock::new(HashMap::new()), limiter: RateLimiter::direct(quota) }
    }

    /// Resolve `agent_id` to its prime, deriving and caching it on first
    /// use. Deterministic: repeated calls with the same id under the same
    /// `Context` always return the same prime.
    #[tracing::instrument(skip(self, ctx))]
    pub fn register_agent(&self, ctx: &Context, agent_id: &str) -> Result<Int, PrimeError> {
        if let Some(p) = self.cache.read().expect("prime cache lock poisoned").get(agent_id) {
            return Ok(p.clone());
        }

        self.limiter.check().map_err(|_| PrimeError::RateLimited)?;

        let prime = ctx.hash_to_prime(agent_id)?;

        let mut cache = self.cache.write().expect("prime cache lock poisoned");
        // Another writer may have raced us between the read-lock miss above
        // and taking the write lock; prefer the entry already present so
        // concurrent registrations of the same id never disagree.
        let prime = cache.entry(agent_id.to_string()).or_insert(prime).clone();
        Ok(prime)
    }

    /// Alias of [`PrimeRegistry::register_agent`] — lookups are lazy but
    /// deterministic, so "register" and "get" are the same operation.
    pub fn get_prime(&self, ctx: &Context, agent_id: &str) -> Result<Int, PrimeError> {
        self.register_agent(ctx, agent_id)
    }

    /// Look up a previously-registered prime without deriving one, used by
    /// the verifier to reject witness lists that name ids it has never
    /// seen.
    pub fn lookup(&self, agent_id: &str) -> Option<Int> {
        self.cache.read().expect("prime cache lock poisoned").get(agent_id).cloned()
    }

    /// Number of distinct agent ids currently cached.
    pub fn len(&self) -> usize {
        self.cache.read().expect("prime cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
