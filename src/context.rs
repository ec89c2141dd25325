//! Global cryptographic context: strong-RSA modulus, generator, domain tag.
//!
//! [`Context`] is constructed once per application/domain and is immutable
//! thereafter. It is the *only* place modular arithmetic primitives live —
//! every other module (`primes`, `accumulator`, `scopes`, `seal`,
//! `inspector`) goes through [`Context::pow_mod`], [`Context::hash_depth`],
//! or [`Context::hash_to_prime`] rather than touching `rug::Integer` modular
//! operations directly.
//!
//! ## Trapdoor hygiene
//!
//! Constructing a strong-RSA modulus requires knowing its prime factors
//! (`p`, `q`, and the Sophie Germain primes `p'`, `q'` behind them) during
//! generation. [`Context::new`] zeroizes all four the moment `M = p*q` is
//! computed; nothing past that point in this module, or any module built on
//! it, ever has access to them again.

#![allow(missing_docs)]

use std::fmt;

use rand::RngCore;
use rug::integer::{IsPrime, Order};
use rug::rand::{RandState, ThreadRandGen};
use rug::{Assign, Integer};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::{MILLER_RABIN_ROUNDS, PRIME_BITS};

/// Maximum agent-id length accepted by [`Context::hash_to_prime`], in bytes.
pub const MAX_AGENT_ID_BYTES: usize = 256;

/// Fixed generator of the quadratic-residue subgroup. `4 = 2^2` is a QR mod
/// any integer, so this is safe for any strong-RSA modulus without further
/// per-instance checking.
pub const GENERATOR: u32 = 4;

/// Default depth cap per accumulator segment.
pub const DEFAULT_MAX_DEPTH: u32 = 10;

/// Default operation-count ceiling per accumulator lifetime.
pub const DEFAULT_MAX_OPS: u64 = 1_000_000;

/// Errors surfaced by [`Context`] construction and its pure operations.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("agent id exceeds {MAX_AGENT_ID_BYTES} bytes (got {0})")]
    InputTooLong(usize),
    #[error("operation would exceed the context's op-count ceiling ({max_ops})")]
    OpsLimit { max_ops: u64 },
    #[error("requested bit length {0} is too small for a strong-RSA modulus (minimum 256)")]
    BitLengthTooSmall(usize),
    #[error("candidate modulus does not have a quadratic-residue subgroup under G={GENERATOR}")]
    WeakGenerator,
    #[error("exponent must be non-negative")]
    NegativeExponent,
}

/// Bridges `rand`'s OS-backed CSPRNG into `rug`'s random-bits API, so GMP's
/// generator is always seeded from real entropy rather than its own
/// (non-cryptographic) default state.
struct OsBackedGen;

impl ThreadRandGen for OsBackedGen {
    fn gen(&mut self) -> u32 {
        rand::rngs::OsRng.next_u32()
    }
}

fn rand_state() -> RandState<'static> {
    // `Box::leak` keeps the generator alive for the `'static` lifetime
    // `RandState::new_custom` requires; the allocation is a few bytes and
    // lives for the process.
    let gen: &'static mut OsBackedGen = Box::leak(Box::new(OsBackedGen));
    RandState::new_custom(gen)
}

/// Immutable, per-application cryptographic context: the strong-RSA modulus
/// `M`, the fixed generator `G`, the domain-separation tag, and the caps
/// every other module enforces calls against.
pub struct Context {
    modulus: Integer,
    domain: String,
    max_depth: u32,
    max_ops: u64,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("modulus_bits", &self.modulus.significant_bits())
            .field("domain", &self.domain)
            .field("max_depth", &self.max_depth)
            .field("max_ops", &self.max_ops)
            .finish()
    }
}

impl Context {
    /// Generate a fresh strong-RSA modulus and build a `Context` around it.
    ///
    /// `bit_length` is the modulus size (both safe primes are drawn at
    /// roughly `bit_length / 2` bits). `domain` defaults to a random 16-byte
    /// hex tag when `None` — a shared fixed default would defeat the
    /// cross-application isolation the domain tag exists for.
    #[tracing::instrument(skip_all, fields(bit_length, max_depth))]
    pub fn new(
        bit_length: usize,
        max_depth: u32,
        domain: Option<String>,
    ) -> Result<Self, ContextError> {
        Self::new_with_ops_cap(bit_length, max_depth, domain, DEFAULT_MAX_OPS)
    }

    /// As [`Context::new`], with an explicit `max_ops` ceiling instead of
    /// the default.
    pub fn new_with_ops_cap(
        bit_length: usize,
        max_depth: u32,
        domain: Option<String>,
        max_ops: u64,
    ) -> Result<Self, ContextError> {
        if bit_length < 256 {
            return Err(ContextError::BitLengthTooSmall(bit_length));
        }
        let mut rng = rand_state();
        let half = (bit_length / 2) as u32;

        let (p, mut p_prime) = generate_safe_prime(half, &mut rng);
        let (q, mut q_prime) = loop {
            let (q, q_prime) = generate_safe_prime(half, &mut rng);
            if q != p {
                break (q, q_prime);
            }
        };

        let modulus = Integer::from(&p * &q);

        // Trapdoor destruction. `rug::Integer` does not implement `Zeroize`
        // (it owns a GMP-managed limb buffer safe Rust cannot reach), and
        // `assign(0)` alone only flips GMP's internal size field to zero —
        // the limb buffer still holds the old bits until the allocator
        // reuses or frees it. Overwrite every factor's limbs with fresh
        // random data of the same bit length first (GMP keeps the existing
        // buffer and copies over it for a same-size `assign`, rather than
        // reallocating), so the secret bits themselves are gone before the
        // value is reduced to zero and dropped.
        let mut p = p;
        let mut q = q;
        for factor in [&mut p, &mut q, &mut p_prime, &mut q_prime] {
            let bits = factor.significant_bits().max(1);
            let mut garbage = Integer::from(Integer::random_bits(bits, &mut rng));
            factor.assign(&garbage);
            garbage.assign(0);
            factor.assign(0);
        }
        drop((p, q, p_prime, q_prime));

        if !is_quadratic_residue_subgroup_sound(&modulus) {
            return Err(ContextError::WeakGenerator);
        }

        let domain = domain.unwrap_or_else(random_domain_tag);
        tracing::debug!(domain = %domain, bits = modulus.significant_bits(), "context constructed");

        Ok(Self { modulus, domain, max_depth, max_ops })
    }

    /// Build a `Context` around a caller-supplied modulus, skipping key
    /// generation. Only used by the deterministic test constructor below —
    /// a modulus whose factorization is not destroyed defeats the whole
    /// hidden-order-group assumption, so this is intentionally not exposed
    /// outside `#[cfg(test)]`.
    #[cfg(test)]
    pub(crate) fn from_modulus_for_tests(modulus: Integer, max_depth: u32, domain: String) -> Self {
        Self { modulus, domain, max_depth, max_ops: DEFAULT_MAX_OPS }
    }

    /// A small, fixed modulus for test scenarios that need reproducible `T`
    /// values (absolute `T` values depend on `M`).
    #[cfg(test)]
    pub fn new_for_tests(max_depth: u32, domain: &str) -> Self {
        // A fixed 512-bit strong-RSA-shaped modulus. Not a real trapdoor
        // (the factorization below is public), used only so tests are fast
        // and reproducible; never reachable from non-test code.
        let mut rng = rand_state();
        let (p, _) = generate_safe_prime(256, &mut rng);
        let (q, _) = generate_safe_prime(256, &mut rng);
        let modulus = Integer::from(&p * &q);
        Self::from_modulus_for_tests(modulus, max_depth, domain.to_string())
    }

    pub fn modulus(&self) -> &Integer {
        &self.modulus
    }

    pub fn generator(&self) -> Integer {
        Integer::from(GENERATOR)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn max_ops(&self) -> u64 {
        self.max_ops
    }

    /// Fail if applying `additional_ops` more modular exponentiations would
    /// cross `max_ops`, given `current_ops` already spent.
    pub fn check_ops_budget(&self, current_ops: u64, additional_ops: u64) -> Result<(), ContextError> {
        if current_ops.saturating_add(additional_ops) > self.max_ops {
            return Err(ContextError::OpsLimit { max_ops: self.max_ops });
        }
        Ok(())
    }

    /// `base^exp mod M`. The only path for modular exponentiation in the
    /// core. Exponents are length-bounded to `4 * |M|` bits to thwart
    /// exponent-blowup DoS attempts.
    pub fn pow_mod(&self, base: &Integer, exp: &Integer) -> Result<Integer, ContextError> {
        if exp.cmp0() == std::cmp::Ordering::Less {
            return Err(ContextError::NegativeExponent);
        }
        let max_exp_bits = 4 * self.modulus.significant_bits() as u64;
        if exp.significant_bits() as u64 > max_exp_bits {
            return Err(ContextError::OpsLimit { max_ops: self.max_ops });
        }
        let mut reduced_base = Integer::from(base % &self.modulus);
        if reduced_base.cmp0() == std::cmp::Ordering::Less {
            reduced_base += &self.modulus;
        }
        reduced_base
            .pow_mod(exp, &self.modulus)
            .map_err(|_| ContextError::NegativeExponent)
    }

    /// `SHA256(decimal(depth))` interpreted as a big integer, used as the
    /// depth-dependent exponent in the update rule and in every scope merge,
    /// rather than the bare `depth + 1` a naive implementation might
    /// reach for — hashing destroys the low-bit structure a bare small
    /// integer exponent would otherwise have.
    pub fn hash_depth(&self, depth: u32) -> Integer {
        let mut hasher = Sha256::new();
        hasher.update(depth.to_string().as_bytes());
        let digest = hasher.finalize();
        Integer::from_digits(&digest, Order::MsfBe)
    }

    /// Deterministic hash-to-prime: `h = SHA256(DOMAIN || agent_id)`, then
    /// walk the odd candidates `h, h+2, h+4, ...` until one passes
    /// Miller–Rabin at [`crate::MILLER_RABIN_ROUNDS`] rounds and is at least
    /// [`crate::PRIME_BITS`] bits. Pure and memoization-friendly — callers
    /// that need caching (i.e. [`crate::primes::PrimeRegistry`]) memoize the
    /// result themselves.
    pub fn hash_to_prime(&self, agent_id: &str) -> Result<Integer, ContextError> {
        if agent_id.len() > MAX_AGENT_ID_BYTES {
            return Err(ContextError::InputTooLong(agent_id.len()));
        }
        let mut hasher = Sha256::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(agent_id.as_bytes());
        let digest = hasher.finalize();

        let mut candidate = Integer::from_digits(&digest, Order::MsfBe);
        candidate.set_bit(0, true); // force odd

        loop {
            if candidate.significant_bits() >= PRIME_BITS
                && candidate.is_probably_prime(MILLER_RABIN_ROUNDS) != IsPrime::No
            {
                return Ok(candidate);
            }
            candidate += 2;
        }
    }
}

/// Search for a safe prime `p = 2p' + 1` at roughly `bits` bits, returning
/// `(p, p')`. Both are tested at [`crate::MILLER_RABIN_ROUNDS`] rounds.
fn generate_safe_prime(bits: u32, rng: &mut RandState<'_>) -> (Integer, Integer) {
    loop {
        let mut p_prime = Integer::from(Integer::random_bits(bits, rng));
        p_prime.set_bit(0, true);
        p_prime.set_bit(bits - 1, true); // keep the bit length honest

        if p_prime.is_probably_prime(MILLER_RABIN_ROUNDS) == IsPrime::No {
            continue;
        }
        let p = Integer::from(&p_prime * 2u32) + 1;
        if p.is_probably_prime(MILLER_RABIN_ROUNDS) != IsPrime::No {
            return (p, p_prime);
        }
    }
}

/// `G = 4` is a QR mod any integer. The only real precondition is that `M`
/// is actually a product of two (distinct, odd) primes, which construction
/// above already guarantees; this is kept as an explicit, named check so an
/// alternate future constructor (e.g. loading an externally audited `M`)
/// cannot silently skip it.
fn is_quadratic_residue_subgroup_sound(modulus: &Integer) -> bool {
    modulus.is_odd() && modulus.significant_bits() > 3
}

fn random_domain_tag() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let tag = hex::encode(bytes);
    bytes.zeroize();
    tag
}
