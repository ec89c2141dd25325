//! Crate root: public surface, shared aliases, and protocol-wide invariants.
//!
//! This module is the single canonical entry point for downstream users.
//! It re-exports the submodules that implement the design and centralizes
//! the big-integer alias used everywhere else in the crate.
//!
//! ## Invariants
//!
//! - **Group.** All modular arithmetic happens mod a strong-RSA modulus `M`
//!   owned by a [`context::Context`]: `M = p*q` with `p = 2p'+1`, `q = 2q'+1`,
//!   all four values prime. The factors are zeroized before `Context`
//!   becomes visible to callers. The fixed generator is `G = 4`, a quadratic
//!   residue in any such group.
//! - **Determinism.** Given the same `Context`, `PrimeRegistry`, and ordered
//!   sequence of agent ids, the resulting trace `T` is bit-identical across
//!   runs — see the property tests in [`accumulator`].
//! - **Domain separation.** Every hash-to-prime derivation is prefixed with
//!   the owning `Context`'s `DOMAIN` tag, so two applications never collide.
//! - **No unbounded work.** Every subsystem that performs modular
//!   exponentiation is wired through a shared operation counter bounded by
//!   `MAX_OPS`; the registry and the verifier carry their own, narrower caps
//!   (rate limiting, verification budget).
//!
//! This crate is a library only: no network transport, no persistent
//! snapshot store, no UI. Callers that need those wire this crate's traits
//! (chiefly [`accumulator::SnapshotSink`]) to whatever external system they
//! own.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Strong-RSA modulus, generator, domain tag, and the pure modular-arithmetic
/// primitives (`pow_mod`, `hash_depth`, `hash_to_prime`) every other module
/// builds on.
pub mod context;
/// Deterministic, domain-separated, rate-limited `agent_id -> prime` map.
pub mod primes;
/// The folding accumulator: `(T, depth, segment_id, op_count, history)`,
/// the update rule, and the snapshot/fold/chain mechanism.
pub mod accumulator;
/// Nested sub-trackers (`SwarmScope`) and positionally-bound fan-out merges
/// (`ParallelScope`).
pub mod scopes;
/// Seal/verify envelope: anchors a trace, a payload, and an op-count into a
/// tamper-evident JSON envelope.
pub mod seal;
/// Witness-list replay and the checks a verifier applies to a sealed
/// envelope before trusting its `T`.
pub mod inspector;

/// Canonical alias for the big-integer type used throughout the crate.
pub type Int = rug::Integer;

/// Security parameter in bits for prime-derivation inputs: primes produced
/// by [`context::Context::hash_to_prime`] are always at least this many
/// bits.
pub const PRIME_BITS: u32 = 256;

/// Miller–Rabin round count used for every primality test in this crate.
/// Each round halves the error bound by a further factor of 4
/// (`rug::Integer::is_probably_prime`'s documented `4^-reps` bound), so
/// `32` rounds gives an error probability of at most `2^-64`.
pub const MILLER_RABIN_ROUNDS: u32 = 32;

pub use accumulator::{
    Accumulator, AccumulatorError, HistoryEntry, InMemorySink, SnapshotBlock, SnapshotSink,
};
pub use context::{Context, ContextError};
pub use inspector::{Inspector, InspectorError};
pub use primes::{PrimeError, PrimeRegistry};
pub use scopes::{inject_swarm_result, ParallelScope, ScopeError, SwarmExport, SwarmScope};
pub use seal::{AgentState, Envelope, EnvelopeBody, EnvelopeHeader, SealError, Sealer, TraceMeta};
