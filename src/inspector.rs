//! Witness-list replay and the checks a verifier applies to a sealed
//! envelope before trusting its `T`.

use crate::context::Context;
use crate::primes::PrimeRegistry;
use crate::seal::{EnvelopeHeader, MAX_CLOCK_DRIFT_SECS, MAX_VERIFICATION_OPS};
use crate::Int;

/// Errors surfaced by [`Inspector::verify_path`].
///
/// This only covers failures in the underlying modular arithmetic itself
/// (a context-level `OpsLimit`/`NegativeExponent` while replaying a step).
/// Every rejection the verification protocol itself can raise —
/// `TimestampDrift`, an unknown witness, an over-budget replay, an ops
/// mismatch, or a plain trace mismatch — is not an error: it is reported as
/// `Ok((false, reason))`, matching the source inspector, which never raises
/// on a failed verification and always returns `(False, reason)`.
#[derive(Debug, thiserror::Error)]
pub enum InspectorError {
    #[error(transparent)]
    Context(#[from] crate::context::ContextError),
}

/// Replays a flat witness list against a `Context`/`PrimeRegistry` pair and
/// checks the result against a sealed envelope's header. Does not yet
/// express parallel/swarm structure in the witness language itself — only
/// the flat linear-chain case.
pub struct Inspector<'a> {
    ctx: &'a Context,
    registry: &'a PrimeRegistry,
}

impl<'a> Inspector<'a> {
    pub fn new(ctx: &'a Context, registry: &'a PrimeRegistry) -> Self {
        Self { ctx, registry }
    }

    /// Replay `witness_list` from the canonical initial state and check the
    /// result against `target_t` and `header`.
    ///
    /// 1. Reject if the header timestamp drifted more than
    ///    [`MAX_CLOCK_DRIFT_SECS`] from `now`.
    /// 2. Simulate `T = 2`, `d = 0`, `ops = 0`.
    /// 3. For each witness, fetch its prime (reject `UnknownAgent` if the
    ///    registry has never seen it), apply the standard update rule,
    ///    `ops += 2`; abort past [`MAX_VERIFICATION_OPS`].
    /// 4. Require `ops == header.ops` exactly.
    /// 5. Require the simulated `T == target_t`.
    ///
    /// Every check short-circuits to `Ok((false, reason))` on failure — only
    /// a fault in the modular arithmetic itself (an `Err` from
    /// [`Context::pow_mod`]) is surfaced as [`InspectorError`].
    #[tracing::instrument(skip(self, witness_list, header))]
    pub fn verify_path(
        &self,
        target_t: &Int,
        witness_list: &[String],
        header: Option<&EnvelopeHeader>,
        now: f64,
    ) -> Result<(bool, &'static str), InspectorError> {
        if let Some(header) = header {
            let drift = (now - header.timestamp).abs();
            if drift > MAX_CLOCK_DRIFT_SECS as f64 {
                return Ok((false, "TimestampDrift"));
            }
        }

        let mut simulated_t = Int::from(2);
        let mut simulated_depth: u32 = 0;
        let mut ops: u64 = 0;

        for agent_name in witness_list {
            let prime = match self.registry.lookup(agent_name) {
                Some(p) => p,
                None => return Ok((false, "UnknownAgent")),
            };

            let path_term = self.ctx.pow_mod(&simulated_t, &prime)?;
            ops += 1;

            let depth_term = self.ctx.pow_mod(&self.ctx.generator(), &self.ctx.hash_depth(simulated_depth))?;
            ops += 1;

            simulated_t = Int::from(path_term * depth_term) % self.ctx.modulus();
            simulated_depth += 1;

            if ops > MAX_VERIFICATION_OPS {
                return Ok((false, "VerificationOverBudget"));
            }
        }

        if let Some(header) = header {
            if ops != header.ops {
                return Ok((false, "OpsIntegrity"));
            }
        }

        if &simulated_t == target_t {
            Ok((true, "Verification Passed"))
        } else {
            Ok((false, "Trace mismatch"))
        }
    }
}
