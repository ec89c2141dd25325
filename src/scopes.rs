//! Nested sub-trackers (`SwarmScope`) and positionally-bound fan-out merges
//! (`ParallelScope`).
//!
//! Both scope types borrow the parent [`Context`] and [`PrimeRegistry`] by
//! reference rather than constructing their own — there is exactly one
//! modulus and one rate limiter per application domain.

use sha2::{Digest, Sha256};

use crate::accumulator::{Accumulator, AccumulatorError};
use crate::context::Context;
use crate::primes::{PrimeError, PrimeRegistry};
use crate::Int;

/// Errors surfaced by [`SwarmScope`] and [`ParallelScope`].
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error(transparent)]
    Context(#[from] crate::context::ContextError),
    #[error(transparent)]
    Prime(#[from] PrimeError),
    #[error(transparent)]
    Accumulator(#[from] AccumulatorError),
}

/// The result of [`SwarmScope::seal_and_export`]: a non-interactive
/// commitment that a named sub-swarm performed some bounded amount of work,
/// ready for injection into a parent accumulator.
#[derive(Debug, Clone)]
pub struct SwarmExport {
    pub swarm_prime: Int,
    pub work_proof: Int,
    pub complexity: u32,
    pub ops: u64,
}

/// A hierarchical sub-tracker: owns its own [`Accumulator`], seeded fresh at
/// `T = 2`, `d = 0`, under the *parent's* `Context`/`PrimeRegistry`.
pub struct SwarmScope<'a> {
    swarm_name: String,
    ctx: &'a Context,
    registry: &'a PrimeRegistry,
    backend: Accumulator,
}

impl<'a> SwarmScope<'a> {
    pub fn new(swarm_name: impl Into<String>, ctx: &'a Context, registry: &'a PrimeRegistry) -> Self {
        Self {
            swarm_name: swarm_name.into(),
            ctx,
            registry,
            backend: Accumulator::new(),
        }
    }

    /// Delegate a sub-task to this swarm's own accumulator. Any error (ops
    /// limit, rate limit, ...) propagates to the caller exactly as it would
    /// from a top-level [`Accumulator::update`].
    pub fn track_sub_task(&mut self, sub_agent_name: &str) -> Result<Int, ScopeError> {
        Ok(self.backend.update(self.ctx, self.registry, sub_agent_name, None)?)
    }

    /// Close out this swarm's tracking and produce a commitment suitable
    /// for injection into a parent accumulator via
    /// [`inject_swarm_result`].
    #[tracing::instrument(skip(self))]
    pub fn seal_and_export(&self) -> Result<SwarmExport, ScopeError> {
        let swarm_prime = self.registry.register_agent(self.ctx, &self.swarm_name)?;
        let local_t = self.backend.t();
        let local_depth = self.backend.depth();

        let proof_payload = format!("{}:{}:{}", self.swarm_name, local_t, local_depth);
        let mut hasher = Sha256::new();
        hasher.update(proof_payload.as_bytes());
        let work_proof = Int::from_digits(&hasher.finalize(), rug::integer::Order::MsfBe);

        Ok(SwarmExport {
            swarm_prime,
            work_proof,
            complexity: local_depth,
            ops: self.backend.op_count(),
        })
    }
}

/// Inject a completed [`SwarmExport`] into a parent accumulator.
///
/// ```text
/// term_identity     = T_g^{swarm_prime}                   mod M
/// term_perturbation = G^{work_proof + d_g + complexity}   mod M
/// T_g'              = (term_identity * term_perturbation) mod M
/// d_g'              = d_g + 1
/// ```
///
/// The parent's op_count increments by 2; the parent's `T` and `depth` are
/// updated atomically so a subsequent `update` call with a
/// stale `expected_prev_t` fails exactly as it would after any other
/// update.
#[tracing::instrument(skip(ctx, parent, export))]
pub fn inject_swarm_result(
    ctx: &Context,
    parent: &mut Accumulator,
    export: &SwarmExport,
) -> Result<Int, ScopeError> {
    ctx.check_ops_budget(parent.op_count(), 2)?;

    let term_identity = ctx.pow_mod(parent.t(), &export.swarm_prime)?;
    let exponent = Int::from(&export.work_proof + parent.depth()) + export.complexity;
    let term_perturbation = ctx.pow_mod(&ctx.generator(), &exponent)?;
    let new_t = Int::from(term_identity * term_perturbation) % ctx.modulus();

    parent.force_advance(new_t.clone(), parent.depth() + 1, 2);
    Ok(new_t)
}

/// A fan-out merge over an ordered list of agent names.
///
/// Deliberately breaks the multiplicative commutativity that a naive
/// `T^{sum(p_i)}` would have: each position `i` is folded into the agent
/// identity (`"{name}#{i}"`) before prime derivation, so `{A,B}` and `{B,A}`
/// bind to different primes and therefore different final `T`.
pub struct ParallelScope<'a> {
    ctx: &'a Context,
    registry: &'a PrimeRegistry,
    base_t: Int,
    base_depth: u32,
    branch_ids: Vec<String>,
}

impl<'a> ParallelScope<'a> {
    pub fn new(ctx: &'a Context, registry: &'a PrimeRegistry, base_t: Int, base_depth: u32) -> Self {
        Self { ctx, registry, base_t, base_depth, branch_ids: Vec::new() }
    }

    pub fn add_branch_result(&mut self, agent_name: impl Into<String>) {
        self.branch_ids.push(agent_name.into());
    }

    /// Execute the cascaded merge and return `(T_final, d_b + 1, ops_cost)`.
    ///
    /// ```text
    /// T_0     = T_b
    /// T_{i+1} = (T_i^{p_i} * G^{hash_depth(d_b + 1)}) mod M
    /// ```
    ///
    /// where `p_i` is the prime bound to position `i` (`"{name}#{i}"`), not
    /// to the bare agent name. Any reordering of `branch_ids` yields a
    /// different `T_final` with overwhelming probability.
    #[tracing::instrument(skip(self))]
    pub fn merge(&self) -> Result<(Int, u32, u64), ScopeError> {
        if self.branch_ids.is_empty() {
            return Ok((self.base_t.clone(), self.base_depth, 0));
        }

        let next_depth = self.base_depth + 1;
        let depth_exponent = self.ctx.hash_depth(next_depth);

        let mut t = self.base_t.clone();
        let mut ops: u64 = 0;

        for (i, name) in self.branch_ids.iter().enumerate() {
            let positional_id = format!("{name}#{i}");
            let prime = self.registry.register_agent(self.ctx, &positional_id)?;

            self.ctx.check_ops_budget(ops, 2)?;

            let path_term = self.ctx.pow_mod(&t, &prime)?;
            let depth_term = self.ctx.pow_mod(&self.ctx.generator(), &depth_exponent)?;
            t = Int::from(path_term * depth_term) % self.ctx.modulus();
            ops += 2;
        }

        Ok((t, next_depth, ops))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swarm_injection_applies_the_expected_formula() {
        let ctx = Context::new_for_tests(10, "swarm-test");
        let reg = PrimeRegistry::new();

        let mut parent = Accumulator::new();
        let t_g = parent.t().clone();
        let d_g = parent.depth();

        let mut swarm = SwarmScope::new("swarm-1", &ctx, &reg);
        swarm.track_sub_task("s1").unwrap();
        swarm.track_sub_task("s2").unwrap();
        let export = swarm.seal_and_export().unwrap();
        assert_eq!(export.complexity, 2);

        let new_t = inject_swarm_result(&ctx, &mut parent, &export).unwrap();

        let swarm_prime = reg.register_agent(&ctx, "swarm-1").unwrap();
        let expected_identity = ctx.pow_mod(&t_g, &swarm_prime).unwrap();
        let expected_exponent = Int::from(&export.work_proof + d_g) + export.complexity;
        let expected_perturbation = ctx.pow_mod(&ctx.generator(), &expected_exponent).unwrap();
        let expected = Int::from(expected_identity * expected_perturbation) % ctx.modulus();

        assert_eq!(new_t, expected);
        assert_eq!(parent.depth(), d_g + 1);
    }

    #[test]
    fn parallel_merge_is_order_sensitive() {
        let ctx = Context::new_for_tests(10, "parallel-test");
        let reg = PrimeRegistry::new();
        let base_t = Int::from(2);

        let mut forward = ParallelScope::new(&ctx, &reg, base_t.clone(), 0);
        for name in ["X", "Y", "Z"] {
            forward.add_branch_result(name);
        }
        let (t_forward, d_forward, _) = forward.merge().unwrap();

        let mut reversed = ParallelScope::new(&ctx, &reg, base_t, 0);
        for name in ["Z", "Y", "X"] {
            reversed.add_branch_result(name);
        }
        let (t_reversed, d_reversed, _) = reversed.merge().unwrap();

        assert_ne!(t_forward, t_reversed);
        assert_eq!(d_forward, d_reversed);
    }

    #[test]
    fn merge_with_no_branches_is_a_no_op() {
        let ctx = Context::new_for_tests(10, "parallel-empty-test");
        let reg = PrimeRegistry::new();
        let base_t = Int::from(2);
        let scope = ParallelScope::new(&ctx, &reg, base_t.clone(), 3);
        let (t, d, ops) = scope.merge().unwrap();
        assert_eq!(t, base_t);
        assert_eq!(d, 3);
        assert_eq!(ops, 0);
    }

    #[test]
    fn positional_binding_distinguishes_repeated_names() {
        let ctx = Context::new_for_tests(10, "parallel-repeat-test");
        let reg = PrimeRegistry::new();
        let base_t = Int::from(2);

        let mut same_name_twice = ParallelScope::new(&ctx, &reg, base_t.clone(), 0);
        same_name_twice.add_branch_result("A");
        same_name_twice.add_branch_result("A");
        let (t, _, _) = same_name_twice.merge().unwrap();

        let mut single = ParallelScope::new(&ctx, &reg, base_t, 0);
        single.add_branch_result("A");
        let (t_single, _, _) = single.merge().unwrap();

        assert_ne!(t, t_single);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashSet;

        fn distinct_names_strategy() -> impl Strategy<Value = Vec<String>> {
            prop::collection::hash_set("[a-zA-Z0-9_]{1,12}", 2..6)
                .prop_map(|set: HashSet<String>| set.into_iter().collect())
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]

            /// spec.md §8 property 3: for any ordered list of >= 2 distinct
            /// names, `merge(L)` and `merge(reverse(L))` disagree on
            /// `T_final` but agree on `d_final`.
            #[test]
            fn parallel_merge_is_order_sensitive_for_any_distinct_names(
                names in distinct_names_strategy()
            ) {
                let ctx = Context::new_for_tests(10, "proptest-parallel-ordering");
                let reg = PrimeRegistry::new();
                let base_t = Int::from(2);

                let mut forward = ParallelScope::new(&ctx, &reg, base_t.clone(), 0);
                for name in &names {
                    forward.add_branch_result(name.clone());
                }
                let (t_forward, d_forward, _) = forward.merge().unwrap();

                let mut reversed = ParallelScope::new(&ctx, &reg, base_t, 0);
                for name in names.iter().rev() {
                    reversed.add_branch_result(name.clone());
                }
                let (t_reversed, d_reversed, _) = reversed.merge().unwrap();

                prop_assert_ne!(t_forward, t_reversed);
                prop_assert_eq!(d_forward, d_reversed);
            }
        }
    }
}
