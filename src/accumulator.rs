//! The folding accumulator: `(T, depth, segment_id, op_count,
//! last_snapshot_hash, history)`, the update rule, and the snapshot/fold/
//! chain mechanism.

use sha2::{Digest, Sha256};

use crate::context::Context;
use crate::primes::{PrimeError, PrimeRegistry};
use crate::Int;

/// 64 `'0'` characters — the genesis `last_snapshot_hash`.
pub fn genesis_hash() -> String {
    "0".repeat(64)
}

/// One append-only audit entry. Content is advisory only; it is never part
/// of the integrity contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub depth: u32,
    pub agent_id: String,
    pub t_after: Int,
    pub folded: bool,
    pub op_count: u64,
}

/// A folded segment, handed to a [`SnapshotSink`] when the accumulator
/// closes out a segment at `MAX_DEPTH`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotBlock {
    pub segment_id: u64,
    /// Decimal string, per the wire format.
    pub final_t: String,
    pub depth_at_snapshot: u32,
    pub snapshot_hash: String,
    pub prev_hash: String,
    pub timestamp: f64,
}

/// Errors surfaced by [`Accumulator`].
#[derive(Debug, thiserror::Error)]
pub enum AccumulatorError {
    #[error(transparent)]
    Context(#[from] crate::context::ContextError),
    #[error(transparent)]
    Prime(#[from] PrimeError),
    #[error("expected_prev_t did not match the accumulator's current T; a stale or replayed state was supplied")]
    StaleState,
    #[error("snapshot block's prev_hash did not chain to the accumulator's last_snapshot_hash")]
    ChainIntegrity,
    #[error("snapshot sink rejected the emitted block: {0}")]
    SinkRejected(String),
}

/// External destination for folded [`SnapshotBlock`]s. The accumulator owns
/// no persistence of its own — a caller wires this to whatever store,
/// queue, or file it actually uses.
pub trait SnapshotSink {
    fn accept(&mut self, block: &SnapshotBlock) -> Result<(), String>;
}

/// In-memory sink, primarily for tests and small embeddings that don't need
/// a real external store.
#[derive(Debug, Default)]
pub struct InMemorySink {
    pub blocks: Vec<SnapshotBlock>,
}

impl SnapshotSink for InMemorySink {
    fn accept(&mut self, block: &SnapshotBlock) -> Result<(), String> {
        self.blocks.push(block.clone());
        Ok(())
    }
}

/// The accumulator: `T`, `depth`, `segment_id`, `op_count`,
/// `last_snapshot_hash`, and an advisory `history` log.
///
/// Single-writer, many-reader: nothing here is internally
/// synchronized, by design — callers wanting concurrent fan-out drive a
/// [`crate::scopes::ParallelScope`] or merge independent accumulators
/// through [`crate::scopes::SwarmScope`] instead of sharing one instance
/// across threads.
pub struct Accumulator {
    t: Int,
    depth: u32,
    segment_id: u64,
    op_count: u64,
    last_snapshot_hash: String,
    history: Vec<HistoryEntry>,
    history_capacity: Option<usize>,
}

impl Accumulator {
    /// `T = 2`, `depth = 0`, `segment_id = 0`, `op_count = 0`, genesis
    /// `last_snapshot_hash`.
    pub fn new() -> Self {
        Self::with_history_capacity(None)
    }

    /// As [`Accumulator::new`], bounding how many [`HistoryEntry`] values
    /// are retained. History is advisory-only, so bounding it
    /// changes nothing about verification; it only controls process memory
    /// for accumulators tracking very long paths.
    pub fn with_history_capacity(history_capacity: Option<usize>) -> Self {
        Self {
            t: Int::from(2),
            depth: 0,
            segment_id: 0,
            op_count: 0,
            last_snapshot_hash: genesis_hash(),
            history: Vec::new(),
            history_capacity,
        }
    }

    pub fn t(&self) -> &Int {
        &self.t
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    pub fn op_count(&self) -> u64 {
        self.op_count
    }

    pub fn last_snapshot_hash(&self) -> &str {
        &self.last_snapshot_hash
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Fold-free specialization of [`Accumulator::update_with_snapshot`]:
    /// fails rather than folding if `depth == MAX_DEPTH`, via a sink that
    /// always rejects. One accumulator type covers both the folding and
    /// non-folding cases rather than splitting them across a type hierarchy.
    #[tracing::instrument(skip(self, ctx, registry))]
    pub fn update(
        &mut self,
        ctx: &Context,
        registry: &PrimeRegistry,
        agent_id: &str,
        expected_prev_t: Option<&Int>,
    ) -> Result<Int, AccumulatorError> {
        struct NoFold;
        impl SnapshotSink for NoFold {
            fn accept(&mut self, _block: &SnapshotBlock) -> Result<(), String> {
                Err("this accumulator was created without a snapshot sink; it cannot fold".into())
            }
        }
        let (t, _folded, _block) =
            self.update_with_snapshot(ctx, registry, agent_id, expected_prev_t, None, &mut NoFold)?;
        Ok(t)
    }

    /// Apply the update rule for `agent_id`, folding first if `depth` is
    /// already at `MAX_DEPTH`. Returns the new `T`, whether a fold occurred,
    /// and the emitted block if so.
    ///
    /// `expected_last_snapshot_hash` is the fold-chaining counterpart to
    /// `expected_prev_t`: a caller that tracks the accumulator's chain state
    /// externally (e.g. mirrors `last_snapshot_hash` alongside the emitted
    /// blocks in its own ledger) passes its belief of the current value
    /// here. If a fold is triggered and that belief disagrees with this
    /// accumulator's actual `last_snapshot_hash`, the call fails
    /// `ChainIntegrity` instead of emitting a block the caller's ledger
    /// would then disagree with. Passing `None` skips the check, matching
    /// callers that don't mirror chain state externally.
    ///
    /// The whole call is all-or-nothing: on any error the accumulator's
    /// observable state (`T`, `depth`, `segment_id`, `op_count`,
    /// `last_snapshot_hash`) is exactly what it was before the call,
    /// with no exceptions.
    #[tracing::instrument(skip(self, ctx, registry, sink))]
    pub fn update_with_snapshot(
        &mut self,
        ctx: &Context,
        registry: &PrimeRegistry,
        agent_id: &str,
        expected_prev_t: Option<&Int>,
        expected_last_snapshot_hash: Option<&str>,
        sink: &mut dyn SnapshotSink,
    ) -> Result<(Int, bool, Option<SnapshotBlock>), AccumulatorError> {
        if let Some(expected) = expected_prev_t {
            if expected != &self.t {
                return Err(AccumulatorError::StaleState);
            }
        }

        let prime = registry.register_agent(ctx, agent_id)?;

        // Compute the fold (if needed) and the subsequent update entirely
        // against local values before mutating `self`, so a failure at any
        // point (ops budget, arithmetic, sink rejection) leaves `self`
        // untouched.
        let mut working_t = self.t.clone();
        let mut working_depth = self.depth;
        let mut working_segment = self.segment_id;
        let mut working_ops = self.op_count;
        let mut working_last_hash = self.last_snapshot_hash.clone();

        let mut folded = false;
        let mut emitted_block = None;

        // Checked before any sink I/O: a call that cannot afford the
        // pending update must never touch the sink, or a failed update
        // would leave a fold block durably recorded that the accumulator
        // itself never committed to.
        ctx.check_ops_budget(working_ops, 2)?;

        if working_depth == ctx.max_depth() {
            if let Some(expected_hash) = expected_last_snapshot_hash {
                if expected_hash != self.last_snapshot_hash {
                    return Err(AccumulatorError::ChainIntegrity);
                }
            }

            let snapshot_hash = sha256_decimal_hex(&working_t);
            let block = SnapshotBlock {
                segment_id: working_segment,
                final_t: working_t.to_string(),
                depth_at_snapshot: ctx.max_depth(),
                snapshot_hash: snapshot_hash.clone(),
                prev_hash: self.last_snapshot_hash.clone(),
                timestamp: unix_seconds(),
            };

            sink.accept(&block)
                .map_err(AccumulatorError::SinkRejected)?;

            let reseeded = hex_to_int(&snapshot_hash) % ctx.modulus();
            working_t = reseeded;
            working_depth = 0;
            working_segment += 1;
            working_last_hash = snapshot_hash;
            folded = true;
            emitted_block = Some(block);
        }

        let path_term = ctx.pow_mod(&working_t, &prime)?;
        let depth_term = ctx.pow_mod(&ctx.generator(), &ctx.hash_depth(working_depth))?;
        let new_t = Int::from(path_term * depth_term) % ctx.modulus();
        working_ops += 2;
        working_depth += 1;

        self.t = new_t.clone();
        self.depth = working_depth;
        self.segment_id = working_segment;
        self.op_count = working_ops;
        self.last_snapshot_hash = working_last_hash;
        self.push_history(HistoryEntry {
            depth: working_depth,
            agent_id: agent_id.to_string(),
            t_after: new_t.clone(),
            folded,
            op_count: working_ops,
        });

        Ok((new_t, folded, emitted_block))
    }

    /// Atomically advance state from an injection (a swarm merge result),
    /// bypassing the standard per-agent update rule — used by
    /// [`crate::scopes::inject_swarm_result`], whose update formula differs
    /// from [`Accumulator::update`]'s but must commit with the same
    /// single-transition guarantee.
    pub(crate) fn force_advance(&mut self, new_t: Int, new_depth: u32, additional_ops: u64) {
        self.op_count += additional_ops;
        self.depth = new_depth;
        self.t = new_t.clone();
        self.push_history(HistoryEntry {
            depth: new_depth,
            agent_id: "<swarm-injection>".to_string(),
            t_after: new_t,
            folded: false,
            op_count: self.op_count,
        });
    }

    fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if let Some(cap) = self.history_capacity {
            while self.history.len() > cap {
                self.history.remove(0);
            }
        }
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn sha256_decimal_hex(value: &Int) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn hex_to_int(hex_digest: &str) -> Int {
    let bytes = hex::decode(hex_digest).expect("snapshot hashes are always well-formed hex");
    Int::from_digits(&bytes, rug::integer::Order::MsfBe)
}

fn unix_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + now.timestamp_subsec_nanos() as f64 / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Context, PrimeRegistry, Accumulator) {
        (
            Context::new_for_tests(10, "accumulator-test"),
            PrimeRegistry::new(),
            Accumulator::new(),
        )
    }

    #[test]
    fn linear_chain_tracks_depth_and_op_count() {
        let (ctx, reg, mut acc) = setup();
        acc.update(&ctx, &reg, "A", None).unwrap();
        acc.update(&ctx, &reg, "B", None).unwrap();
        assert_eq!(acc.depth(), 2);
        assert_eq!(acc.op_count(), 4);
        assert_eq!(acc.segment_id(), 0);
    }

    #[test]
    fn fold_emits_one_block_at_depth_cap() {
        let ctx = Context::new_for_tests(3, "accumulator-fold-test");
        let reg = PrimeRegistry::new();
        let mut acc = Accumulator::new();
        let mut sink = InMemorySink::default();

        for id in ["A", "B", "C", "D"] {
            acc.update_with_snapshot(&ctx, &reg, id, None, None, &mut sink).unwrap();
        }

        assert_eq!(sink.blocks.len(), 1);
        let block = &sink.blocks[0];
        assert_eq!(block.segment_id, 0);
        assert_eq!(block.depth_at_snapshot, 3);
        assert_eq!(block.prev_hash, genesis_hash());
        assert_eq!(acc.depth(), 1);
        assert_eq!(acc.segment_id(), 1);
    }

    #[test]
    fn determinism_replaying_same_witness_list_twice() {
        let ctx = Context::new_for_tests(10, "determinism-test");
        let witness = ["A", "B", "C"];

        let run = |ctx: &Context| {
            let reg = PrimeRegistry::new();
            let mut acc = Accumulator::new();
            for id in witness {
                acc.update(ctx, &reg, id, None).unwrap();
            }
            (acc.t().clone(), acc.op_count())
        };

        let (t1, ops1) = run(&ctx);
        let (t2, ops2) = run(&ctx);
        assert_eq!(t1, t2);
        assert_eq!(ops1, ops2);
    }

    #[test]
    fn replay_guard_rejects_stale_expected_prev_t() {
        let (ctx, reg, mut acc) = setup();
        let t0 = acc.t().clone();
        acc.update(&ctx, &reg, "A", Some(&t0)).unwrap();
        let err = acc.update(&ctx, &reg, "A", Some(&t0)).unwrap_err();
        assert!(matches!(err, AccumulatorError::StaleState));
    }

    #[test]
    fn failed_update_leaves_state_untouched() {
        let (ctx, reg, mut acc) = setup();
        let before = (acc.t().clone(), acc.depth(), acc.op_count());
        let wrong_prev = Int::from(999_999);
        let err = acc.update(&ctx, &reg, "A", Some(&wrong_prev)).unwrap_err();
        assert!(matches!(err, AccumulatorError::StaleState));
        assert_eq!((acc.t().clone(), acc.depth(), acc.op_count()), before);
    }

    #[test]
    fn fold_chaining_holds_across_multiple_segments() {
        let ctx = Context::new_for_tests(1, "chain-test");
        let reg = PrimeRegistry::new();
        let mut acc = Accumulator::new();
        let mut sink = InMemorySink::default();

        for i in 0..6 {
            let id = format!("agent-{i}");
            acc.update_with_snapshot(&ctx, &reg, &id, None, None, &mut sink).unwrap();
        }

        assert!(sink.blocks.len() >= 2);
        assert_eq!(sink.blocks[0].prev_hash, genesis_hash());
        for pair in sink.blocks.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].snapshot_hash);
        }
    }

    #[test]
    fn chain_integrity_rejects_a_stale_caller_belief() {
        let ctx = Context::new_for_tests(3, "chain-integrity-test");
        let reg = PrimeRegistry::new();
        let mut acc = Accumulator::new();
        let mut sink = InMemorySink::default();

        for id in ["A", "B", "C"] {
            acc.update_with_snapshot(&ctx, &reg, id, None, None, &mut sink).unwrap();
        }
        assert_eq!(acc.depth(), 3);
        assert_eq!(sink.blocks.len(), 0);

        let wrong_belief = "f".repeat(64);
        let err = acc
            .update_with_snapshot(&ctx, &reg, "D", None, Some(&wrong_belief), &mut sink)
            .unwrap_err();
        assert!(matches!(err, AccumulatorError::ChainIntegrity));
        assert!(sink.blocks.is_empty(), "a rejected fold must never reach the sink");
        assert_eq!(acc.depth(), 3, "a rejected fold must leave state untouched");

        let correct_belief = acc.last_snapshot_hash().to_string();
        acc.update_with_snapshot(&ctx, &reg, "D", None, Some(&correct_belief), &mut sink).unwrap();
        assert_eq!(sink.blocks.len(), 1);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn agent_id_strategy() -> impl Strategy<Value = String> {
            "[a-zA-Z0-9_]{1,16}"
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]

            /// spec.md §8 property 1: replaying the same witness list twice
            /// from a fresh accumulator always yields the same `T` and
            /// `op_count`, for any witness list.
            #[test]
            fn determinism_holds_for_any_witness_list(
                witness in prop::collection::vec(agent_id_strategy(), 1..8)
            ) {
                let ctx = Context::new_for_tests(10, "proptest-accum-determinism");

                let run = || {
                    let reg = PrimeRegistry::new();
                    let mut acc = Accumulator::new();
                    for id in &witness {
                        acc.update(&ctx, &reg, id, None).unwrap();
                    }
                    (acc.t().clone(), acc.op_count())
                };

                let (t1, ops1) = run();
                let (t2, ops2) = run();
                prop_assert_eq!(t1, t2);
                prop_assert_eq!(ops1, ops2);
            }

            /// spec.md §8 property 5: re-applying `update(id, expected_prev_t)`
            /// with an expectation already consumed by an earlier call always
            /// fails `StaleState`, for any agent id.
            #[test]
            fn replay_guard_rejects_any_reapplied_expectation(id in agent_id_strategy()) {
                let ctx = Context::new_for_tests(10, "proptest-replay-guard");
                let reg = PrimeRegistry::new();
                let mut acc = Accumulator::new();

                let t0 = acc.t().clone();
                acc.update(&ctx, &reg, &id, Some(&t0)).unwrap();
                let err = acc.update(&ctx, &reg, &id, Some(&t0)).unwrap_err();
                prop_assert!(matches!(err, AccumulatorError::StaleState));
            }
        }
    }
}
