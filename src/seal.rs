//! Seal/verify envelope: anchors a trace, a payload, and an op-count into a
//! tamper-evident JSON envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::Int;

/// Envelope format version, carried verbatim in every envelope produced by
/// this crate.
pub const ENVELOPE_VERSION: &str = "v4.0-hardened";

/// Clock-drift tolerance for envelope timestamps, in seconds.
pub const MAX_CLOCK_DRIFT_SECS: i64 = 300;

/// Per-call verification budget: modular exponentiations a single
/// `Inspector::verify_path` call may perform before it aborts.
pub const MAX_VERIFICATION_OPS: u64 = 5000;

/// Errors surfaced by [`Sealer`].
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("envelope integrity seal did not match its recomputed value")]
    SealMismatch,
    #[error("failed to canonicalize payload or metrics for hashing: {0}")]
    Canonicalization(#[from] serde_json::Error),
}

/// Mirrors `HolographicMeta` in the accumulator this crate replaces: the
/// path metadata a caller snapshots into an envelope at seal time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceMeta {
    pub trace_t: String,
    pub depth: u32,
    pub segment_id: u64,
    pub path_log: Vec<String>,
    pub total_op_count: u64,
}

/// The state a caller hands to [`Sealer::seal`]: an opaque payload plus the
/// trace metadata and freshness markers the envelope commits to.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub task_id: String,
    pub payload: Value,
    pub meta: TraceMeta,
    pub nonce: String,
    pub timestamp: f64,
}

impl AgentState {
    /// Build a state with a fresh random nonce and the current timestamp.
    pub fn new(task_id: impl Into<String>, payload: Value, meta: TraceMeta) -> Self {
        Self {
            task_id: task_id.into(),
            payload,
            meta,
            nonce: random_nonce_hex(),
            timestamp: unix_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub trace_t: String,
    pub integrity_seal: String,
    pub nonce: String,
    pub timestamp: f64,
    pub ops: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeBody {
    pub payload: Value,
    pub metrics: Option<Value>,
}

/// A sealed, tamper-evident envelope: header (commitments, freshness) +
/// body (the opaque payload and optional metrics it commits to).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub header: EnvelopeHeader,
    pub body: EnvelopeBody,
}

/// Stateless seal/verify operations. Holds no keys or context — both
/// directions are pure functions of their inputs.
pub struct Sealer;

impl Sealer {
    /// Produce an envelope whose `integrity_seal` commits to `trace_t`, a
    /// canonical hash of `payload`, a canonical JSON serialisation of
    /// `extra_metrics`, `nonce`, `timestamp`, and `total_op_count`.
    #[tracing::instrument(skip(state, extra_metrics))]
    pub fn seal(state: &AgentState, extra_metrics: Option<Value>) -> Result<Envelope, SealError> {
        let payload_hash = canonical_payload_hash(&state.payload)?;
        let metrics_str = canonical_metrics_string(extra_metrics.as_ref())?;

        let anchor = anchor_string(
            &state.meta.trace_t,
            &payload_hash,
            &metrics_str,
            &state.nonce,
            state.timestamp,
            state.meta.total_op_count,
        );
        let integrity_seal = sha256_hex(anchor.as_bytes());

        Ok(Envelope {
            version: ENVELOPE_VERSION.to_string(),
            header: EnvelopeHeader {
                trace_t: state.meta.trace_t.clone(),
                integrity_seal,
                nonce: state.nonce.clone(),
                timestamp: state.timestamp,
                ops: state.meta.total_op_count,
            },
            body: EnvelopeBody { payload: state.payload.clone(), metrics: extra_metrics },
        })
    }

    /// Phase 1 envelope integrity: recompute `integrity_seal` from
    /// header+body and compare in constant time.
    #[tracing::instrument(skip(envelope))]
    pub fn verify(envelope: &Envelope) -> Result<bool, SealError> {
        let payload_hash = canonical_payload_hash(&envelope.body.payload)?;
        let metrics_str = canonical_metrics_string(envelope.body.metrics.as_ref())?;

        let anchor = anchor_string(
            &envelope.header.trace_t,
            &payload_hash,
            &metrics_str,
            &envelope.header.nonce,
            envelope.header.timestamp,
            envelope.header.ops,
        );
        let recomputed = sha256_hex(anchor.as_bytes());

        Ok(constant_time_eq(recomputed.as_bytes(), envelope.header.integrity_seal.as_bytes()))
    }
}

fn anchor_string(
    trace_t: &str,
    payload_hash: &str,
    metrics_str: &str,
    nonce: &str,
    timestamp: f64,
    ops: u64,
) -> String {
    format!("{trace_t}|{payload_hash}|{metrics_str}|{nonce}|{timestamp}|{ops}")
}

fn canonical_payload_hash(payload: &Value) -> Result<String, SealError> {
    let canonical = canonicalize(payload)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Missing metrics serialise as the literal `"{}"`; present metrics
/// serialise with sorted object keys so two equal maps always hash
/// identically regardless of construction order.
fn canonical_metrics_string(metrics: Option<&Value>) -> Result<String, SealError> {
    match metrics {
        None => Ok("{}".to_string()),
        Some(value) => canonicalize(value),
    }
}

/// Sorted-key JSON if `value` is an object; the raw string form otherwise.
fn canonicalize(value: &Value) -> Result<String, SealError> {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<&String, &Value> = map.iter().collect();
            Ok(serde_json::to_string(&sorted)?)
        }
        Value::String(s) => Ok(s.clone()),
        other => Ok(other.to_string()),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fixed-time byte comparison. Both inputs here are always 64-byte hex
/// digests, so there is no need for a general-purpose `subtle`-style crate
/// — a simple bitwise-or accumulator over equal-length slices suffices.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn random_nonce_hex() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn unix_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + now.timestamp_subsec_nanos() as f64 / 1e9
}

/// Decimal string form of a trace `T`, the shape every envelope and
/// snapshot block field uses on the wire.
pub fn trace_t_string(t: &Int) -> String {
    t.to_string()
}
