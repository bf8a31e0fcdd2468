//! Runtime metrics.
//!
//! Counters for the connect/call pipeline and gauges for live resources,
//! exposed via metriken for Prometheus-style scraping by the embedder.

use metriken::{metric, Counter, Gauge};

// ── Connect pipeline ─────────────────────────────────────────────

#[metric(
    name = "chainline/connects/initiated",
    description = "Connect sequences initiated"
)]
pub static CONNECTS_INITIATED: Counter = Counter::new();

#[metric(
    name = "chainline/connects/established",
    description = "Connections that reached Connected"
)]
pub static CONNECTS_ESTABLISHED: Counter = Counter::new();

#[metric(
    name = "chainline/connects/failed",
    description = "Connect sequences that failed"
)]
pub static CONNECTS_FAILED: Counter = Counter::new();

// ── Calls ────────────────────────────────────────────────────────

#[metric(
    name = "chainline/calls/dispatched",
    description = "Calls handed to the transport"
)]
pub static CALLS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "chainline/calls/completed",
    description = "Calls that resolved successfully"
)]
pub static CALLS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "chainline/calls/failed",
    description = "Calls that failed with a transport status"
)]
pub static CALLS_FAILED: Counter = Counter::new();

// ── Ops ──────────────────────────────────────────────────────────

#[metric(
    name = "chainline/ops/cancelled",
    description = "Pending ops cancelled by arena teardown"
)]
pub static OPS_CANCELLED: Counter = Counter::new();

#[metric(
    name = "chainline/completions/stale_dropped",
    description = "Transport completions dropped after cancellation"
)]
pub static STALE_COMPLETIONS_DROPPED: Counter = Counter::new();

// ── Live resources ───────────────────────────────────────────────

#[metric(
    name = "chainline/arena/blocks_live",
    description = "Currently live arena blocks"
)]
pub static ARENA_BLOCKS_LIVE: Gauge = Gauge::new();

#[metric(
    name = "chainline/connections/active",
    description = "Connections currently connecting or connected"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();
