//! Workflow affinity state.
//!
//! A workflow groups related requests (typically a multi-agent job) onto one
//! engine so they share KV-cache locality. The manager owns the full
//! lifecycle: creation on first sight, TTL expiry, LRU eviction beyond the
//! configured limit, endpoint binding, and the per-workflow counters that
//! feed metrics.

mod manager;

pub use manager::{
    EvictionListener, WorkflowConfig, WorkflowManager, WorkflowStatus,
};
