//! Agent-to-agent messaging within a workflow.
//!
//! Bounded FIFO queues per `(workflow, agent)` with message TTL, drop-oldest
//! overflow, broadcast fan-out, and long-poll delivery. Ordering is FIFO per
//! queue; nothing is promised across agents. All state is in-memory and dies
//! with the process.

mod bus;

pub use bus::{
    AgentQueueStats, Message, MessageBus, MessagingConfig, PostOutcome, WorkflowQueueStats,
};
