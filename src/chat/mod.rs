//! Chat-time behaviors — workflow arbitration and utterance routing.

pub mod arbiter;
pub mod router;

pub use arbiter::{WorkflowArbiter, WorkflowKind};
pub use router::{ChatReply, ChatRouter};
