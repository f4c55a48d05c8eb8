//! Orchestration layer: the approval and outreach state machines, the
//! gap-fill orchestrator, the task scheduler, and the event publisher.
//!
//! Webhooks and sweepers drive the state machines through pure forward
//! transitions on the stored documents; the orchestrator ties detection,
//! decision, dispatch, and attribution together.

mod approvals;
mod events;
mod gap_fill;
mod messaging;
mod outreach;
mod scheduler;

pub use approvals::{ApprovalService, ApprovalStats};
pub use events::{BroadcastPublisher, EventPublisher};
pub use gap_fill::{
    fill_priority, BookingRef, BookingService, GapFillOrchestrator, GapFillReport, ScoredCandidate,
    GAP_FILL_AGENT,
};
pub use messaging::{HttpMessenger, MessageProvider, ProviderAck, SendError};
pub use outreach::{
    CreateOutreach, OutreachDenied, OutreachError, OutreachService, OutreachStats, ProviderStatus,
};
pub use scheduler::{
    CleanupKind, MemoryTaskQueue, QueueError, QueueTask, TaskQueue, TaskScheduler,
};
