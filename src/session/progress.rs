//! Progress event types and callback interface.
//!
//! Defines the events emitted by the orchestrator as a session moves
//! through its phases, and the callback trait for receiving them.

use crate::session::model::{SessionStatus, TestPhase};

/// Progress events emitted during session execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// The session entered a new phase
    PhaseChange {
        session_id: String,
        phase: TestPhase,
        /// Milestone percentage for the phase
        progress: u8,
    },
    /// A probe failed and a sentinel or simulated value was substituted
    PhaseDegraded {
        session_id: String,
        phase: TestPhase,
        message: String,
    },
    /// The session reached a terminal status
    Finished { session_id: String, status: SessionStatus },
}

/// Callback interface for progress updates.
///
/// Implementations must be non-blocking to avoid affecting
/// measurement accuracy.
pub trait ProgressCallback: Send + Sync {
    /// Called when a progress event occurs.
    fn on_progress(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressCallback for NoopProgress {
    fn on_progress(&self, _event: ProgressEvent) {}
}
