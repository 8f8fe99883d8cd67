//! Session records and the configuration they run with.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::NetgaugeError;

/// Which measurement phases a session runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestType {
    DownloadOnly,
    UploadOnly,
    LatencyOnly,
    #[default]
    Full,
}

impl TestType {
    /// Whether this test type runs the given measurement phase.
    pub fn includes(&self, phase: TestPhase) -> bool {
        match phase {
            TestPhase::LatencyTest => {
                matches!(self, TestType::LatencyOnly | TestType::Full)
            }
            TestPhase::DownloadTest => {
                matches!(self, TestType::DownloadOnly | TestType::Full)
            }
            TestPhase::UploadTest => {
                matches!(self, TestType::UploadOnly | TestType::Full)
            }
            TestPhase::Initialization
            | TestPhase::Analysis
            | TestPhase::Completed => true,
        }
    }

    /// Phases in execution order, skipping the ones this type does not run.
    pub fn phases(&self) -> Vec<TestPhase> {
        TestPhase::ALL.into_iter().filter(|phase| self.includes(*phase)).collect()
    }
}

/// Parameters of a measurement session.
///
/// A running session holds its own copy; there is no way to change it
/// after `start_session`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestConfiguration {
    pub test_type: TestType,
    /// Length of each throughput run, 5 to 60 seconds.
    pub duration_seconds: u32,
    /// Runs per throughput phase, 1 to 10.
    pub number_of_runs: u32,
    /// Advisory only; runs are sequential.
    pub concurrent_connections: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_file_size_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_server_id: Option<String>,
}

impl TestConfiguration {
    pub const MIN_DURATION_SECONDS: u32 = 5;
    pub const MAX_DURATION_SECONDS: u32 = 60;
    pub const MIN_RUNS: u32 = 1;
    pub const MAX_RUNS: u32 = 10;

    pub fn new(test_type: TestType, duration_seconds: u32, number_of_runs: u32) -> Self {
        Self { test_type, duration_seconds, number_of_runs, ..Default::default() }
    }

    /// Reject out-of-range settings before a session is created.
    pub fn validate(&self) -> Result<(), NetgaugeError> {
        if !(Self::MIN_DURATION_SECONDS..=Self::MAX_DURATION_SECONDS)
            .contains(&self.duration_seconds)
        {
            return Err(NetgaugeError::config(format!(
                "duration must be between {} and {} seconds, got {}",
                Self::MIN_DURATION_SECONDS,
                Self::MAX_DURATION_SECONDS,
                self.duration_seconds
            )));
        }

        if !(Self::MIN_RUNS..=Self::MAX_RUNS).contains(&self.number_of_runs) {
            return Err(NetgaugeError::config(format!(
                "number of runs must be between {} and {}, got {}",
                Self::MIN_RUNS,
                Self::MAX_RUNS,
                self.number_of_runs
            )));
        }

        if let Some(size) = self.test_file_size_mb {
            if !(size.is_finite() && size > 0.0) {
                return Err(NetgaugeError::config(format!(
                    "test file size must be a positive number of MB, got {}",
                    size
                )));
            }
        }

        Ok(())
    }
}

impl Default for TestConfiguration {
    fn default() -> Self {
        Self {
            test_type: TestType::Full,
            duration_seconds: 10,
            number_of_runs: 3,
            concurrent_connections: 4,
            test_file_size_mb: None,
            preferred_server_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Initializing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Sub-phase of a running session. Ordering follows execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestPhase {
    Initialization,
    LatencyTest,
    DownloadTest,
    UploadTest,
    Analysis,
    Completed,
}

impl TestPhase {
    pub const ALL: [TestPhase; 6] = [
        TestPhase::Initialization,
        TestPhase::LatencyTest,
        TestPhase::DownloadTest,
        TestPhase::UploadTest,
        TestPhase::Analysis,
        TestPhase::Completed,
    ];

    /// Fixed progress milestone reported on entering this phase.
    pub fn progress(&self) -> u8 {
        match self {
            TestPhase::Initialization => 0,
            TestPhase::LatencyTest => 10,
            TestPhase::DownloadTest => 40,
            TestPhase::UploadTest => 70,
            TestPhase::Analysis => 90,
            TestPhase::Completed => 100,
        }
    }
}

/// Caller identity for the one-active-session-per-user rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: Option<String>,
}

impl UserContext {
    pub const ANONYMOUS_ID: &'static str = "anonymous";

    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn identified(user_id: impl Into<String>) -> Self {
        Self { user_id: Some(user_id.into()) }
    }

    /// The caller's id, or `None` for anonymous callers.
    pub fn identity(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|id| *id != Self::ANONYMOUS_ID)
    }

    pub fn is_anonymous(&self) -> bool {
        self.identity().is_none()
    }
}

/// Snapshot of a session's lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: SessionStatus,
    pub phase: TestPhase,
    pub progress_percentage: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub config: TestConfiguration,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        id: String,
        user: &UserContext,
        config: TestConfiguration,
    ) -> Self {
        Self {
            id,
            user_id: user.identity().map(str::to_string),
            status: SessionStatus::Initializing,
            phase: TestPhase::Initialization,
            progress_percentage: TestPhase::Initialization.progress(),
            error_message: None,
            config,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Move to the next phase. Phases never go backwards and progress
    /// never decreases; a request to revisit a phase is ignored.
    pub fn advance(&mut self, phase: TestPhase) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        if phase <= self.phase && self.status == SessionStatus::Running {
            return false;
        }

        self.status = SessionStatus::Running;
        self.phase = phase.max(self.phase);
        self.progress_percentage =
            self.progress_percentage.max(self.phase.progress());
        true
    }

    pub fn complete(&mut self) {
        self.advance(TestPhase::Completed);
        self.status = SessionStatus::Completed;
        self.ended_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = SessionStatus::Failed;
        self.error_message = Some(message.into());
        self.ended_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = SessionStatus::Cancelled;
        self.ended_at = Some(Utc::now());
    }
}
