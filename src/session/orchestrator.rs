//! The session state machine.
//!
//! A session runs in its own tokio task. The task owns the only in-process
//! copy of the [`Session`] and publishes each transition to the
//! [`SessionStore`] with a compare-and-swap on the status, so an external
//! [`SessionOrchestrator::cancel_session`] is observed at the next
//! transition without either side holding a lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::EngineConfig;
use crate::errors::NetgaugeError;
use crate::probes::throughput::simulate;
use crate::probes::{
    Direction, DownloadProbe, LatencyProbe, ThroughputProbe, UploadProbe,
};
use crate::results::{
    LatencyMetrics, MeasurementType, RawMeasurement, ResultSummary,
    SpeedMetrics, SpeedTestResult,
};
use crate::session::model::{
    Session, SessionStatus, TestConfiguration, TestPhase, UserContext,
};
use crate::session::progress::{NoopProgress, ProgressCallback, ProgressEvent};
use crate::session::store::SessionStore;
use crate::stats;
use crate::validation::ResultValidator;

/// What a caller polling a session sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatusReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub phase: TestPhase,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Present once the session has completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<ResultSummary>,
}

/// Runs measurement sessions in the background and answers queries about
/// them.
///
/// Cloning is cheap; clones share the store, the probes and the admission
/// limit.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use netgauge::config::EngineConfig;
/// use netgauge::session::{
///     InMemorySessionStore, SessionOrchestrator, TestConfiguration,
///     UserContext,
/// };
///
/// #[tokio::main]
/// async fn main() {
///     let orchestrator = SessionOrchestrator::new(
///         EngineConfig::default(),
///         Arc::new(InMemorySessionStore::new()),
///     )
///     .unwrap();
///     let id = orchestrator
///         .start_session(TestConfiguration::default(), &UserContext::anonymous())
///         .await
///         .unwrap();
///     let result = orchestrator.get_result(&id).await;
///     println!("{:?}", result.is_ok());
/// }
/// ```
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn SessionStore>,
    download: DownloadProbe,
    upload: UploadProbe,
    latency: LatencyProbe,
    latency_host: String,
    latency_port: u16,
    validator: ResultValidator,
    permits: Semaphore,
    progress: Arc<dyn ProgressCallback>,
    simulation_time_scale: f64,
}

/// Metrics and samples collected while a session runs.
#[derive(Default)]
struct Collected {
    download: Option<SpeedMetrics>,
    upload: Option<SpeedMetrics>,
    latency: Option<LatencyMetrics>,
    measurements: Vec<RawMeasurement>,
}

fn new_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

impl SessionOrchestrator {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self, NetgaugeError> {
        Self::with_progress(config, store, Arc::new(NoopProgress))
    }

    /// Like [`SessionOrchestrator::new`], reporting progress to `progress`.
    pub fn with_progress(
        config: EngineConfig,
        store: Arc<dyn SessionStore>,
        progress: Arc<dyn ProgressCallback>,
    ) -> Result<Self, NetgaugeError> {
        config.validate()?;

        let inner = Inner {
            store,
            download: DownloadProbe::new(
                config.download_endpoint,
                config.throttle.clone(),
            ),
            upload: UploadProbe::new(config.upload_endpoint, config.throttle)
                .with_simulation_time_scale(config.simulation_time_scale),
            latency: LatencyProbe::new(config.latency),
            latency_host: config.latency_host,
            latency_port: config.latency_port,
            validator: ResultValidator::new(config.validation),
            permits: Semaphore::new(config.max_concurrent_sessions),
            progress,
            simulation_time_scale: config.simulation_time_scale,
        };

        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    /// Create a session and start it in the background.
    ///
    /// Returns the new session id. Identified users may have only one
    /// active session; anonymous callers are not limited.
    pub async fn start_session(
        &self,
        config: TestConfiguration,
        user: &UserContext,
    ) -> Result<String, NetgaugeError> {
        config.validate()?;

        if let Some(user_id) = user.identity() {
            let active = self.inner.store.active_sessions_for_user(user_id).await?;
            if !active.is_empty() {
                return Err(NetgaugeError::session(format!(
                    "user {} already has an active session",
                    user_id
                ))
                .with_suggestion(
                    "Wait for the running session to finish or cancel it.",
                ));
            }
        }

        let session = Session::new(new_id(), user, config);
        let id = session.id.clone();
        self.inner.store.create_session(session.clone()).await?;

        info!(
            "Started session {} ({:?}, {} run(s) of {}s)",
            id,
            session.config.test_type,
            session.config.number_of_runs,
            session.config.duration_seconds
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_session(session).await });

        Ok(id)
    }

    pub async fn get_session_status(
        &self,
        id: &str,
    ) -> Result<SessionStatusReport, NetgaugeError> {
        let session = self.inner.load(id).await?;

        let result_summary = if session.status == SessionStatus::Completed {
            self.inner.store.get_result(id).await?.map(|r| r.summary())
        } else {
            None
        };

        Ok(SessionStatusReport {
            session_id: session.id,
            status: session.status,
            phase: session.phase,
            progress: session.progress_percentage,
            error_message: session.error_message,
            result_summary,
        })
    }

    /// The result of a completed session.
    pub async fn get_result(
        &self,
        id: &str,
    ) -> Result<SpeedTestResult, NetgaugeError> {
        let session = self.inner.load(id).await?;

        if session.status != SessionStatus::Completed {
            return Err(NetgaugeError::session(format!(
                "session {} has not completed (status {:?})",
                id, session.status
            )));
        }

        self.inner.store.get_result(id).await?.ok_or_else(|| {
            NetgaugeError::session(format!(
                "session {} completed without a result",
                id
            ))
        })
    }

    /// Move a session that has not finished to CANCELLED.
    ///
    /// Returns `false` if the session had already reached a terminal
    /// status. The running task stops at its next transition.
    pub async fn cancel_session(&self, id: &str) -> Result<bool, NetgaugeError> {
        loop {
            let session = self.inner.load(id).await?;
            if session.status.is_terminal() {
                return Ok(false);
            }

            let expected = session.status;
            let mut next = session;
            next.cancel();

            if self.inner.store.update_session(expected, next).await? {
                info!("Cancelled session {}", id);
                return Ok(true);
            }
        }
    }

    /// Poll until the session reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        id: &str,
        poll_interval: Duration,
    ) -> Result<Session, NetgaugeError> {
        loop {
            let session = self.inner.load(id).await?;
            if session.status.is_terminal() {
                return Ok(session);
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl Inner {
    async fn load(&self, id: &str) -> Result<Session, NetgaugeError> {
        self.store.get_session(id).await?.ok_or_else(|| {
            NetgaugeError::session(format!("session {} not found", id))
        })
    }

    async fn run_session(&self, session: Session) {
        let id = session.id.clone();

        let status = match self.permits.acquire().await {
            Ok(_permit) => match self.execute(session).await {
                Ok(status) => status,
                Err(e) => self.mark_failed(&id, &e).await,
            },
            Err(_) => {
                let e = NetgaugeError::session("session admission closed");
                self.mark_failed(&id, &e).await
            }
        };

        info!("Session {} finished: {:?}", id, status);
        self.progress
            .on_progress(ProgressEvent::Finished { session_id: id, status });
    }

    /// Run every phase the test type selects. Returns the terminal status.
    async fn execute(
        &self,
        mut session: Session,
    ) -> Result<SessionStatus, NetgaugeError> {
        let config = session.config.clone();
        let test_type = config.test_type;
        let mut collected = Collected::default();

        if test_type.includes(TestPhase::LatencyTest) {
            if !self.enter(&mut session, TestPhase::LatencyTest).await? {
                return Ok(SessionStatus::Cancelled);
            }
            self.latency_phase(&session, &config, &mut collected).await;
        }

        if test_type.includes(TestPhase::DownloadTest) {
            if !self.enter(&mut session, TestPhase::DownloadTest).await? {
                return Ok(SessionStatus::Cancelled);
            }
            self.download_phase(&session, &config, &mut collected).await;
        }

        if test_type.includes(TestPhase::UploadTest) {
            if !self.enter(&mut session, TestPhase::UploadTest).await? {
                return Ok(SessionStatus::Cancelled);
            }
            self.upload_phase(&session, &config, &mut collected).await;
        }

        if !self.enter(&mut session, TestPhase::Analysis).await? {
            return Ok(SessionStatus::Cancelled);
        }
        let result = self.analyze(&session, config, collected);
        self.store.create_result(result).await?;

        // The result goes in first so COMPLETED is never visible without
        // one; a commit that loses takes it back out.
        let mut next = session.clone();
        next.complete();
        let committed = self.commit(&mut session, next).await;
        if !matches!(committed, Ok(true)) {
            self.discard_result(&session.id).await;
        }
        if !committed? {
            return Ok(SessionStatus::Cancelled);
        }
        self.emit_phase(&session);

        Ok(SessionStatus::Completed)
    }

    async fn latency_phase(
        &self,
        session: &Session,
        config: &TestConfiguration,
        collected: &mut Collected,
    ) {
        let metrics =
            self.latency.measure(&self.latency_host, self.latency_port).await;

        if metrics.is_failed() {
            self.degraded(
                session,
                format!(
                    "latency probe to {}:{} failed, reporting ping -1",
                    self.latency_host, self.latency_port
                ),
            );
        } else {
            collected.measurements.extend(
                self.latency
                    .sample(
                        &self.latency_host,
                        self.latency_port,
                        config.number_of_runs,
                    )
                    .await,
            );
            collected.measurements.push(RawMeasurement::new(
                1,
                MeasurementType::Jitter,
                metrics.jitter_ms,
            ));
            collected.measurements.push(RawMeasurement::new(
                1,
                MeasurementType::PacketLoss,
                metrics.packet_loss_percent,
            ));
        }

        collected.latency = Some(metrics);
    }

    async fn download_phase(
        &self,
        session: &Session,
        config: &TestConfiguration,
        collected: &mut Collected,
    ) {
        let report = match self.download.measure(config).await {
            Ok(report) => report,
            Err(e) => {
                self.degraded(
                    session,
                    format!(
                        "download probe failed ({}), using a simulated estimate",
                        e.message
                    ),
                );
                simulate(Direction::Download, config, self.simulation_time_scale)
                    .await
            }
        };

        collected.measurements.extend(report.measurements);
        collected.download = Some(report.metrics);
    }

    async fn upload_phase(
        &self,
        session: &Session,
        config: &TestConfiguration,
        collected: &mut Collected,
    ) {
        let report = self.upload.run_or_simulate(config).await;

        if report.metrics.is_simulated() {
            self.degraded(
                session,
                "upload probe failed, using a simulated estimate".to_string(),
            );
        }

        collected.measurements.extend(report.measurements);
        collected.upload = Some(report.metrics);
    }

    fn analyze(
        &self,
        session: &Session,
        config: TestConfiguration,
        collected: Collected,
    ) -> SpeedTestResult {
        let statistical_summary = stats::summarize(&collected.measurements);
        let validation = self.validator.validate(
            collected.download.as_ref(),
            collected.upload.as_ref(),
            collected.latency.as_ref(),
        );

        debug!(
            "Session {}: {} raw measurement(s), valid: {}",
            session.id,
            collected.measurements.len(),
            validation.valid
        );

        SpeedTestResult {
            id: new_id(),
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            created_at: Utc::now(),
            config,
            download_metrics: collected.download,
            upload_metrics: collected.upload,
            latency_metrics: collected.latency,
            statistical_summary,
            raw_measurements: collected.measurements,
            validation,
        }
    }

    /// Advance to `phase` and publish it. Returns `false` if the session
    /// was cancelled.
    async fn enter(
        &self,
        session: &mut Session,
        phase: TestPhase,
    ) -> Result<bool, NetgaugeError> {
        let mut next = session.clone();
        next.advance(phase);

        if !self.commit(session, next).await? {
            return Ok(false);
        }

        info!(
            "Session {}: {:?} ({}%)",
            session.id, session.phase, session.progress_percentage
        );
        self.emit_phase(session);
        Ok(true)
    }

    /// Publish `next` if the stored status still matches ours.
    ///
    /// Losing the race to a cancellation returns `Ok(false)`; any other
    /// lost race or a missing record is a bookkeeping failure.
    async fn commit(
        &self,
        session: &mut Session,
        next: Session,
    ) -> Result<bool, NetgaugeError> {
        if self.store.update_session(session.status, next.clone()).await? {
            *session = next;
            return Ok(true);
        }

        match self.store.get_session(&session.id).await? {
            Some(current) if current.status == SessionStatus::Cancelled => {
                debug!("Session {} was cancelled externally", session.id);
                Ok(false)
            }
            Some(current) => Err(NetgaugeError::session(format!(
                "session {} changed to {:?} while running",
                session.id, current.status
            ))),
            None => Err(NetgaugeError::session(format!(
                "session {} disappeared while running",
                session.id
            ))),
        }
    }

    async fn discard_result(&self, id: &str) {
        match self.store.delete_result(id).await {
            Ok(true) => debug!("Discarded result of session {}", id),
            Ok(false) => {}
            Err(e) => warn!("Could not discard result of session {}: {}", id, e.message),
        }
    }

    async fn mark_failed(&self, id: &str, e: &NetgaugeError) -> SessionStatus {
        error!("Session {} failed: {}", id, e.message);

        let current = match self.store.get_session(id).await {
            Ok(Some(current)) => current,
            Ok(None) => return SessionStatus::Failed,
            Err(e) => {
                warn!("Could not record failure of session {}: {}", id, e.message);
                return SessionStatus::Failed;
            }
        };

        if current.status.is_terminal() {
            return current.status;
        }

        let expected = current.status;
        let mut next = current;
        next.fail(e.message.clone());

        match self.store.update_session(expected, next).await {
            Ok(true) => SessionStatus::Failed,
            Ok(false) => match self.store.get_session(id).await {
                Ok(Some(current)) => current.status,
                _ => SessionStatus::Failed,
            },
            Err(e) => {
                warn!("Could not record failure of session {}: {}", id, e.message);
                SessionStatus::Failed
            }
        }
    }

    fn emit_phase(&self, session: &Session) {
        self.progress.on_progress(ProgressEvent::PhaseChange {
            session_id: session.id.clone(),
            phase: session.phase,
            progress: session.progress_percentage,
        });
    }

    fn degraded(&self, session: &Session, message: String) {
        warn!("Session {}: {}", session.id, message);
        self.progress.on_progress(ProgressEvent::PhaseDegraded {
            session_id: session.id.clone(),
            phase: session.phase,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::probes::Endpoint;
    use crate::session::model::TestType;
    use crate::session::store::InMemorySessionStore;
    use futures::future::BoxFuture;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressCallback for Recorder {
        fn on_progress(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Recorder {
        /// The store reports completion slightly before the task emits its
        /// last events.
        async fn wait_finished(&self) {
            for _ in 0..100 {
                let finished = self
                    .events
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|e| matches!(e, ProgressEvent::Finished { .. }));
                if finished {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("session never emitted Finished");
        }
    }

    /// An engine pointed at a port nothing listens on, so every probe
    /// fails fast and the throughput phases fall back to simulation.
    fn unreachable_config() -> EngineConfig {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::new("127.0.0.1", port);
        let mut config = EngineConfig {
            download_endpoint: endpoint.clone(),
            upload_endpoint: endpoint,
            latency_port: port,
            simulation_time_scale: 0.0,
            ..EngineConfig::default()
        };
        config.latency.ping_count = 2;
        config.latency.ping_interval = Duration::from_millis(1);
        config
    }

    fn orchestrator_with(recorder: Arc<Recorder>) -> SessionOrchestrator {
        SessionOrchestrator::with_progress(
            unreachable_config(),
            Arc::new(InMemorySessionStore::new()),
            recorder,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_session_rejects_bad_config() {
        let orchestrator = orchestrator_with(Arc::default());
        let config = TestConfiguration::new(TestType::Full, 4, 3);

        let error = orchestrator
            .start_session(config, &UserContext::anonymous())
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_degraded_session_still_completes() {
        let recorder = Arc::new(Recorder::default());
        let orchestrator = orchestrator_with(Arc::clone(&recorder));
        let config = TestConfiguration::new(TestType::Full, 5, 2);

        let id = orchestrator
            .start_session(config, &UserContext::anonymous())
            .await
            .unwrap();
        let session = orchestrator
            .wait_for_completion(&id, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.progress_percentage, 100);

        let result = orchestrator.get_result(&id).await.unwrap();
        assert!(result.latency_metrics.as_ref().unwrap().is_failed());
        assert!(result.download_metrics.as_ref().unwrap().is_simulated());
        assert!(result.upload_metrics.as_ref().unwrap().is_simulated());
        assert!(result.statistical_summary.download_stats.is_some());
        assert!(result.statistical_summary.latency_stats.is_none());
        // The failed latency probe marks the result invalid.
        assert!(!result.validation.valid);

        let events = recorder.events.lock().unwrap();
        let degraded = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::PhaseDegraded { .. }))
            .count();
        assert_eq!(degraded, 3);
    }

    #[tokio::test]
    async fn test_skipped_phases_are_not_entered() {
        let recorder = Arc::new(Recorder::default());
        let orchestrator = orchestrator_with(Arc::clone(&recorder));
        let config = TestConfiguration::new(TestType::DownloadOnly, 5, 1);

        let id = orchestrator
            .start_session(config, &UserContext::anonymous())
            .await
            .unwrap();
        orchestrator
            .wait_for_completion(&id, Duration::from_millis(10))
            .await
            .unwrap();
        recorder.wait_finished().await;

        let phases: Vec<TestPhase> = recorder
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::PhaseChange { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![TestPhase::DownloadTest, TestPhase::Analysis, TestPhase::Completed]
        );

        let report = orchestrator.get_session_status(&id).await.unwrap();
        let summary = report.result_summary.unwrap();
        assert!(summary.download_mbps.is_some());
        assert!(summary.upload_mbps.is_none());
        assert!(summary.ping_ms.is_none());
    }

    /// Cancels each session the moment its result is written, so the
    /// COMPLETED commit always loses.
    #[derive(Default)]
    struct CancelAfterResult {
        inner: InMemorySessionStore,
    }

    impl SessionStore for CancelAfterResult {
        fn create_session(
            &self,
            session: Session,
        ) -> BoxFuture<'_, Result<(), NetgaugeError>> {
            self.inner.create_session(session)
        }

        fn get_session(
            &self,
            id: &str,
        ) -> BoxFuture<'_, Result<Option<Session>, NetgaugeError>> {
            self.inner.get_session(id)
        }

        fn update_session(
            &self,
            expected_status: SessionStatus,
            session: Session,
        ) -> BoxFuture<'_, Result<bool, NetgaugeError>> {
            self.inner.update_session(expected_status, session)
        }

        fn active_sessions_for_user(
            &self,
            user_id: &str,
        ) -> BoxFuture<'_, Result<Vec<Session>, NetgaugeError>> {
            self.inner.active_sessions_for_user(user_id)
        }

        fn create_result(
            &self,
            result: SpeedTestResult,
        ) -> BoxFuture<'_, Result<(), NetgaugeError>> {
            Box::pin(async move {
                let id = result.session_id.clone();
                self.inner.create_result(result).await?;

                let current = self.inner.get_session(&id).await?.unwrap();
                let expected = current.status;
                let mut cancelled = current;
                cancelled.cancel();
                assert!(self.inner.update_session(expected, cancelled).await?);
                Ok(())
            })
        }

        fn get_result(
            &self,
            session_id: &str,
        ) -> BoxFuture<'_, Result<Option<SpeedTestResult>, NetgaugeError>> {
            self.inner.get_result(session_id)
        }

        fn delete_result(
            &self,
            session_id: &str,
        ) -> BoxFuture<'_, Result<bool, NetgaugeError>> {
            self.inner.delete_result(session_id)
        }
    }

    #[tokio::test]
    async fn test_cancel_before_completion_leaves_no_result() {
        let recorder = Arc::new(Recorder::default());
        let store = Arc::new(CancelAfterResult::default());
        let orchestrator = SessionOrchestrator::with_progress(
            unreachable_config(),
            Arc::clone(&store) as Arc<dyn SessionStore>,
            Arc::clone(&recorder) as Arc<dyn ProgressCallback>,
        )
        .unwrap();
        let config = TestConfiguration::new(TestType::LatencyOnly, 5, 1);

        let id = orchestrator
            .start_session(config, &UserContext::anonymous())
            .await
            .unwrap();
        recorder.wait_finished().await;

        let report = orchestrator.get_session_status(&id).await.unwrap();
        assert_eq!(report.status, SessionStatus::Cancelled);
        assert!(report.result_summary.is_none());
        assert!(store.get_result(&id).await.unwrap().is_none());
        assert!(matches!(
            recorder.events.lock().unwrap().last(),
            Some(ProgressEvent::Finished { status: SessionStatus::Cancelled, .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let orchestrator = orchestrator_with(Arc::default());
        let error = orchestrator.get_session_status("missing").await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Session);
        assert!(orchestrator.cancel_session("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_mark_failed_records_message() {
        let orchestrator = orchestrator_with(Arc::default());
        let session = Session::new(
            "s-1".to_string(),
            &UserContext::identified("alice"),
            TestConfiguration::default(),
        );
        orchestrator.store().create_session(session).await.unwrap();

        let status = orchestrator
            .inner
            .mark_failed("s-1", &NetgaugeError::session("record unreadable"))
            .await;
        assert_eq!(status, SessionStatus::Failed);

        let report = orchestrator.get_session_status("s-1").await.unwrap();
        assert_eq!(report.status, SessionStatus::Failed);
        assert_eq!(report.error_message.as_deref(), Some("record unreadable"));
        assert!(orchestrator.get_result("s-1").await.is_err());
    }
}
