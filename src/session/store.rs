//! Persistence seam for sessions and results.
//!
//! The orchestrator never holds a lock across phases. It publishes
//! snapshots through [`SessionStore::update_session`], which only succeeds
//! while the stored status still matches the status the writer last saw.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::errors::NetgaugeError;
use crate::results::SpeedTestResult;
use crate::session::model::{Session, SessionStatus};

pub trait SessionStore: Send + Sync {
    /// Insert a new session. Sessions with a user id are rejected while
    /// that user has another active session; the check and the insert are
    /// atomic.
    fn create_session(
        &self,
        session: Session,
    ) -> BoxFuture<'_, Result<(), NetgaugeError>>;

    fn get_session(
        &self,
        id: &str,
    ) -> BoxFuture<'_, Result<Option<Session>, NetgaugeError>>;

    /// Replace a session if its stored status equals `expected_status`.
    /// Returns `Ok(false)` when another writer changed the status first.
    fn update_session(
        &self,
        expected_status: SessionStatus,
        session: Session,
    ) -> BoxFuture<'_, Result<bool, NetgaugeError>>;

    fn active_sessions_for_user(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, Result<Vec<Session>, NetgaugeError>>;

    /// Store a result. A session's result can be written only once.
    fn create_result(
        &self,
        result: SpeedTestResult,
    ) -> BoxFuture<'_, Result<(), NetgaugeError>>;

    /// The result written for a session, if any.
    fn get_result(
        &self,
        session_id: &str,
    ) -> BoxFuture<'_, Result<Option<SpeedTestResult>, NetgaugeError>>;

    /// Drop a result whose session never reached COMPLETED. Returns whether
    /// one was stored.
    fn delete_result(
        &self,
        session_id: &str,
    ) -> BoxFuture<'_, Result<bool, NetgaugeError>>;
}

#[derive(Default)]
struct Records {
    sessions: HashMap<String, Session>,
    results: HashMap<String, SpeedTestResult>,
}

/// A [`SessionStore`] kept in process memory.
#[derive(Default)]
pub struct InMemorySessionStore {
    records: Mutex<Records>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, Records>, NetgaugeError> {
        self.records
            .lock()
            .map_err(|_| NetgaugeError::session("session store lock poisoned"))
    }

    /// Active sessions that started before `cutoff`.
    ///
    /// Used by an external sweeper to find sessions whose task died without
    /// reaching a terminal state.
    pub fn stale_active_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>, NetgaugeError> {
        let records = self.records()?;

        Ok(records
            .sessions
            .values()
            .filter(|s| s.status.is_active() && s.started_at < cutoff)
            .cloned()
            .collect())
    }

    pub fn remove_session(&self, id: &str) -> Result<Option<Session>, NetgaugeError> {
        Ok(self.records()?.sessions.remove(id))
    }
}

impl SessionStore for InMemorySessionStore {
    fn create_session(
        &self,
        session: Session,
    ) -> BoxFuture<'_, Result<(), NetgaugeError>> {
        Box::pin(async move {
            let mut records = self.records()?;

            if records.sessions.contains_key(&session.id) {
                return Err(NetgaugeError::session(format!(
                    "session {} already exists",
                    session.id
                )));
            }

            if let Some(user_id) = session.user_id.as_deref() {
                let busy = records.sessions.values().any(|s| {
                    s.user_id.as_deref() == Some(user_id) && s.status.is_active()
                });
                if busy {
                    return Err(NetgaugeError::session(format!(
                        "user {} already has an active session",
                        user_id
                    ))
                    .with_suggestion(
                        "Wait for the running session to finish or cancel it.",
                    ));
                }
            }

            records.sessions.insert(session.id.clone(), session);
            Ok(())
        })
    }

    fn get_session(
        &self,
        id: &str,
    ) -> BoxFuture<'_, Result<Option<Session>, NetgaugeError>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.records()?.sessions.get(&id).cloned()) })
    }

    fn update_session(
        &self,
        expected_status: SessionStatus,
        session: Session,
    ) -> BoxFuture<'_, Result<bool, NetgaugeError>> {
        Box::pin(async move {
            let mut records = self.records()?;

            let stored = records.sessions.get_mut(&session.id).ok_or_else(|| {
                NetgaugeError::session(format!(
                    "session {} not found",
                    session.id
                ))
            })?;

            if stored.status != expected_status {
                return Ok(false);
            }

            *stored = session;
            Ok(true)
        })
    }

    fn active_sessions_for_user(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, Result<Vec<Session>, NetgaugeError>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let records = self.records()?;

            Ok(records
                .sessions
                .values()
                .filter(|s| {
                    s.user_id.as_deref() == Some(user_id.as_str())
                        && s.status.is_active()
                })
                .cloned()
                .collect())
        })
    }

    fn create_result(
        &self,
        result: SpeedTestResult,
    ) -> BoxFuture<'_, Result<(), NetgaugeError>> {
        Box::pin(async move {
            let mut records = self.records()?;

            if records.results.contains_key(&result.session_id) {
                return Err(NetgaugeError::session(format!(
                    "result for session {} was already written",
                    result.session_id
                )));
            }

            records.results.insert(result.session_id.clone(), result);
            Ok(())
        })
    }

    fn get_result(
        &self,
        session_id: &str,
    ) -> BoxFuture<'_, Result<Option<SpeedTestResult>, NetgaugeError>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            Ok(self.records()?.results.get(&session_id).cloned())
        })
    }

    fn delete_result(
        &self,
        session_id: &str,
    ) -> BoxFuture<'_, Result<bool, NetgaugeError>> {
        let session_id = session_id.to_string();
        Box::pin(async move {
            Ok(self.records()?.results.remove(&session_id).is_some())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::results::StatisticalSummary;
    use crate::session::model::{TestConfiguration, UserContext};
    use crate::validation::ValidationReport;

    fn session(id: &str, user: &UserContext) -> Session {
        Session::new(id.to_string(), user, TestConfiguration::default())
    }

    fn result(session_id: &str) -> SpeedTestResult {
        SpeedTestResult {
            id: format!("result-{}", session_id),
            session_id: session_id.to_string(),
            user_id: None,
            created_at: Utc::now(),
            config: TestConfiguration::default(),
            download_metrics: None,
            upload_metrics: None,
            latency_metrics: None,
            statistical_summary: StatisticalSummary::default(),
            raw_measurements: vec![],
            validation: ValidationReport::default(),
        }
    }

    #[tokio::test]
    async fn test_one_active_session_per_user() {
        let store = InMemorySessionStore::new();
        let alice = UserContext::identified("alice");

        store.create_session(session("a1", &alice)).await.unwrap();
        let error = store.create_session(session("a2", &alice)).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Session);

        let active = store.active_sessions_for_user("alice").await.unwrap();
        assert_eq!(active.len(), 1);

        // A finished session frees the slot.
        let mut finished = store.get_session("a1").await.unwrap().unwrap();
        finished.fail("boom");
        assert!(store
            .update_session(SessionStatus::Initializing, finished)
            .await
            .unwrap());
        store.create_session(session("a2", &alice)).await.unwrap();
    }

    #[tokio::test]
    async fn test_anonymous_sessions_are_unlimited() {
        let store = InMemorySessionStore::new();
        let anonymous = UserContext::anonymous();

        store.create_session(session("x1", &anonymous)).await.unwrap();
        store.create_session(session("x2", &anonymous)).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let store = InMemorySessionStore::new();
        store
            .create_session(session("s1", &UserContext::anonymous()))
            .await
            .unwrap();

        let mut cancelled = store.get_session("s1").await.unwrap().unwrap();
        cancelled.cancel();
        assert!(store
            .update_session(SessionStatus::Initializing, cancelled)
            .await
            .unwrap());

        // A writer that still believes the session is initializing loses.
        let mut stale = session("s1", &UserContext::anonymous());
        stale.advance(crate::session::model::TestPhase::LatencyTest);
        assert!(!store
            .update_session(SessionStatus::Initializing, stale)
            .await
            .unwrap());

        let stored = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_update_missing_session_is_an_error() {
        let store = InMemorySessionStore::new();
        let error = store
            .update_session(
                SessionStatus::Running,
                session("ghost", &UserContext::anonymous()),
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Session);
    }

    #[tokio::test]
    async fn test_result_is_written_once() {
        let store = InMemorySessionStore::new();
        store.create_result(result("s1")).await.unwrap();
        assert!(store.create_result(result("s1")).await.is_err());
        assert!(store.get_result("s1").await.unwrap().is_some());
        assert!(store.get_result("s2").await.unwrap().is_none());

        assert!(store.delete_result("s1").await.unwrap());
        assert!(!store.delete_result("s1").await.unwrap());
        assert!(store.get_result("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_active_sessions() {
        let store = InMemorySessionStore::new();
        let mut old = session("old", &UserContext::anonymous());
        old.started_at = Utc::now() - chrono::Duration::hours(2);
        store.create_session(old).await.unwrap();
        store
            .create_session(session("new", &UserContext::anonymous()))
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let stale = store.stale_active_sessions(cutoff).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "old");

        assert!(store.remove_session("old").unwrap().is_some());
        assert!(store.stale_active_sessions(cutoff).unwrap().is_empty());
    }
}
