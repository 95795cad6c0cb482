use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{GalleryError, Result};

pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    AwaitingName,
    Processing,
}

#[derive(Debug)]
struct Session {
    state: JobState,
    urls: Vec<String>,
    archive_name: Option<String>,
    cancel: Option<CancellationToken>,
    touched: Instant,
}

impl Session {
    fn idle() -> Self {
        Self {
            state: JobState::Idle,
            urls: Vec::new(),
            archive_name: None,
            cancel: None,
            touched: Instant::now(),
        }
    }
}

/// Per-user job records. Every transition is a single check-then-set under
/// the lock, so two submissions cannot both reach `Processing`.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<UserId, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_session<T>(&self, user: &str, f: impl FnOnce(&mut Session) -> T) -> T {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions
            .entry(user.to_string())
            .or_insert_with(Session::idle);
        session.touched = Instant::now();
        f(session)
    }

    pub fn state(&self, user: &str) -> JobState {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(user).map_or(JobState::Idle, |s| s.state)
    }

    /// Name of the archive being built, while processing.
    pub fn active_archive(&self, user: &str) -> Option<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(user)
            .filter(|s| s.state == JobState::Processing)
            .and_then(|s| s.archive_name.clone())
    }

    /// Holds submitted URLs while the user picks an archive name. URLs sent
    /// during the naming step join the pending list; duplicates are dropped
    /// and arrival order is kept. Returns the pending count.
    pub fn stage(&self, user: &str, urls: Vec<String>) -> Result<usize> {
        self.with_session(user, |session| {
            if session.state == JobState::Processing {
                return Err(GalleryError::AlreadyProcessing);
            }
            if session.state != JobState::AwaitingName {
                session.urls.clear();
            }
            for url in urls {
                if !session.urls.contains(&url) {
                    session.urls.push(url);
                }
            }
            session.state = JobState::AwaitingName;
            session.archive_name = None;
            Ok(session.urls.len())
        })
    }

    pub fn pending_urls(&self, user: &str) -> Option<Vec<String>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(user)
            .filter(|s| s.state == JobState::AwaitingName)
            .map(|s| s.urls.clone())
    }

    /// Enters `Processing` and hands out the job's cancellation token.
    pub fn begin(
        &self,
        user: &str,
        urls: Vec<String>,
        archive_name: &str,
    ) -> Result<CancellationToken> {
        self.with_session(user, |session| {
            if session.state == JobState::Processing {
                return Err(GalleryError::AlreadyProcessing);
            }
            let token = CancellationToken::new();
            session.state = JobState::Processing;
            session.urls = urls;
            session.archive_name = Some(archive_name.to_string());
            session.cancel = Some(token.clone());
            debug!(user, archive_name, "job processing");
            Ok(token)
        })
    }

    pub fn finish(&self, user: &str) {
        self.with_session(user, |session| {
            *session = Session::idle();
        });
    }

    /// Flips the token of a processing job. No-op otherwise.
    pub fn cancel(&self, user: &str) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get(user) {
            Some(Session {
                state: JobState::Processing,
                cancel: Some(token),
                ..
            }) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Drops a pending naming step; leaves processing jobs alone.
    pub fn reset(&self, user: &str) {
        self.with_session(user, |session| {
            if session.state != JobState::Processing {
                *session = Session::idle();
            }
        });
    }

    /// Forgets sessions untouched for `ttl`. Processing sessions are kept.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, s| s.state == JobState::Processing || s.touched.elapsed() < ttl);
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_submission_is_rejected_without_touching_first() {
        let store = SessionStore::new();
        let token = store
            .begin("u1", vec!["https://a.test/1".into()], "first")
            .unwrap();

        let err = store
            .begin("u1", vec!["https://a.test/2".into()], "second")
            .unwrap_err();
        assert!(matches!(err, GalleryError::AlreadyProcessing));
        assert!(matches!(
            store.stage("u1", vec![]),
            Err(GalleryError::AlreadyProcessing)
        ));
        assert_eq!(store.state("u1"), JobState::Processing);
        assert!(!token.is_cancelled());

        assert!(store.cancel("u1"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn users_are_independent() {
        let store = SessionStore::new();
        store.begin("u1", vec![], "one").unwrap();
        assert!(store.begin("u2", vec![], "two").is_ok());
    }

    #[test]
    fn cancel_is_noop_when_not_processing() {
        let store = SessionStore::new();
        assert!(!store.cancel("nobody"));
        store.stage("u1", vec!["https://a.test".into()]).unwrap();
        assert!(!store.cancel("u1"));
        assert_eq!(store.state("u1"), JobState::AwaitingName);
    }

    #[test]
    fn naming_step_then_begin_then_finish() {
        let store = SessionStore::new();
        store.stage("u1", vec!["https://a.test/g".into()]).unwrap();
        assert_eq!(store.pending_urls("u1").unwrap(), vec!["https://a.test/g"]);

        let urls = store.pending_urls("u1").unwrap();
        store.begin("u1", urls, "named").unwrap();
        assert!(store.pending_urls("u1").is_none());

        store.finish("u1");
        assert_eq!(store.state("u1"), JobState::Idle);
        assert!(!store.cancel("u1"));
    }

    #[test]
    fn urls_sent_one_per_message_accumulate_while_naming() {
        let store = SessionStore::new();
        assert_eq!(store.stage("u1", vec!["https://a.test/g/1".into()]).unwrap(), 1);
        assert_eq!(store.stage("u1", vec!["https://a.test/g/2".into()]).unwrap(), 2);
        assert_eq!(
            store
                .stage(
                    "u1",
                    vec!["https://a.test/g/1".into(), "https://a.test/g/3".into()]
                )
                .unwrap(),
            3
        );
        assert_eq!(
            store.pending_urls("u1").unwrap(),
            vec!["https://a.test/g/1", "https://a.test/g/2", "https://a.test/g/3"]
        );

        store.reset("u1");
        assert_eq!(store.stage("u1", vec!["https://b.test/x".into()]).unwrap(), 1);
    }

    #[test]
    fn eviction_keeps_processing_sessions() {
        let store = SessionStore::new();
        store.begin("busy", vec![], "job").unwrap();
        store.stage("waiting", vec![]).unwrap();
        assert_eq!(store.evict_idle(Duration::ZERO), 1);
        assert_eq!(store.state("busy"), JobState::Processing);
        assert_eq!(store.state("waiting"), JobState::Idle);
    }

    #[test]
    fn reset_does_not_interrupt_processing() {
        let store = SessionStore::new();
        store.begin("u1", vec![], "job").unwrap();
        store.reset("u1");
        assert_eq!(store.state("u1"), JobState::Processing);
    }
}
