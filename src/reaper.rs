/*!
Background sweep of expired sessions and oauth states.

`Reaper::start` spawns the loop and hands back a `ReaperHandle`. Dropping
or stopping the handle closes the stop channel, so no new tick is started.
A tick already running is waited on for at most the shutdown grace period.
*/
use async_std::channel::{self, Receiver, Sender};
use async_std::task::JoinHandle;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::store::{CredentialStore, StoreResult};
use crate::LOG;

/// Rows removed by one tick. `None` when that job failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: Option<u64>,
    pub oauth_states: Option<u64>,
}

pub struct Reaper {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
}

/// Run one job so that neither an error nor a panic escapes it
async fn isolated<F>(job: &'static str, fut: F) -> Option<u64>
where
    F: Future<Output = StoreResult<u64>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(n)) => {
            slog::info!(LOG, "reaped expired rows"; "job" => job, "deleted" => n);
            Some(n)
        }
        Ok(Err(e)) => {
            slog::error!(LOG, "reaper job failed"; "job" => job, "error" => e.to_string());
            None
        }
        Err(_) => {
            slog::error!(LOG, "reaper job panicked"; "job" => job);
            None
        }
    }
}

impl Reaper {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// A single tick. Both jobs always run.
    pub async fn run_once(&self) -> SweepReport {
        let now = self.clock.now();
        let sessions = isolated(
            "expired_sessions",
            self.store.delete_sessions_expired_before(now),
        )
        .await;
        let oauth_states = isolated(
            "expired_oauth_states",
            self.store.delete_oauth_states_expired_before(now),
        )
        .await;
        SweepReport {
            sessions,
            oauth_states,
        }
    }

    /// Tick every `period`, starting one period from now
    pub fn start(self, period: Duration) -> ReaperHandle {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let reaper = Arc::new(self);
        let task = async_std::task::spawn(run(reaper, period, stop_rx));
        slog::info!(LOG, "started reaper"; "period_seconds" => period.as_secs());
        ReaperHandle {
            stop: stop_tx,
            task,
        }
    }
}

async fn run(reaper: Arc<Reaper>, period: Duration, stop: Receiver<()>) {
    loop {
        // a message or a closed channel both mean stop
        if async_std::future::timeout(period, stop.recv())
            .await
            .is_ok()
        {
            break;
        }
        let report = reaper.run_once().await;
        slog::debug!(LOG, "reaper tick finished"; "report" => format!("{:?}", report));
    }
    slog::info!(LOG, "reaper stopped");
}

pub struct ReaperHandle {
    stop: Sender<()>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop scheduling ticks and wait up to `grace` for a running tick.
    /// Returns false when the wait was abandoned.
    pub async fn stop(self, grace: Duration) -> bool {
        self.stop.close();
        match async_std::future::timeout(grace, self.task).await {
            Ok(()) => true,
            Err(_) => {
                slog::warn!(
                    LOG, "reaper did not stop within grace period, abandoning";
                    "grace_seconds" => grace.as_secs(),
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{
        LinkTokens, NewOAuthState, NewSession, NewUser, OAuthState, Session, SpotifyLink, User,
    };
    use crate::store::{MemoryStore, StoreError};
    use crate::testing;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Fault {
        Error,
        Panic,
    }

    /// Memory store whose session sweep always fails
    struct BrokenSessionSweep {
        inner: MemoryStore,
        fault: Fault,
        sweeps: AtomicUsize,
    }

    impl BrokenSessionSweep {
        fn new(fault: Fault) -> Self {
            Self {
                inner: MemoryStore::new(),
                fault,
                sweeps: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl CredentialStore for BrokenSessionSweep {
        async fn insert_user(&self, user: NewUser) -> StoreResult<User> {
            self.inner.insert_user(user).await
        }
        async fn find_user(&self, id: i64) -> StoreResult<Option<User>> {
            self.inner.find_user(id).await
        }
        async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
            self.inner.find_user_by_username(username).await
        }
        async fn username_exists(&self, username: &str) -> StoreResult<bool> {
            self.inner.username_exists(username).await
        }
        async fn email_exists(&self, email: &str) -> StoreResult<bool> {
            self.inner.email_exists(email).await
        }
        async fn delete_user(&self, id: i64) -> StoreResult<bool> {
            self.inner.delete_user(id).await
        }
        async fn insert_session(&self, session: NewSession) -> StoreResult<Session> {
            self.inner.insert_session(session).await
        }
        async fn find_session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
            self.inner.find_session_by_token_hash(token_hash).await
        }
        async fn update_session_expiration(
            &self,
            id: i64,
            expiration: DateTime<Utc>,
        ) -> StoreResult<()> {
            self.inner.update_session_expiration(id, expiration).await
        }
        async fn delete_session(&self, id: i64) -> StoreResult<bool> {
            self.inner.delete_session(id).await
        }
        async fn delete_sessions_expired_before(&self, _now: DateTime<Utc>) -> StoreResult<u64> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            match self.fault {
                Fault::Error => Err(StoreError::Other("connection reset".into())),
                Fault::Panic => panic!("session sweep blew up"),
            }
        }
        async fn delete_oauth_states_for_user(&self, user_id: i64) -> StoreResult<u64> {
            self.inner.delete_oauth_states_for_user(user_id).await
        }
        async fn insert_oauth_state(&self, state: NewOAuthState) -> StoreResult<OAuthState> {
            self.inner.insert_oauth_state(state).await
        }
        async fn find_oauth_state_for_user(&self, user_id: i64) -> StoreResult<Option<OAuthState>> {
            self.inner.find_oauth_state_for_user(user_id).await
        }
        async fn delete_oauth_state(&self, id: i64) -> StoreResult<bool> {
            self.inner.delete_oauth_state(id).await
        }
        async fn delete_oauth_states_expired_before(&self, now: DateTime<Utc>) -> StoreResult<u64> {
            self.inner.delete_oauth_states_expired_before(now).await
        }
        async fn find_link_for_user(&self, user_id: i64) -> StoreResult<Option<SpotifyLink>> {
            self.inner.find_link_for_user(user_id).await
        }
        async fn upsert_link(&self, user_id: i64, tokens: LinkTokens) -> StoreResult<SpotifyLink> {
            self.inner.upsert_link(user_id, tokens).await
        }
        async fn update_link_tokens(&self, id: i64, tokens: LinkTokens) -> StoreResult<SpotifyLink> {
            self.inner.update_link_tokens(id, tokens).await
        }
        async fn delete_link(&self, id: i64) -> StoreResult<bool> {
            self.inner.delete_link(id).await
        }
    }

    async fn abandoned_state(store: &dyn CredentialStore, user_id: i64, now: DateTime<Utc>) {
        store
            .insert_oauth_state(NewOAuthState {
                user_id,
                state: format!("abandoned{:07}", user_id),
                expiration: now - ChronoDuration::minutes(1),
            })
            .await
            .unwrap();
    }

    async fn add_session(store: &MemoryStore, user_id: i64, hash: &str, exp: chrono::DateTime<chrono::Utc>) {
        store
            .insert_session(NewSession {
                user_id,
                token_hash: hash.into(),
                csrf_token: format!("csrf-{}", hash),
                expiration: exp,
            })
            .await
            .unwrap();
    }

    #[async_std::test]
    async fn deletes_exactly_the_expired_rows() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let alice = testing::insert_user(store.as_ref(), "alice").await.id;
        let bobby = testing::insert_user(store.as_ref(), "bobby").await.id;
        let now = clock.now();

        for i in 0..3 {
            add_session(&store, alice, &format!("old-{}", i), now - ChronoDuration::minutes(i + 1)).await;
        }
        add_session(&store, alice, "live-0", now + ChronoDuration::days(1)).await;
        add_session(&store, alice, "live-1", now + ChronoDuration::days(6)).await;

        store
            .insert_oauth_state(NewOAuthState {
                user_id: alice,
                state: "abandonedstate01".into(),
                expiration: now - ChronoDuration::minutes(1),
            })
            .await
            .unwrap();
        store
            .insert_oauth_state(NewOAuthState {
                user_id: bobby,
                state: "pendingstate0001".into(),
                expiration: now + ChronoDuration::minutes(10),
            })
            .await
            .unwrap();

        let reaper = Reaper::new(store.clone(), clock.clone());
        assert_eq!(
            reaper.run_once().await,
            SweepReport {
                sessions: Some(3),
                oauth_states: Some(1),
            }
        );
        assert_eq!(store.session_count().await, 2);
        assert!(store.find_session_by_token_hash("live-0").await.unwrap().is_some());
        assert!(store.find_session_by_token_hash("live-1").await.unwrap().is_some());
        assert_eq!(store.oauth_state_count().await, 1);

        // nothing left to do
        assert_eq!(
            reaper.run_once().await,
            SweepReport {
                sessions: Some(0),
                oauth_states: Some(0),
            }
        );
        assert_eq!(store.session_count().await, 2);
    }

    #[async_std::test]
    async fn start_then_stop_completes() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let alice = testing::insert_user(store.as_ref(), "alice").await.id;
        add_session(&store, alice, "old", clock.now() - ChronoDuration::minutes(1)).await;

        let handle = Reaper::new(store.clone(), clock).start(Duration::from_millis(10));
        async_std::task::sleep(Duration::from_millis(100)).await;
        assert!(handle.stop(Duration::from_secs(5)).await);
        assert_eq!(store.session_count().await, 0);
    }

    #[async_std::test]
    async fn stop_before_first_tick_runs_nothing() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let alice = testing::insert_user(store.as_ref(), "alice").await.id;
        add_session(&store, alice, "old", clock.now() - ChronoDuration::minutes(1)).await;

        let handle = Reaper::new(store.clone(), clock).start(Duration::from_secs(3600));
        assert!(handle.stop(Duration::from_secs(5)).await);
        assert_eq!(store.session_count().await, 1);
    }

    #[async_std::test]
    async fn failing_session_sweep_does_not_stop_state_sweep() {
        for fault in [Fault::Error, Fault::Panic].iter().copied() {
            let store = Arc::new(BrokenSessionSweep::new(fault));
            let clock = Arc::new(ManualClock::starting_now());
            let alice = testing::insert_user(store.as_ref(), "alice").await.id;
            abandoned_state(store.as_ref(), alice, clock.now()).await;

            let report = Reaper::new(store.clone(), clock).run_once().await;
            assert_eq!(
                report,
                SweepReport {
                    sessions: None,
                    oauth_states: Some(1),
                }
            );
            assert_eq!(store.inner.oauth_state_count().await, 0);
        }
    }

    #[async_std::test]
    async fn panicking_job_does_not_kill_the_loop() {
        let store = Arc::new(BrokenSessionSweep::new(Fault::Panic));
        let clock = Arc::new(ManualClock::starting_now());
        let alice = testing::insert_user(store.as_ref(), "alice").await.id;
        let bobby = testing::insert_user(store.as_ref(), "bobby").await.id;
        abandoned_state(store.as_ref(), alice, clock.now()).await;

        let handle = Reaper::new(store.clone(), clock.clone()).start(Duration::from_millis(10));
        async_std::task::sleep(Duration::from_millis(100)).await;
        // added after several panicking ticks, still swept
        abandoned_state(store.as_ref(), bobby, clock.now()).await;
        async_std::task::sleep(Duration::from_millis(100)).await;

        assert!(handle.stop(Duration::from_secs(5)).await);
        assert!(store.sweeps.load(Ordering::SeqCst) >= 2);
        assert_eq!(store.inner.oauth_state_count().await, 0);
    }
}
