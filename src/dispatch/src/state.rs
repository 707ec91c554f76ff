// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The lifecycle state shared by every kind of dispatch query.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use mz_ore::now::{EpochMillis, NowFn};
use serde::Serialize;
use tokio::sync::watch;

use crate::error::DispatchError;
use crate::id::QueryId;
use crate::prepare::QueryType;
use crate::resource_group::ResourceGroupId;
use crate::session::Session;

/// The lifecycle state of a query.
///
/// `Queued` moves to `Running` when a resource group admits the query. Any
/// non-terminal state may move to one of the three terminal states, after
/// which the state never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum QueryState {
    Queued,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl QueryState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            QueryState::Finished | QueryState::Failed | QueryState::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryState::Queued => "queued",
            QueryState::Running => "running",
            QueryState::Finished => "finished",
            QueryState::Failed => "failed",
            QueryState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called with the new state after every state transition.
pub type StateChangeListener = Arc<dyn Fn(QueryState) + Send + Sync>;

/// The immutable description of a query, fixed when its handle is built.
#[derive(Debug, Clone)]
pub struct QueryMetadata {
    pub session: Session,
    pub query: String,
    pub prepare_sql: Option<String>,
    pub query_type: Option<QueryType>,
    pub resource_group_id: Option<ResourceGroupId>,
}

/// Timing statistics of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BasicQueryStats {
    pub create_time: EpochMillis,
    pub dispatch_time: Option<EpochMillis>,
    pub end_time: Option<EpochMillis>,
    /// Time since creation, up to the end of the query if it has ended.
    pub elapsed_time: Duration,
    /// Time spent waiting for a resource group.
    pub queued_time: Duration,
    pub fully_blocked: bool,
}

/// A snapshot of a query for listing and status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BasicQueryInfo {
    pub query_id: QueryId,
    pub state: QueryState,
    pub user: String,
    pub source: Option<String>,
    pub query: String,
    pub prepare_sql: Option<String>,
    pub query_type: Option<QueryType>,
    pub resource_group_id: Option<ResourceGroupId>,
    pub error_code: Option<&'static str>,
    pub error_message: Option<String>,
    pub stats: BasicQueryStats,
}

/// A snapshot of a query for clients polling for it to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchInfo {
    pub dispatched: bool,
    pub failure: Option<DispatchError>,
    pub elapsed_time: Duration,
    pub queued_time: Duration,
}

#[derive(Default)]
struct Inner {
    dispatch_time: Option<EpochMillis>,
    end_time: Option<EpochMillis>,
    error: Option<DispatchError>,
    listeners: Vec<StateChangeListener>,
}

/// Tracks the state of one query and notifies interested parties when it
/// changes.
///
/// All transitions are serialized by a mutex. Listeners run after the mutex is
/// released, and the transition into a terminal state is observed by each
/// listener exactly once. Reaching `Running` or any terminal state resolves
/// the dispatched signal.
pub struct QueryStateMachine {
    metadata: QueryMetadata,
    create_time: EpochMillis,
    now: NowFn,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<QueryState>,
    dispatched_tx: watch::Sender<bool>,
    last_heartbeat: AtomicU64,
    fully_blocked: AtomicBool,
}

impl fmt::Debug for QueryStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStateMachine")
            .field("query_id", self.query_id())
            .field("state", &self.state())
            .field("create_time", &self.create_time)
            .finish_non_exhaustive()
    }
}

impl QueryStateMachine {
    /// Creates the state machine of a query that is waiting to be dispatched.
    pub fn begin(metadata: QueryMetadata, now: NowFn) -> Self {
        Self::new(metadata, now, QueryState::Queued, None)
    }

    /// Creates the state machine of a query that failed before it could be
    /// dispatched.
    pub fn failed(metadata: QueryMetadata, error: DispatchError, now: NowFn) -> Self {
        Self::new(metadata, now, QueryState::Failed, Some(error))
    }

    fn new(
        metadata: QueryMetadata,
        now: NowFn,
        state: QueryState,
        error: Option<DispatchError>,
    ) -> Self {
        let create_time = now.now();
        let (state_tx, _) = watch::channel(state);
        let (dispatched_tx, _) = watch::channel(state.is_done());
        let end_time = state.is_done().then_some(create_time);
        QueryStateMachine {
            metadata,
            create_time,
            now,
            inner: Mutex::new(Inner {
                end_time,
                error,
                ..Default::default()
            }),
            state_tx,
            dispatched_tx,
            last_heartbeat: AtomicU64::new(create_time),
            fully_blocked: AtomicBool::new(false),
        }
    }

    pub fn query_id(&self) -> &QueryId {
        &self.metadata.session.query_id
    }

    pub fn metadata(&self) -> &QueryMetadata {
        &self.metadata
    }

    pub fn state(&self) -> QueryState {
        *self.state_tx.borrow()
    }

    pub fn create_time(&self) -> EpochMillis {
        self.create_time
    }

    pub fn end_time(&self) -> Option<EpochMillis> {
        self.inner.lock().expect("lock poisoned").end_time
    }

    /// The cause of the failure, if the query failed.
    pub fn error(&self) -> Option<DispatchError> {
        self.inner.lock().expect("lock poisoned").error.clone()
    }

    pub fn last_heartbeat(&self) -> EpochMillis {
        self.last_heartbeat.load(Ordering::SeqCst)
    }

    pub fn record_heartbeat(&self) {
        self.last_heartbeat
            .fetch_max(self.now.now(), Ordering::SeqCst);
    }

    pub fn is_fully_blocked(&self) -> bool {
        self.fully_blocked.load(Ordering::SeqCst)
    }

    pub fn set_fully_blocked(&self, fully_blocked: bool) {
        self.fully_blocked.store(fully_blocked, Ordering::SeqCst);
    }

    pub fn transition_to_running(&self) -> bool {
        self.transition(QueryState::Running, None)
    }

    pub fn transition_to_finished(&self) -> bool {
        self.transition(QueryState::Finished, None)
    }

    pub fn transition_to_failed(&self, error: DispatchError) -> bool {
        self.transition(QueryState::Failed, Some(error))
    }

    pub fn transition_to_canceled(&self) -> bool {
        self.transition(QueryState::Canceled, None)
    }

    /// Moves to `to`, returning false if the move is not allowed from the
    /// current state.
    fn transition(&self, to: QueryState, error: Option<DispatchError>) -> bool {
        let listeners = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let from = *self.state_tx.borrow();
            let allowed = match to {
                QueryState::Queued => false,
                QueryState::Running => from == QueryState::Queued,
                QueryState::Finished | QueryState::Failed | QueryState::Canceled => {
                    !from.is_done()
                }
            };
            if !allowed {
                return false;
            }

            let now = self.now.now();
            if to == QueryState::Running {
                inner.dispatch_time = Some(now);
            }
            if to.is_done() {
                inner.end_time = Some(now);
                inner.error = error;
            }
            self.state_tx.send_replace(to);
            self.dispatched_tx.send_replace(true);
            if to.is_done() {
                std::mem::take(&mut inner.listeners)
            } else {
                inner.listeners.clone()
            }
        };
        for listener in listeners {
            listener(to);
        }
        true
    }

    /// Registers `listener` to be called after each subsequent transition.
    ///
    /// If the query is already done the listener is called immediately with
    /// the terminal state.
    pub fn add_state_change_listener(&self, listener: StateChangeListener) {
        let done = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let state = *self.state_tx.borrow();
            if state.is_done() {
                Some(state)
            } else {
                inner.listeners.push(listener.clone());
                None
            }
        };
        if let Some(state) = done {
            listener(state);
        }
    }

    /// Resolves once the query has been dispatched to a resource group or has
    /// reached a terminal state, whichever happens first.
    pub fn dispatched(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.dispatched_tx.subscribe();
        Box::pin(async move {
            // An error means the query is gone, and nobody is left to
            // dispatch it.
            let _ = rx.wait_for(|dispatched| *dispatched).await;
        })
    }

    /// Resolves with the terminal state once the query is done.
    pub fn done(&self) -> BoxFuture<'static, QueryState> {
        let mut rx = self.state_tx.subscribe();
        Box::pin(async move {
            let state = rx.wait_for(|state| state.is_done()).await.map(|s| *s);
            state.unwrap_or_else(|_| *rx.borrow())
        })
    }

    pub fn basic_query_stats(&self) -> BasicQueryStats {
        let now = self.now.now();
        let inner = self.inner.lock().expect("lock poisoned");
        let elapsed_end = inner.end_time.unwrap_or(now);
        let queued_end = inner.dispatch_time.or(inner.end_time).unwrap_or(now);
        BasicQueryStats {
            create_time: self.create_time,
            dispatch_time: inner.dispatch_time,
            end_time: inner.end_time,
            elapsed_time: self.millis_since_create(elapsed_end),
            queued_time: self.millis_since_create(queued_end),
            fully_blocked: self.is_fully_blocked(),
        }
    }

    pub fn basic_query_info(&self) -> BasicQueryInfo {
        let error = self.error();
        BasicQueryInfo {
            query_id: self.query_id().clone(),
            state: self.state(),
            user: self.metadata.session.identity.user.clone(),
            source: self.metadata.session.source.clone(),
            query: self.metadata.query.clone(),
            prepare_sql: self.metadata.prepare_sql.clone(),
            query_type: self.metadata.query_type,
            resource_group_id: self.metadata.resource_group_id.clone(),
            error_code: error.as_ref().map(|e| e.code()),
            error_message: error.map(|e| e.to_string()),
            stats: self.basic_query_stats(),
        }
    }

    pub fn dispatch_info(&self) -> DispatchInfo {
        let stats = self.basic_query_stats();
        DispatchInfo {
            dispatched: *self.dispatched_tx.borrow(),
            failure: self.error(),
            elapsed_time: stats.elapsed_time,
            queued_time: stats.queued_time,
        }
    }

    fn millis_since_create(&self, until: EpochMillis) -> Duration {
        Duration::from_millis(until.saturating_sub(self.create_time))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::FutureExt;

    use super::*;
    use crate::testing::{metadata, ManualClock};

    #[mz_ore::test]
    fn lifecycle() {
        let clock = ManualClock::new(100);
        let sm = QueryStateMachine::begin(metadata("q1", "SELECT 1"), clock.now_fn());
        assert_eq!(sm.state(), QueryState::Queued);
        assert_eq!(sm.basic_query_info().stats.dispatch_time, None);

        clock.advance(Duration::from_millis(50));
        assert!(sm.transition_to_running());
        assert!(!sm.transition_to_running());
        clock.advance(Duration::from_millis(25));
        assert!(sm.transition_to_finished());
        assert!(!sm.transition_to_failed(DispatchError::Internal("late".into())));
        assert!(!sm.transition_to_canceled());

        clock.advance(Duration::from_secs(10));
        let info = sm.basic_query_info();
        assert_eq!(info.state, QueryState::Finished);
        assert_eq!(info.error_code, None);
        assert_eq!(info.stats.dispatch_time, Some(150));
        assert_eq!(info.stats.end_time, Some(175));
        assert_eq!(info.stats.queued_time, Duration::from_millis(50));
        assert_eq!(info.stats.elapsed_time, Duration::from_millis(75));
    }

    #[mz_ore::test]
    fn terminal_listener_fires_once() {
        let clock = ManualClock::new(0);
        let sm = QueryStateMachine::begin(metadata("q1", "SELECT 1"), clock.now_fn());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            sm.add_state_change_listener(Arc::new(move |state| {
                seen.lock().unwrap().push(state)
            }));
        }
        sm.transition_to_running();
        sm.transition_to_failed(DispatchError::Internal("boom".into()));
        sm.transition_to_canceled();
        sm.transition_to_finished();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![QueryState::Running, QueryState::Failed]
        );
        assert_eq!(sm.error(), Some(DispatchError::Internal("boom".into())));
    }

    #[mz_ore::test]
    fn late_listener_sees_terminal_state() {
        let clock = ManualClock::new(0);
        let sm = QueryStateMachine::begin(metadata("q1", "SELECT 1"), clock.now_fn());
        sm.transition_to_canceled();

        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            sm.add_state_change_listener(Arc::new(move |state| {
                assert_eq!(state, QueryState::Canceled);
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[mz_ore::test]
    fn failed_state_machine() {
        let clock = ManualClock::new(7);
        let err = DispatchError::MalformedStatement("bad".into());
        let sm = QueryStateMachine::failed(metadata("q1", "SELEC"), err.clone(), clock.now_fn());
        assert_eq!(sm.state(), QueryState::Failed);
        assert_eq!(sm.end_time(), Some(7));
        assert!(!sm.transition_to_running());

        let info = sm.dispatch_info();
        assert!(info.dispatched);
        assert_eq!(info.failure, Some(err));
        assert_eq!(sm.basic_query_info().error_code, Some("SYNTAX_ERROR"));
        assert!(sm.dispatched().now_or_never().is_some());
        assert_eq!(sm.done().now_or_never(), Some(QueryState::Failed));
    }

    #[mz_ore::test(tokio::test)]
    async fn dispatched_resolves_on_running_or_terminal() {
        let clock = ManualClock::new(0);

        let sm = Arc::new(QueryStateMachine::begin(
            metadata("q1", "SELECT 1"),
            clock.now_fn(),
        ));
        let mut dispatched = sm.dispatched();
        assert!((&mut dispatched).now_or_never().is_none());
        sm.transition_to_running();
        dispatched.await;
        assert!(sm.done().now_or_never().is_none());

        // A query canceled while queued never runs, but its waiters must
        // still be released.
        let sm = Arc::new(QueryStateMachine::begin(
            metadata("q2", "SELECT 1"),
            clock.now_fn(),
        ));
        let waiter = {
            let dispatched = sm.dispatched();
            mz_ore::task::spawn(|| "waiter", dispatched)
        };
        sm.transition_to_canceled();
        waiter.await.unwrap();
        assert_eq!(sm.done().await, QueryState::Canceled);
        assert_eq!(sm.basic_query_info().stats.dispatch_time, None);
    }

    #[mz_ore::test]
    fn heartbeats_never_move_backwards() {
        let clock = ManualClock::new(1_000);
        let sm = QueryStateMachine::begin(metadata("q1", "SELECT 1"), clock.now_fn());
        assert_eq!(sm.last_heartbeat(), 1_000);
        clock.advance(Duration::from_millis(500));
        sm.record_heartbeat();
        assert_eq!(sm.last_heartbeat(), 1_500);
        clock.set(1_200);
        sm.record_heartbeat();
        assert_eq!(sm.last_heartbeat(), 1_500);
    }
}
