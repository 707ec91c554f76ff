// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The registry of dispatched queries.
//!
//! Every query that was ever admitted is tracked here until it expires. A
//! query becomes eligible for expiration once it reaches a terminal state and
//! is then kept for [`QUERY_MIN_EXPIRE_AGE`] after its last heartbeat, so that
//! clients can still fetch its final status. A background sweep fails queries
//! that ran for too long, reclaims queries whose clients went away, and removes
//! expired queries.

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mz_dyncfg::ConfigSet;
use mz_ore::cast::{duration_to_millis_saturating, CastFrom};
use mz_ore::now::{EpochMillis, NowFn};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::dyncfgs::{
    QUERY_CLIENT_TIMEOUT, QUERY_EXPIRATION_SWEEP_INTERVAL, QUERY_MAX_HISTORY,
    QUERY_MAX_RUN_TIME, QUERY_MIN_EXPIRE_AGE,
};
use crate::error::DispatchError;
use crate::id::QueryId;
use crate::metrics::Metrics;
use crate::query::DispatchQuery;
use crate::state::QueryState;

#[derive(Debug)]
pub struct QueryTracker {
    configs: ConfigSet,
    now: NowFn,
    metrics: Metrics,
    queries: Mutex<BTreeMap<QueryId, Arc<dyn DispatchQuery>>>,
    /// Terminal queries in the order they became eligible for expiration.
    expiration_queue: Mutex<VecDeque<Arc<dyn DispatchQuery>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl QueryTracker {
    pub fn new(configs: ConfigSet, now: NowFn, metrics: Metrics) -> Self {
        QueryTracker {
            configs,
            now,
            metrics,
            queries: Mutex::new(BTreeMap::new()),
            expiration_queue: Mutex::new(VecDeque::new()),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Starts the background sweep. Does nothing if it is already running.
    ///
    /// The sweep holds only a weak reference to the tracker and stops when the
    /// tracker is stopped or dropped.
    pub fn start(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        {
            let mut guard = self.shutdown_tx.lock().expect("lock poisoned");
            if guard.is_some() {
                return;
            }
            *guard = Some(shutdown_tx);
        }

        let period = QUERY_EXPIRATION_SWEEP_INTERVAL.get(&self.configs);
        let tracker = Arc::downgrade(self);
        mz_ore::task::spawn(|| "query_tracker_sweep", async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        let Some(tracker) = tracker.upgrade() else {
                            break;
                        };
                        let result =
                            mz_ore::panic::catch_unwind_str(AssertUnwindSafe(|| tracker.sweep()));
                        if let Err(msg) = result {
                            warn!("query tracker sweep panicked: {msg}");
                        }
                    }
                }
            }
            debug!("shutting down query tracker sweep");
        });
    }

    /// Stops the background sweep. Tracked queries remain available.
    pub fn stop(&self) {
        if let Some(shutdown_tx) = self.shutdown_tx.lock().expect("lock poisoned").take() {
            let _ = shutdown_tx.send(());
        }
    }

    /// Starts tracking `query`.
    ///
    /// Returns false and leaves the tracker unchanged if a query with the same
    /// id is already tracked.
    pub fn add_query(&self, query: Arc<dyn DispatchQuery>) -> bool {
        let mut queries = self.queries.lock().expect("lock poisoned");
        if queries.contains_key(query.query_id()) {
            return false;
        }
        queries.insert(query.query_id().clone(), query);
        true
    }

    pub fn try_get_query(&self, query_id: &QueryId) -> Option<Arc<dyn DispatchQuery>> {
        self.queries
            .lock()
            .expect("lock poisoned")
            .get(query_id)
            .cloned()
    }

    pub fn get_query(&self, query_id: &QueryId) -> Result<Arc<dyn DispatchQuery>, DispatchError> {
        self.try_get_query(query_id)
            .ok_or_else(|| DispatchError::UnknownQueryId(query_id.clone()))
    }

    pub fn all_queries(&self) -> Vec<Arc<dyn DispatchQuery>> {
        self.queries
            .lock()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queries.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of tracked queries waiting for a resource group.
    pub fn queued_count(&self) -> usize {
        self.count(|query| query.state() == QueryState::Queued)
    }

    /// The number of running queries that are not fully blocked.
    pub fn running_count(&self) -> usize {
        self.count(|query| query.state() == QueryState::Running && !query.is_fully_blocked())
    }

    fn count(&self, f: impl Fn(&Arc<dyn DispatchQuery>) -> bool) -> usize {
        self.queries
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|query| f(query))
            .count()
    }

    /// Records that a client is still interested in the query, if it is
    /// tracked.
    pub fn heartbeat(&self, query_id: &QueryId) {
        if let Some(query) = self.try_get_query(query_id) {
            query.record_heartbeat();
        }
    }

    /// Makes a terminal query eligible for removal once it has been idle for
    /// [`QUERY_MIN_EXPIRE_AGE`].
    ///
    /// Must be called for every tracked query once it is done, or the query is
    /// tracked forever.
    pub fn expire_query(&self, query_id: &QueryId) {
        if let Some(query) = self.try_get_query(query_id) {
            self.expiration_queue
                .lock()
                .expect("lock poisoned")
                .push_back(query);
        }
    }

    /// Runs one round of time limit enforcement, abandoned query reclamation
    /// and expiration.
    pub(crate) fn sweep(&self) {
        let now = self.now.now();
        self.enforce_time_limits(now);
        self.prune_abandoned_queries(now);
        self.remove_expired_queries(now);
    }

    fn enforce_time_limits(&self, now: EpochMillis) {
        let max_run_time = QUERY_MAX_RUN_TIME.get(&self.configs);
        let limit = duration_to_millis_saturating(max_run_time);
        for query in self.all_queries() {
            if !query.is_done() && now.saturating_sub(query.create_time()) > limit {
                info!(query_id = %query.query_id(), "failing query that exceeded its run time limit");
                query.fail(DispatchError::ExceededTimeLimit(max_run_time));
            }
        }
    }

    fn prune_abandoned_queries(&self, now: EpochMillis) {
        let timeout = duration_to_millis_saturating(QUERY_CLIENT_TIMEOUT.get(&self.configs));
        let abandoned: Vec<_> = self
            .all_queries()
            .into_iter()
            .filter(|query| {
                !query.is_done() && now.saturating_sub(query.last_heartbeat()) > timeout
            })
            .collect();
        if abandoned.is_empty() {
            return;
        }

        for query in &abandoned {
            let silence = Duration::from_millis(now.saturating_sub(query.last_heartbeat()));
            info!(query_id = %query.query_id(), ?silence, "failing abandoned query");
            // Failing releases anyone waiting on the query and queues it for
            // expiration, which is skipped here since we remove it right away.
            query.fail(DispatchError::AbandonedQuery(silence));
        }

        let mut removed = Vec::new();
        {
            let mut queries = self.queries.lock().expect("lock poisoned");
            for query in &abandoned {
                if queries.remove(query.query_id()).is_some() {
                    removed.push(query.query_id().clone());
                }
            }
        }
        self.expiration_queue
            .lock()
            .expect("lock poisoned")
            .retain(|query| !removed.contains(query.query_id()));
        self.metrics
            .queries_removed
            .with_label_values(&["abandoned"])
            .inc_by(u64::cast_from(removed.len()));
    }

    fn remove_expired_queries(&self, now: EpochMillis) {
        let min_age = duration_to_millis_saturating(QUERY_MIN_EXPIRE_AGE.get(&self.configs));
        let max_history = QUERY_MAX_HISTORY.get(&self.configs);

        let mut expired = Vec::new();
        {
            let mut queue = self.expiration_queue.lock().expect("lock poisoned");
            // The newest `max_history` queries are kept regardless of age.
            let mut removable = queue.len().saturating_sub(max_history);
            queue.retain(|query| {
                if removable == 0 {
                    return true;
                }
                let end_time = query.end_time().unwrap_or(now);
                let idle_since = end_time.max(query.last_heartbeat());
                if now.saturating_sub(idle_since) >= min_age {
                    removable -= 1;
                    expired.push(query.query_id().clone());
                    false
                } else {
                    true
                }
            });
        }
        if expired.is_empty() {
            return;
        }

        let mut queries = self.queries.lock().expect("lock poisoned");
        for query_id in expired {
            if queries.remove(&query_id).is_some() {
                debug!(%query_id, "removed expired query");
                self.metrics
                    .queries_removed
                    .with_label_values(&["expired"])
                    .inc();
            }
        }
    }
}

impl Drop for QueryTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use mz_dyncfg::ConfigUpdates;
    use mz_ore::metrics::MetricsRegistry;

    use super::*;
    use crate::id::Slug;
    use crate::query::LocalDispatchQuery;
    use crate::testing::{metadata, test_configs, ManualClock};

    fn tracker(clock: &ManualClock, configs: ConfigSet) -> Arc<QueryTracker> {
        let metrics = Metrics::register_into(&MetricsRegistry::new());
        Arc::new(QueryTracker::new(configs, clock.now_fn(), metrics))
    }

    /// Registers a query the way the pipeline does, expiring it once done.
    fn track(
        tracker: &Arc<QueryTracker>,
        clock: &ManualClock,
        id: &str,
    ) -> Arc<LocalDispatchQuery> {
        let query = Arc::new(LocalDispatchQuery::new(
            metadata(id, "SELECT 1"),
            Slug::random(),
            clock.now_fn(),
        ));
        let handle: Arc<dyn DispatchQuery> = Arc::clone(&query) as _;
        assert!(tracker.add_query(Arc::clone(&handle)));
        let weak = Arc::downgrade(tracker);
        let query_id = handle.query_id().clone();
        handle.add_state_change_listener(Arc::new(move |state| {
            if !state.is_done() {
                return;
            }
            if let Some(tracker) = weak.upgrade() {
                tracker.expire_query(&query_id);
            }
        }));
        query
    }

    fn qid(id: &str) -> QueryId {
        QueryId::new(id).unwrap()
    }

    #[mz_ore::test]
    fn duplicate_registration_is_rejected() {
        let clock = ManualClock::new(0);
        let tracker = tracker(&clock, test_configs());
        let first = track(&tracker, &clock, "q1");
        first.start_waiting_for_resources();

        let second: Arc<dyn DispatchQuery> = Arc::new(LocalDispatchQuery::new(
            metadata("q1", "SELECT 2"),
            Slug::random(),
            clock.now_fn(),
        ));
        assert!(!tracker.add_query(second));
        assert_eq!(tracker.len(), 1);
        let tracked = tracker.get_query(&qid("q1")).unwrap();
        assert_eq!(tracked.state(), QueryState::Running);
        assert_eq!(tracked.basic_query_info().query, "SELECT 1");
    }

    #[mz_ore::test]
    fn unknown_queries() {
        let clock = ManualClock::new(0);
        let tracker = tracker(&clock, test_configs());
        assert!(tracker.try_get_query(&qid("nope")).is_none());
        assert_eq!(
            tracker.get_query(&qid("nope")).unwrap_err(),
            DispatchError::UnknownQueryId(qid("nope"))
        );
        tracker.heartbeat(&qid("nope"));
        tracker.expire_query(&qid("nope"));
        tracker.sweep();
        assert!(tracker.is_empty());
    }

    #[mz_ore::test]
    fn terminal_queries_expire_after_idle_window() {
        let clock = ManualClock::new(0);
        let tracker = tracker(&clock, test_configs());
        let query = track(&tracker, &clock, "q1");
        clock.advance(Duration::from_secs(1));
        query.finish();

        // Still visible right after termination.
        tracker.sweep();
        assert!(tracker.try_get_query(&qid("q1")).is_some());

        // A heartbeat extends the idle window.
        clock.advance(Duration::from_secs(10 * 60));
        tracker.heartbeat(&qid("q1"));
        clock.advance(Duration::from_secs(10 * 60));
        tracker.sweep();
        assert!(tracker.try_get_query(&qid("q1")).is_some());

        clock.advance(Duration::from_secs(5 * 60));
        tracker.sweep();
        assert!(tracker.try_get_query(&qid("q1")).is_none());
        assert_eq!(
            tracker
                .metrics
                .queries_removed
                .with_label_values(&["expired"])
                .get(),
            1
        );
    }

    #[mz_ore::test]
    fn max_history_keeps_newest() {
        let clock = ManualClock::new(0);
        let configs = test_configs();
        let mut updates = ConfigUpdates::default();
        updates.add(&QUERY_MAX_HISTORY, 2);
        updates.apply(&configs);
        let tracker = tracker(&clock, configs);

        for id in ["q1", "q2", "q3"] {
            track(&tracker, &clock, id).finish();
            clock.advance(Duration::from_secs(1));
        }
        clock.advance(Duration::from_secs(60 * 60));
        tracker.sweep();
        assert!(tracker.try_get_query(&qid("q1")).is_none());
        assert!(tracker.try_get_query(&qid("q2")).is_some());
        assert!(tracker.try_get_query(&qid("q3")).is_some());
    }

    #[mz_ore::test]
    fn unfinished_queries_never_expire() {
        let clock = ManualClock::new(0);
        let tracker = tracker(&clock, test_configs());
        let query = track(&tracker, &clock, "q1");
        for _ in 0..10 {
            clock.advance(Duration::from_secs(60 * 60));
            query.record_heartbeat();
            tracker.sweep();
        }
        assert_eq!(tracker.get_query(&qid("q1")).unwrap().state(), QueryState::Queued);
    }

    #[mz_ore::test]
    fn abandoned_queries_are_failed_and_removed() {
        let clock = ManualClock::new(0);
        let tracker = tracker(&clock, test_configs());
        let abandoned = track(&tracker, &clock, "q1");
        let polled = track(&tracker, &clock, "q2");

        clock.advance(Duration::from_secs(4 * 60));
        polled.record_heartbeat();
        clock.advance(Duration::from_secs(2 * 60));
        tracker.sweep();

        assert_eq!(abandoned.state(), QueryState::Failed);
        assert_eq!(abandoned.error().map(|e| e.code()), Some("ABANDONED_QUERY"));
        assert!(tracker.try_get_query(&qid("q1")).is_none());
        assert_eq!(polled.state(), QueryState::Queued);
        assert!(tracker.try_get_query(&qid("q2")).is_some());
        assert!(tracker.expiration_queue.lock().unwrap().is_empty());
    }

    #[mz_ore::test]
    fn run_time_limit() {
        let clock = ManualClock::new(0);
        let configs = test_configs();
        let mut updates = ConfigUpdates::default();
        updates.add(&QUERY_MAX_RUN_TIME, Duration::from_secs(60));
        updates.apply(&configs);
        let tracker = tracker(&clock, configs);

        let query = track(&tracker, &clock, "q1");
        query.start_waiting_for_resources();
        clock.advance(Duration::from_secs(61));
        query.record_heartbeat();
        tracker.sweep();

        assert_eq!(
            query.error(),
            Some(DispatchError::ExceededTimeLimit(Duration::from_secs(60)))
        );
        // Failed queries follow the normal expiration path.
        assert!(tracker.try_get_query(&qid("q1")).is_some());
        assert_eq!(tracker.expiration_queue.lock().unwrap().len(), 1);
    }

    #[mz_ore::test]
    fn counts() {
        let clock = ManualClock::new(0);
        let tracker = tracker(&clock, test_configs());
        let _queued = track(&tracker, &clock, "q1");
        let running = track(&tracker, &clock, "q2");
        running.start_waiting_for_resources();
        let blocked = track(&tracker, &clock, "q3");
        blocked.start_waiting_for_resources();
        blocked.set_fully_blocked(true);
        track(&tracker, &clock, "q4").finish();

        assert_eq!(tracker.queued_count(), 1);
        assert_eq!(tracker.running_count(), 1);
        assert_eq!(tracker.len(), 4);
        assert_eq!(tracker.all_queries().len(), 4);
    }

    #[mz_ore::test(tokio::test(start_paused = true))]
    async fn background_sweep() {
        let clock = ManualClock::new(0);
        let tracker = tracker(&clock, test_configs());
        tracker.start();
        track(&tracker, &clock, "q1").finish();

        clock.advance(Duration::from_secs(16 * 60));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(tracker.try_get_query(&qid("q1")).is_none());

        tracker.stop();
        track(&tracker, &clock, "q2").finish();
        clock.advance(Duration::from_secs(16 * 60));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(tracker.try_get_query(&qid("q2")).is_some());
    }
}
