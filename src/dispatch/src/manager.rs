// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The entry point to query dispatch.

use std::sync::Arc;

use futures::future::{self, BoxFuture};
use mz_dyncfg::ConfigSet;
use mz_ore::metrics::MetricsRegistry;
use mz_ore::now::NowFn;
use tracing::{debug, info};

use crate::admission::{AdmissionQueue, QueryCreation, QueryCreationRequest};
use crate::error::DispatchError;
use crate::id::{QueryId, QueryIdGenerator, Slug};
use crate::metrics::{Metrics, TrackerGauges};
use crate::pipeline::{DispatchCollaborators, DispatchPipeline};
use crate::query::DispatchQuery;
use crate::session::SessionContext;
use crate::state::{BasicQueryInfo, DispatchInfo};
use crate::tracker::QueryTracker;

/// Configures a [`DispatchManager`].
#[derive(Debug, Clone)]
pub struct DispatchManagerConfig {
    pub collaborators: DispatchCollaborators,
    /// Must contain every config in [`crate::dyncfgs::all_dyncfgs`].
    pub configs: ConfigSet,
    pub metrics_registry: MetricsRegistry,
    pub now: NowFn,
}

/// Admits queries, dispatches them to resource groups and tracks them until
/// they expire.
///
/// Every query accepted by [`DispatchManager::create_query`] is registered
/// under its id, failed if it could not be created, and stays registered until
/// the query tracker expires it.
#[derive(Debug)]
pub struct DispatchManager {
    query_id_generator: QueryIdGenerator,
    tracker: Arc<QueryTracker>,
    admission: Arc<AdmissionQueue>,
    metrics: Metrics,
    _gauges: TrackerGauges,
}

impl DispatchManager {
    pub fn new(config: DispatchManagerConfig) -> Self {
        let DispatchManagerConfig {
            collaborators,
            configs,
            metrics_registry,
            now,
        } = config;
        let metrics = Metrics::register_into(&metrics_registry);
        let tracker = Arc::new(QueryTracker::new(
            configs.clone(),
            now.clone(),
            metrics.clone(),
        ));
        let gauges = TrackerGauges::register_into(&metrics_registry, &tracker);
        let pipeline = Arc::new(DispatchPipeline::new(
            collaborators,
            Arc::clone(&tracker),
            configs.clone(),
            metrics.clone(),
        ));
        let admission = Arc::new(AdmissionQueue::new(pipeline, configs, metrics.clone()));
        DispatchManager {
            query_id_generator: QueryIdGenerator::new(now),
            tracker,
            admission,
            metrics,
            _gauges: gauges,
        }
    }

    /// Starts the background tasks: admission draining and query expiration.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        info!(
            coordinator_id = self.query_id_generator.coordinator_id(),
            "starting dispatch manager"
        );
        self.tracker.start();
        self.admission.start();
    }

    /// Stops the background tasks and refuses further submissions.
    ///
    /// Queries that were accepted but not yet drained are handed to the
    /// pipeline before returning, so their creations still complete.
    pub fn stop(&self) {
        self.admission.stop();
        let drained = self.admission.drain();
        debug!(drained, "stopped admission");
        self.tracker.stop();
    }

    pub fn create_query_id(&self) -> QueryId {
        self.query_id_generator.create_next_query_id()
    }

    /// Accepts a query for creation.
    ///
    /// Returns immediately. The returned future resolves once the query is
    /// registered, which happens even if creating it fails; in that case the
    /// registered query is failed with the cause.
    ///
    /// Errors if `query` is empty, a query with `query_id` is already
    /// registered, or the manager was stopped, in which case nothing is
    /// submitted.
    pub fn create_query(
        &self,
        query_id: QueryId,
        slug: Slug,
        session_context: SessionContext,
        query: String,
    ) -> Result<QueryCreation, DispatchError> {
        if query.is_empty() {
            return Err(DispatchError::EmptyQuery);
        }
        if self.is_query_registered(&query_id) {
            return Err(DispatchError::DuplicateQueryId(query_id));
        }
        self.admission.submit(QueryCreationRequest {
            query_id,
            slug,
            session_context,
            query,
        })
    }

    /// Returns a future that resolves once the query is dispatched to a
    /// resource group or done.
    ///
    /// Counts as a heartbeat. Resolves immediately if the query is unknown,
    /// since it may have just expired.
    pub fn wait_for_dispatched(&self, query_id: &QueryId) -> BoxFuture<'static, ()> {
        match self.tracker.try_get_query(query_id) {
            Some(query) => {
                query.record_heartbeat();
                query.dispatched()
            }
            None => Box::pin(future::ready(())),
        }
    }

    pub fn get_queries(&self) -> Vec<BasicQueryInfo> {
        self.tracker
            .all_queries()
            .iter()
            .map(|query| query.basic_query_info())
            .collect()
    }

    /// The number of queries waiting for a resource group.
    pub fn queued_queries(&self) -> usize {
        self.tracker.queued_count()
    }

    /// The number of running queries that are not fully blocked.
    pub fn running_queries(&self) -> usize {
        self.tracker.running_count()
    }

    pub fn is_query_registered(&self, query_id: &QueryId) -> bool {
        self.tracker.try_get_query(query_id).is_some()
    }

    pub fn get_query(&self, query_id: &QueryId) -> Result<Arc<dyn DispatchQuery>, DispatchError> {
        self.tracker.get_query(query_id)
    }

    pub fn get_query_info(&self, query_id: &QueryId) -> Result<BasicQueryInfo, DispatchError> {
        self.tracker
            .get_query(query_id)
            .map(|query| query.basic_query_info())
    }

    /// Returns the dispatch status of the query, recording a heartbeat.
    pub fn get_dispatch_info(&self, query_id: &QueryId) -> Option<DispatchInfo> {
        let query = self.tracker.try_get_query(query_id)?;
        query.record_heartbeat();
        Some(query.dispatch_info())
    }

    pub fn heartbeat(&self, query_id: &QueryId) {
        self.tracker.heartbeat(query_id);
    }

    /// Cancels the query. Does nothing if it is unknown or already done.
    pub fn cancel_query(&self, query_id: &QueryId) {
        debug!(%query_id, "cancel query");
        if let Some(query) = self.tracker.try_get_query(query_id) {
            query.cancel();
        }
    }

    /// Fails the query. Does nothing if it is unknown or already done.
    pub fn fail_query(&self, query_id: &QueryId, cause: DispatchError) {
        debug!(%query_id, %cause, "fail query");
        if let Some(query) = self.tracker.try_get_query(query_id) {
            query.fail(cause);
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl Drop for DispatchManager {
    fn drop(&mut self) {
        self.admission.stop();
        self.tracker.stop();
    }
}
