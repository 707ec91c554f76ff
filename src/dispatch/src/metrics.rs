// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::{Arc, Weak};

use mz_ore::cast::CastFrom;
use mz_ore::metric;
use mz_ore::metrics::{ComputedUIntGauge, MetricsRegistry};
use mz_ore::stats::{histogram_count_buckets, histogram_seconds_buckets};
use prometheus::{Histogram, HistogramVec, IntCounter, IntCounterVec};

use crate::query::DispatchQuery;
use crate::tracker::QueryTracker;

#[derive(Debug, Clone)]
pub struct Metrics {
    pub queries_submitted: IntCounter,
    pub creation_failures: IntCounterVec,
    pub creation_seconds: HistogramVec,
    pub admission_batch_size: Histogram,
    pub queries_terminated: IntCounterVec,
    pub queries_removed: IntCounterVec,
}

impl Metrics {
    pub(crate) fn register_into(registry: &MetricsRegistry) -> Self {
        Self {
            queries_submitted: registry.register(metric!(
                name: "mz_dispatch_queries_submitted_total",
                help: "The total number of queries accepted for dispatch.",
            )),
            creation_failures: registry.register(metric!(
                name: "mz_dispatch_query_creation_failures_total",
                help: "The total number of queries registered as failed during creation, by error code.",
                var_labels: ["code"],
            )),
            creation_seconds: registry.register(metric!(
                name: "mz_dispatch_query_creation_seconds",
                help: "The time spent turning a submitted query into a registered query.",
                var_labels: ["outcome"],
                buckets: histogram_seconds_buckets(0.000_128, 32.0),
            )),
            admission_batch_size: registry.register(metric!(
                name: "mz_dispatch_admission_batch_size",
                help: "The number of submitted queries drained into the dispatch pipeline at once.",
                buckets: histogram_count_buckets(1.0, 8192.0),
            )),
            queries_terminated: registry.register(metric!(
                name: "mz_dispatch_queries_terminated_total",
                help: "The total number of tracked queries that reached a terminal state, by state.",
                var_labels: ["state"],
            )),
            queries_removed: registry.register(metric!(
                name: "mz_dispatch_queries_removed_total",
                help: "The total number of queries removed from the query tracker, by reason.",
                var_labels: ["reason"],
            )),
        }
    }

    /// Counts the terminal state of `query` once it gets there.
    pub(crate) fn track_query(&self, query: &Arc<dyn DispatchQuery>) {
        let terminated = self.queries_terminated.clone();
        query.add_state_change_listener(Arc::new(move |state| {
            if state.is_done() {
                terminated.with_label_values(&[state.as_str()]).inc();
            }
        }));
    }
}

/// Gauges computed from the contents of a [`QueryTracker`] when scraped.
#[derive(Debug, Clone)]
pub struct TrackerGauges {
    pub queued: ComputedUIntGauge,
    pub running: ComputedUIntGauge,
    pub tracked: ComputedUIntGauge,
}

impl TrackerGauges {
    /// Registers the gauges, which read zero once the tracker is dropped.
    pub(crate) fn register_into(registry: &MetricsRegistry, tracker: &Arc<QueryTracker>) -> Self {
        fn gauge(
            tracker: &Arc<QueryTracker>,
            f: fn(&QueryTracker) -> usize,
        ) -> impl Fn() -> u64 + Send + Sync + 'static {
            let tracker: Weak<QueryTracker> = Arc::downgrade(tracker);
            move || {
                tracker
                    .upgrade()
                    .map_or(0, |tracker| u64::cast_from(f(&tracker)))
            }
        }

        TrackerGauges {
            queued: registry.register_computed_gauge(
                metric!(
                    name: "mz_dispatch_queued_queries",
                    help: "The number of tracked queries waiting for a resource group.",
                ),
                gauge(tracker, QueryTracker::queued_count),
            ),
            running: registry.register_computed_gauge(
                metric!(
                    name: "mz_dispatch_running_queries",
                    help: "The number of tracked queries running and not fully blocked.",
                ),
                gauge(tracker, QueryTracker::running_count),
            ),
            tracked: registry.register_computed_gauge(
                metric!(
                    name: "mz_dispatch_tracked_queries",
                    help: "The number of queries in the query tracker, including finished ones.",
                ),
                gauge(tracker, QueryTracker::len),
            ),
        }
    }
}
