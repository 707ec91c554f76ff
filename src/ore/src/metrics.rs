// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Metrics for materialize systems.
//!
//! The idea here is that each subsystem keeps its metrics in a scoped-to-it struct, which gets
//! registered (once) to the server's (or a test's) prometheus registry.
//!
//! Instead of using prometheus's (very verbose) metrics definitions, we rely on type inference to
//! reduce the verbosity a little bit. A typical subsystem will look like the following:
//!
//! ```rust
//! # use mz_ore::metrics::{IntCounter, MetricsRegistry};
//! # use mz_ore::metric;
//! #[derive(Debug, Clone)] // Note that prometheus metrics can safely be cloned
//! struct Metrics {
//!     pub bytes_sent: IntCounter,
//! }
//!
//! impl Metrics {
//!     pub fn register_into(registry: &MetricsRegistry) -> Metrics {
//!         Metrics {
//!             bytes_sent: registry.register(metric!(
//!                 name: "mz_pg_sent_bytes",
//!                 help: "total number of bytes sent here",
//!             )),
//!         }
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use prometheus::core::{
    Atomic, AtomicU64, Collector, GenericCounter, GenericCounterVec, GenericGauge,
    GenericGaugeVec, Opts,
};
use prometheus::proto::MetricFamily;
use prometheus::{HistogramOpts, Registry};

use crate::stats::HISTOGRAM_BUCKETS;

pub use prometheus::Opts as PrometheusOpts;
pub use prometheus::{
    Counter, CounterVec, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec,
};

/// Define a metric for use in materialize.
#[macro_export]
macro_rules! metric {
    (
        name: $name:expr,
        help: $help:expr
        $(, const_labels: { $($cl_key:expr => $cl_value:expr ),* })?
        $(, var_labels: [ $($vl_name:expr),* ])?
        $(, buckets: $bk_name:expr)?
        $(,)?
    ) => {{
        let const_labels: ::std::collections::HashMap<String, String> = (&[
            $($(
                ($cl_key.to_string(), $cl_value.to_string()),
            )*)?
        ]).into_iter().cloned().collect();
        let var_labels: ::std::vec::Vec<String> = vec![
            $(
                $($vl_name.into(),)*
            )?];
        #[allow(unused_mut)]
        let mut mk_opts = $crate::metrics::MakeCollectorOpts {
            opts: $crate::metrics::PrometheusOpts::new($name, $help)
                .const_labels(const_labels)
                .variable_labels(var_labels),
            buckets: None,
        };
        $(mk_opts.buckets = Some($bk_name);)?
        mk_opts
    }}
}

/// Options for MakeCollector. This struct should be instantiated using the metric macro.
#[derive(Debug, Clone)]
pub struct MakeCollectorOpts {
    /// Common Prometheus options
    pub opts: PrometheusOpts,
    /// Buckets to be used with Histogram and HistogramVec. Must be set to create Histogram types
    /// and must not be set for other types.
    pub buckets: Option<Vec<f64>>,
}

/// The materialize metrics registry.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    inner: Registry,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        MetricsRegistry {
            inner: Registry::new(),
        }
    }

    /// Register a metric defined with the [`metric`] macro.
    ///
    /// Panics if a metric with the same name is already registered.
    pub fn register<M>(&self, opts: MakeCollectorOpts) -> M
    where
        M: MakeCollector,
    {
        let collector = M::make_collector(opts);
        self.inner
            .register(Box::new(collector.clone()))
            .expect("registering metric");
        collector
    }

    /// Registers a gauge whose value is computed when observed.
    pub fn register_computed_gauge<F, P>(
        &self,
        opts: MakeCollectorOpts,
        f: F,
    ) -> ComputedGenericGauge<P>
    where
        F: Fn() -> P::T + Send + Sync + 'static,
        P: Atomic + 'static,
    {
        let gauge = ComputedGenericGauge {
            gauge: GenericGauge::make_collector(opts),
            f: Arc::new(f),
        };
        self.inner
            .register(Box::new(gauge.clone()))
            .expect("registering computed gauge");
        gauge
    }

    /// Gather all the metrics from the metrics registry for reporting.
    ///
    /// See also [`prometheus::Registry::gather`].
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.gather()
    }
}

/// A wrapper for creating prometheus metrics more conveniently.
///
/// Together with the [`metric`] macro, this trait is mainly used by [`MetricsRegistry`] and should
/// not normally be used outside the metric registration flow.
pub trait MakeCollector: Collector + Clone + 'static {
    /// Creates a new collector.
    fn make_collector(mk_opts: MakeCollectorOpts) -> Self;
}

fn variable_labels(opts: &Opts) -> Vec<String> {
    opts.variable_labels.clone()
}

impl<T> MakeCollector for GenericCounter<T>
where
    T: Atomic + 'static,
{
    fn make_collector(mk_opts: MakeCollectorOpts) -> Self {
        assert!(mk_opts.buckets.is_none());
        Self::with_opts(mk_opts.opts).expect("defining a counter")
    }
}

impl<T> MakeCollector for GenericCounterVec<T>
where
    T: Atomic + 'static,
{
    fn make_collector(mk_opts: MakeCollectorOpts) -> Self {
        assert!(mk_opts.buckets.is_none());
        let labels = variable_labels(&mk_opts.opts);
        let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();
        Self::new(mk_opts.opts, label_refs.as_slice()).expect("defining a counter vec")
    }
}

impl<T> MakeCollector for GenericGauge<T>
where
    T: Atomic + 'static,
{
    fn make_collector(mk_opts: MakeCollectorOpts) -> Self {
        assert!(mk_opts.buckets.is_none());
        Self::with_opts(mk_opts.opts).expect("defining a gauge")
    }
}

impl<T> MakeCollector for GenericGaugeVec<T>
where
    T: Atomic + 'static,
{
    fn make_collector(mk_opts: MakeCollectorOpts) -> Self {
        assert!(mk_opts.buckets.is_none());
        let labels = variable_labels(&mk_opts.opts);
        let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();
        Self::new(mk_opts.opts, label_refs.as_slice()).expect("defining a gauge vec")
    }
}

impl MakeCollector for Histogram {
    fn make_collector(mk_opts: MakeCollectorOpts) -> Self {
        let buckets = mk_opts.buckets.unwrap_or_else(|| HISTOGRAM_BUCKETS.to_vec());
        Self::with_opts(HistogramOpts {
            common_opts: mk_opts.opts,
            buckets,
        })
        .expect("defining a histogram")
    }
}

impl MakeCollector for HistogramVec {
    fn make_collector(mk_opts: MakeCollectorOpts) -> Self {
        let labels = variable_labels(&mk_opts.opts);
        let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();
        let buckets = mk_opts.buckets.unwrap_or_else(|| HISTOGRAM_BUCKETS.to_vec());
        Self::new(
            HistogramOpts {
                common_opts: mk_opts.opts,
                buckets,
            },
            label_refs.as_slice(),
        )
        .expect("defining a histogram vec")
    }
}

/// A [`GenericGauge`] whose value is computed whenever it is observed.
pub struct ComputedGenericGauge<P>
where
    P: Atomic,
{
    gauge: GenericGauge<P>,
    f: Arc<dyn Fn() -> P::T + Send + Sync>,
}

impl<P> fmt::Debug for ComputedGenericGauge<P>
where
    P: Atomic + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ComputedGenericGauge")
            .field("gauge", &self.gauge)
            .finish_non_exhaustive()
    }
}

impl<P> Clone for ComputedGenericGauge<P>
where
    P: Atomic,
{
    fn clone(&self) -> ComputedGenericGauge<P> {
        ComputedGenericGauge {
            gauge: self.gauge.clone(),
            f: Arc::clone(&self.f),
        }
    }
}

impl<T> Collector for ComputedGenericGauge<T>
where
    T: Atomic,
{
    fn desc(&self) -> Vec<&prometheus::core::Desc> {
        self.gauge.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.gauge.set((self.f)());
        self.gauge.collect()
    }
}

impl<P> ComputedGenericGauge<P>
where
    P: Atomic,
{
    /// Computes the current value of the gauge.
    pub fn get(&self) -> P::T {
        (self.f)()
    }
}

/// A [`ComputedGenericGauge`] for 64-bit unsigned integers.
pub type ComputedUIntGauge = ComputedGenericGauge<AtomicU64>;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::metric;

    #[test]
    fn test_register_and_gather() {
        let registry = MetricsRegistry::new();
        let counter: IntCounterVec = registry.register(metric!(
            name: "mz_test_events_total",
            help: "Events seen by the test.",
            var_labels: ["kind"],
        ));
        let histogram: Histogram = registry.register(metric!(
            name: "mz_test_latency_seconds",
            help: "Latency seen by the test.",
            buckets: vec![0.5, 1.0],
        ));
        counter.with_label_values(&["a"]).inc();
        counter.with_label_values(&["a"]).inc();
        histogram.observe(0.75);

        let families = registry.gather();
        let events = families
            .iter()
            .find(|f| f.get_name() == "mz_test_events_total")
            .expect("counter registered");
        assert_eq!(events.get_metric()[0].get_counter().get_value(), 2.0);
        let latency = families
            .iter()
            .find(|f| f.get_name() == "mz_test_latency_seconds")
            .expect("histogram registered");
        assert_eq!(latency.get_metric()[0].get_histogram().get_bucket().len(), 2);
    }

    #[test]
    fn test_metric_opts() {
        let opts = metric!(
            name: "mz_test_opts",
            help: "Options built by the macro.",
            const_labels: { "component" => "dispatch" },
            var_labels: ["state"],
        );
        assert_eq!(opts.opts.name, "mz_test_opts");
        assert_eq!(opts.opts.const_labels["component"], "dispatch");
        assert_eq!(opts.opts.variable_labels, vec!["state".to_string()]);
        assert!(opts.buckets.is_none());

        // Histograms without explicit buckets fall back to the defaults.
        let registry = MetricsRegistry::new();
        let histogram: Histogram = registry.register(metric!(
            name: "mz_test_default_buckets",
            help: "A histogram with default buckets.",
        ));
        histogram.observe(0.01);
        let families = registry.gather();
        assert_eq!(
            families[0].get_metric()[0].get_histogram().get_bucket().len(),
            HISTOGRAM_BUCKETS.len()
        );
    }

    #[test]
    fn test_computed_gauge() {
        let registry = MetricsRegistry::new();
        let value = Arc::new(AtomicU64::new(3));
        let gauge: ComputedUIntGauge = registry.register_computed_gauge(
            metric!(
                name: "mz_test_computed",
                help: "A computed gauge.",
            ),
            {
                let value = Arc::clone(&value);
                move || value.load(Ordering::SeqCst)
            },
        );
        assert_eq!(gauge.get(), 3);
        value.store(7, Ordering::SeqCst);
        let families = registry.gather();
        assert_eq!(families[0].get_metric()[0].get_gauge().get_value(), 7.0);
    }
}
