// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Admission of submitted queries into the dispatch pipeline.
//!
//! Submitting a query only appends it to a pending batch, so callers are never
//! held up by query creation. A background task drains the batch periodically
//! and creates each query in its own task.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::FutureExt;
use mz_dyncfg::ConfigSet;
use mz_ore::cast::CastLossy;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::dyncfgs::ADMISSION_BATCH_INTERVAL;
use crate::error::DispatchError;
use crate::id::{QueryId, Slug};
use crate::metrics::Metrics;
use crate::pipeline::DispatchPipeline;
use crate::session::SessionContext;

/// A query accepted for creation.
#[derive(Debug, Clone)]
pub struct QueryCreationRequest {
    pub query_id: QueryId,
    pub slug: Slug,
    pub session_context: SessionContext,
    pub query: String,
}

#[derive(Debug)]
struct PendingCreation {
    request: QueryCreationRequest,
    tx: oneshot::Sender<Result<(), DispatchError>>,
}

/// Resolves once the query of a submission has been registered.
///
/// Resolving with `Ok` does not mean the query succeeded, only that it can be
/// looked up; the query itself may have failed. Dropping a `QueryCreation`
/// does not withdraw the submission.
#[derive(Debug)]
pub struct QueryCreation {
    rx: oneshot::Receiver<Result<(), DispatchError>>,
}

impl Future for QueryCreation {
    type Output = Result<(), DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx.poll_unpin(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(DispatchError::Internal(
                    "query creation abandoned before completion".into(),
                ))
            })
        })
    }
}

#[derive(Debug, Default)]
struct PendingBatch {
    creations: Vec<PendingCreation>,
    /// Set once the queue stops; no further submissions are accepted.
    stopped: bool,
}

#[derive(Debug)]
pub(crate) struct AdmissionQueue {
    pending: Mutex<PendingBatch>,
    pipeline: Arc<DispatchPipeline>,
    configs: ConfigSet,
    metrics: Metrics,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl AdmissionQueue {
    pub(crate) fn new(pipeline: Arc<DispatchPipeline>, configs: ConfigSet, metrics: Metrics) -> Self {
        AdmissionQueue {
            pending: Mutex::new(PendingBatch::default()),
            pipeline,
            configs,
            metrics,
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Appends `request` to the pending batch.
    ///
    /// Errors once the queue is stopped, since nothing would drain it.
    pub(crate) fn submit(
        &self,
        request: QueryCreationRequest,
    ) -> Result<QueryCreation, DispatchError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("lock poisoned");
            if pending.stopped {
                debug!(query_id = %request.query_id, "refusing submission to stopped admission");
                return Err(DispatchError::Internal("dispatch manager stopped".into()));
            }
            pending.creations.push(PendingCreation { request, tx });
        }
        self.metrics.queries_submitted.inc();
        Ok(QueryCreation { rx })
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().expect("lock poisoned").creations.len()
    }

    /// Takes the pending batch and spawns the creation of every query in it,
    /// returning the size of the batch.
    ///
    /// Submissions that arrive while the batch is processed start a new batch.
    /// Must be called from within a tokio runtime.
    pub(crate) fn drain(&self) -> usize {
        let batch = std::mem::take(&mut self.pending.lock().expect("lock poisoned").creations);
        if batch.is_empty() {
            return 0;
        }
        let len = batch.len();
        debug!(len, "draining admission batch");
        self.metrics
            .admission_batch_size
            .observe(f64::cast_lossy(len));

        for PendingCreation { request, tx } in batch {
            let pipeline = Arc::clone(&self.pipeline);
            let name = format!("create_query:{}", request.query_id);
            mz_ore::task::spawn(move || name, async move {
                let query_id = request.query_id.clone();
                let result = AssertUnwindSafe(pipeline.create_query(request))
                    .catch_unwind()
                    .await
                    .map_err(|payload| {
                        let msg = mz_ore::panic::payload_str(payload.as_ref());
                        error!(%query_id, "query creation panicked: {msg}");
                        DispatchError::Internal(format!("query creation panicked: {msg}"))
                    });
                // The submitter may no longer be waiting.
                let _ = tx.send(result);
            });
        }
        len
    }

    /// Starts draining the pending batch periodically. Does nothing if already
    /// started.
    ///
    /// Accepts submissions again if the queue was stopped.
    pub(crate) fn start(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        self.pending.lock().expect("lock poisoned").stopped = false;
        {
            let mut guard = self.shutdown_tx.lock().expect("lock poisoned");
            if guard.is_some() {
                return;
            }
            *guard = Some(shutdown_tx);
        }

        let period = ADMISSION_BATCH_INTERVAL.get(&self.configs);
        let queue = Arc::downgrade(self);
        mz_ore::task::spawn(|| "admission_batcher", async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        let Some(queue) = queue.upgrade() else {
                            break;
                        };
                        let result =
                            mz_ore::panic::catch_unwind_str(AssertUnwindSafe(|| queue.drain()));
                        if let Err(msg) = result {
                            warn!("admission drain panicked: {msg}");
                        }
                    }
                }
            }
            debug!("shutting down admission batcher");
        });
    }

    /// Stops periodic draining and refuses further submissions. Pending
    /// submissions stay pending until the next call to [`Self::drain`].
    pub(crate) fn stop(&self) {
        self.pending.lock().expect("lock poisoned").stopped = true;
        if let Some(shutdown_tx) = self.shutdown_tx.lock().expect("lock poisoned").take() {
            let _ = shutdown_tx.send(());
        }
    }
}

impl Drop for AdmissionQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
