// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Turns submitted queries into registered dispatch queries.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use mz_dyncfg::ConfigSet;
use tracing::{debug, error, warn};

use crate::access::AccessControl;
use crate::admission::QueryCreationRequest;
use crate::dyncfgs::MAX_QUERY_LENGTH;
use crate::error::DispatchError;
use crate::id::{QueryId, Slug};
use crate::metrics::Metrics;
use crate::prepare::{PreparedQuery, QueryPreparer};
use crate::query::{DispatchQuery, DispatchQueryFactory, FailedDispatchQueryFactory};
use crate::resource_group::{ResourceGroupManager, SelectionContext, SelectionCriteria};
use crate::session::{Session, SessionContext, SessionPropertyDefaults, SessionSupplier};
use crate::tracker::QueryTracker;
use crate::transaction::TransactionManager;

/// The external services that query creation consults.
#[derive(Debug, Clone)]
pub struct DispatchCollaborators {
    pub session_supplier: Arc<dyn SessionSupplier>,
    pub access_control: Arc<dyn AccessControl>,
    pub query_preparer: Arc<dyn QueryPreparer>,
    pub resource_group_manager: Arc<dyn ResourceGroupManager>,
    pub session_property_defaults: Arc<dyn SessionPropertyDefaults>,
    pub transaction_manager: Arc<dyn TransactionManager>,
    pub dispatch_query_factory: Arc<dyn DispatchQueryFactory>,
    pub failed_dispatch_query_factory: Arc<dyn FailedDispatchQueryFactory>,
}

/// Whatever was built before query creation failed, used to describe the
/// failed query as faithfully as possible.
struct PartialCreation {
    /// The query text, truncated if it was too long.
    query: String,
    session: Option<Session>,
    prepared: Option<PreparedQuery>,
}

#[derive(Debug)]
pub(crate) struct DispatchPipeline {
    collaborators: DispatchCollaborators,
    tracker: Arc<QueryTracker>,
    configs: ConfigSet,
    metrics: Metrics,
}

impl DispatchPipeline {
    pub(crate) fn new(
        collaborators: DispatchCollaborators,
        tracker: Arc<QueryTracker>,
        configs: ConfigSet,
        metrics: Metrics,
    ) -> Self {
        DispatchPipeline {
            collaborators,
            tracker,
            configs,
            metrics,
        }
    }

    /// Creates, registers and submits the query described by `request`.
    ///
    /// Always registers a query under the requested id unless one is already
    /// registered: if creation fails at any point before registration, a
    /// failed query carrying the error is registered instead.
    #[tracing::instrument(level = "debug", skip_all, fields(query_id = %request.query_id))]
    pub(crate) async fn create_query(&self, request: QueryCreationRequest) {
        let start = Instant::now();
        let QueryCreationRequest {
            query_id,
            slug,
            session_context,
            query,
        } = request;
        let mut partial = PartialCreation {
            query,
            session: None,
            prepared: None,
        };

        // A panicking collaborator fails the query like any other error.
        let built = AssertUnwindSafe(self.build_dispatch_query(
            &query_id,
            &slug,
            &session_context,
            &mut partial,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            let msg = mz_ore::panic::payload_str(payload.as_ref());
            error!(%query_id, "query creation panicked: {msg}");
            Err(DispatchError::Internal(format!(
                "query creation panicked: {msg}"
            )))
        });
        let outcome = match built {
            Ok((dispatch_query, selection)) => {
                if self.query_created(&dispatch_query) && !dispatch_query.is_done() {
                    let resource_groups = &self.collaborators.resource_group_manager;
                    let submitted = mz_ore::panic::catch_unwind_str(AssertUnwindSafe(|| {
                        resource_groups.submit(Arc::clone(&dispatch_query), selection)
                    }))
                    .unwrap_or_else(|msg| {
                        error!(%query_id, "resource group submission panicked: {msg}");
                        Err(DispatchError::Internal(format!(
                            "resource group submission panicked: {msg}"
                        )))
                    });
                    if let Err(error) = submitted {
                        // Already registered, so fail it rather than create a
                        // failed query.
                        warn!(%query_id, %error, "resource group rejected query");
                        dispatch_query.fail(error);
                    }
                }
                "created"
            }
            Err(error) => {
                debug!(%query_id, %error, "query creation failed");
                self.metrics
                    .creation_failures
                    .with_label_values(&[error.code()])
                    .inc();
                let PartialCreation {
                    query,
                    session,
                    prepared,
                } = partial;
                let session =
                    session.unwrap_or_else(|| Session::minimal(query_id.clone(), &session_context));
                let prepare_sql = prepared.and_then(|prepared| prepared.prepare_sql);
                let failed = self
                    .collaborators
                    .failed_dispatch_query_factory
                    .create_failed_dispatch_query(session, query, prepare_sql, slug, error);
                self.query_created(&failed);
                "failed"
            }
        };
        self.metrics
            .creation_seconds
            .with_label_values(&[outcome])
            .observe(start.elapsed().as_secs_f64());
    }

    /// Runs every fallible step of query creation up to building the handle.
    ///
    /// Records its progress in `partial` so that a failure can be reported
    /// with as much context as was available.
    async fn build_dispatch_query(
        &self,
        query_id: &QueryId,
        slug: &Slug,
        context: &SessionContext,
        partial: &mut PartialCreation,
    ) -> Result<(Arc<dyn DispatchQuery>, SelectionContext), DispatchError> {
        let c = &self.collaborators;

        let max = MAX_QUERY_LENGTH.get(&self.configs);
        let length = partial.query.chars().count();
        if length > max {
            partial.query = partial.query.chars().take(max).collect();
            return Err(DispatchError::QueryTextTooLarge { length, max });
        }

        let session = c.session_supplier.create_session(query_id, context)?;
        partial.session = Some(session.clone());

        c.access_control
            .check_can_execute_query(&context.identity)
            .await?;

        let prepared = c.query_preparer.prepare_query(&session, &partial.query)?;
        partial.prepared = Some(prepared.clone());

        let query_type = prepared.query_type();
        let criteria = SelectionCriteria {
            authenticated: context.identity.principal.is_some(),
            user: context.identity.user.clone(),
            user_groups: context.identity.groups.clone(),
            source: context.source.clone(),
            client_tags: context.client_tags.clone(),
            resource_estimates: context.resource_estimates.clone(),
            query_type,
        };
        let selection = c.resource_group_manager.select_group(&criteria).await?;

        let defaults = c.session_property_defaults.system_defaults(
            &session,
            query_type,
            &selection.resource_group_id,
        );
        let session = session.with_default_properties(defaults);
        partial.session = Some(session.clone());

        c.transaction_manager
            .activate_transaction(&session, prepared.is_transaction_control())?;

        let dispatch_query = c.dispatch_query_factory.create_dispatch_query(
            session,
            partial.query.clone(),
            &prepared,
            slug.clone(),
            selection.resource_group_id.clone(),
        )?;
        Ok((dispatch_query, selection))
    }

    /// Registers `query`, returning false if its id was already taken.
    fn query_created(&self, query: &Arc<dyn DispatchQuery>) -> bool {
        if !self.tracker.add_query(Arc::clone(query)) {
            debug!(query_id = %query.query_id(), "query already registered");
            return false;
        }

        // Terminal queries must be queued for expiration or they leak.
        let tracker = Arc::downgrade(&self.tracker);
        let query_id = query.query_id().clone();
        query.add_state_change_listener(Arc::new(move |state| {
            if !state.is_done() {
                return;
            }
            if let Some(tracker) = tracker.upgrade() {
                tracker.expire_query(&query_id);
            }
        }));
        self.metrics.track_query(query);
        true
    }
}
