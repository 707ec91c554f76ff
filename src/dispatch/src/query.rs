// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dispatch query handles and the factories that build them.

use std::fmt::Debug;
use std::sync::Arc;

use futures::future::BoxFuture;
use mz_ore::now::{EpochMillis, NowFn};
use tracing::debug;

use crate::error::DispatchError;
use crate::id::{QueryId, Slug};
use crate::prepare::PreparedQuery;
use crate::resource_group::ResourceGroupId;
use crate::session::Session;
use crate::state::{
    BasicQueryInfo, DispatchInfo, QueryMetadata, QueryState, QueryStateMachine,
    StateChangeListener,
};

/// A handle to one submitted query, from admission until it is reaped.
///
/// Handles are shared between the query tracker, the resource group that
/// runs the query and status pollers. Reads are served by the handle's
/// [`QueryStateMachine`]; transitions are up to each implementation.
pub trait DispatchQuery: Debug + Send + Sync {
    fn state_machine(&self) -> &QueryStateMachine;

    /// The capability token that authorizes polling this query.
    fn slug(&self) -> &Slug;

    /// Called by the resource group once the query may start.
    fn start_waiting_for_resources(&self);

    /// Cancels the query. Does nothing if it is already done.
    fn cancel(&self);

    /// Fails the query with `error`. Does nothing if it is already done.
    fn fail(&self, error: DispatchError);

    fn query_id(&self) -> &QueryId {
        self.state_machine().query_id()
    }

    fn session(&self) -> &Session {
        &self.state_machine().metadata().session
    }

    fn state(&self) -> QueryState {
        self.state_machine().state()
    }

    fn is_done(&self) -> bool {
        self.state().is_done()
    }

    fn error(&self) -> Option<DispatchError> {
        self.state_machine().error()
    }

    fn create_time(&self) -> EpochMillis {
        self.state_machine().create_time()
    }

    fn end_time(&self) -> Option<EpochMillis> {
        self.state_machine().end_time()
    }

    fn last_heartbeat(&self) -> EpochMillis {
        self.state_machine().last_heartbeat()
    }

    fn record_heartbeat(&self) {
        self.state_machine().record_heartbeat()
    }

    fn is_fully_blocked(&self) -> bool {
        self.state_machine().is_fully_blocked()
    }

    fn basic_query_info(&self) -> BasicQueryInfo {
        self.state_machine().basic_query_info()
    }

    fn dispatch_info(&self) -> DispatchInfo {
        self.state_machine().dispatch_info()
    }

    fn dispatched(&self) -> BoxFuture<'static, ()> {
        self.state_machine().dispatched()
    }

    fn done(&self) -> BoxFuture<'static, QueryState> {
        self.state_machine().done()
    }

    fn add_state_change_listener(&self, listener: StateChangeListener) {
        self.state_machine().add_state_change_listener(listener)
    }
}

/// A query that is dispatched to a resource group and run in this process.
#[derive(Debug)]
pub struct LocalDispatchQuery {
    state_machine: QueryStateMachine,
    slug: Slug,
}

impl LocalDispatchQuery {
    pub fn new(metadata: QueryMetadata, slug: Slug, now: NowFn) -> Self {
        LocalDispatchQuery {
            state_machine: QueryStateMachine::begin(metadata, now),
            slug,
        }
    }

    /// Marks the query as having completed successfully.
    pub fn finish(&self) -> bool {
        self.state_machine.transition_to_finished()
    }

    /// Records whether every driver of the query is blocked, which excludes it
    /// from the running count.
    pub fn set_fully_blocked(&self, fully_blocked: bool) {
        self.state_machine.set_fully_blocked(fully_blocked)
    }
}

impl DispatchQuery for LocalDispatchQuery {
    fn state_machine(&self) -> &QueryStateMachine {
        &self.state_machine
    }

    fn slug(&self) -> &Slug {
        &self.slug
    }

    fn start_waiting_for_resources(&self) {
        if self.state_machine.transition_to_running() {
            debug!(query_id = %self.query_id(), "query dispatched");
        }
    }

    fn cancel(&self) {
        if self.state_machine.transition_to_canceled() {
            debug!(query_id = %self.query_id(), "query canceled");
        }
    }

    fn fail(&self, error: DispatchError) {
        let code = error.code();
        if self.state_machine.transition_to_failed(error) {
            debug!(query_id = %self.query_id(), code, "query failed");
        }
    }
}

/// A query that failed before it could be dispatched.
///
/// It is created in the failed state and ignores all transitions.
#[derive(Debug)]
pub struct FailedDispatchQuery {
    state_machine: QueryStateMachine,
    slug: Slug,
}

impl FailedDispatchQuery {
    pub fn new(metadata: QueryMetadata, slug: Slug, error: DispatchError, now: NowFn) -> Self {
        FailedDispatchQuery {
            state_machine: QueryStateMachine::failed(metadata, error, now),
            slug,
        }
    }
}

impl DispatchQuery for FailedDispatchQuery {
    fn state_machine(&self) -> &QueryStateMachine {
        &self.state_machine
    }

    fn slug(&self) -> &Slug {
        &self.slug
    }

    fn start_waiting_for_resources(&self) {}

    fn cancel(&self) {}

    fn fail(&self, _error: DispatchError) {}
}

/// Builds the handle of a query that was prepared and placed successfully.
pub trait DispatchQueryFactory: Debug + Send + Sync {
    fn create_dispatch_query(
        &self,
        session: Session,
        query: String,
        prepared: &PreparedQuery,
        slug: Slug,
        resource_group_id: ResourceGroupId,
    ) -> Result<Arc<dyn DispatchQuery>, DispatchError>;
}

/// Builds the handle of a query whose creation failed.
///
/// Must not fail: its result is the last resort for representing the query.
pub trait FailedDispatchQueryFactory: Debug + Send + Sync {
    fn create_failed_dispatch_query(
        &self,
        session: Session,
        query: String,
        prepare_sql: Option<String>,
        slug: Slug,
        error: DispatchError,
    ) -> Arc<dyn DispatchQuery>;
}

#[derive(Debug, Clone)]
pub struct LocalDispatchQueryFactory {
    now: NowFn,
}

impl LocalDispatchQueryFactory {
    pub fn new(now: NowFn) -> Self {
        LocalDispatchQueryFactory { now }
    }
}

impl DispatchQueryFactory for LocalDispatchQueryFactory {
    fn create_dispatch_query(
        &self,
        session: Session,
        query: String,
        prepared: &PreparedQuery,
        slug: Slug,
        resource_group_id: ResourceGroupId,
    ) -> Result<Arc<dyn DispatchQuery>, DispatchError> {
        let metadata = QueryMetadata {
            session,
            query,
            prepare_sql: prepared.prepare_sql.clone(),
            query_type: prepared.query_type(),
            resource_group_id: Some(resource_group_id),
        };
        Ok(Arc::new(LocalDispatchQuery::new(
            metadata,
            slug,
            self.now.clone(),
        )))
    }
}

#[derive(Debug, Clone)]
pub struct DefaultFailedDispatchQueryFactory {
    now: NowFn,
}

impl DefaultFailedDispatchQueryFactory {
    pub fn new(now: NowFn) -> Self {
        DefaultFailedDispatchQueryFactory { now }
    }
}

impl FailedDispatchQueryFactory for DefaultFailedDispatchQueryFactory {
    fn create_failed_dispatch_query(
        &self,
        session: Session,
        query: String,
        prepare_sql: Option<String>,
        slug: Slug,
        error: DispatchError,
    ) -> Arc<dyn DispatchQuery> {
        let metadata = QueryMetadata {
            session,
            query,
            prepare_sql,
            query_type: None,
            resource_group_id: None,
        };
        Arc::new(FailedDispatchQuery::new(
            metadata,
            slug,
            error,
            self.now.clone(),
        ))
    }
}
