// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Query admission and dispatch.
//!
//! Clients submit queries to the [`DispatchManager`], which accepts them
//! without waiting for them to be created. Accepted queries are drained in
//! batches into the dispatch pipeline, which builds the query's session,
//! checks access, prepares the statement, selects a resource group and finally
//! registers the query with the [`QueryTracker`] and hands it to its resource
//! group. Creation never fails silently: if any step fails, a failed query is
//! registered in its place, so every accepted query id can be looked up.
//!
//! Tracked queries are kept until they have been done and idle for a while,
//! after which a background sweep removes them.

mod admission;
mod error;
mod id;
mod manager;
mod pipeline;
mod query;
mod state;
mod tracker;

pub mod access;
pub mod dyncfgs;
pub mod metrics;
pub mod prepare;
pub mod resource_group;
pub mod session;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use crate::admission::{QueryCreation, QueryCreationRequest};
pub use crate::error::DispatchError;
pub use crate::id::{QueryId, QueryIdGenerator, Slug};
pub use crate::manager::{DispatchManager, DispatchManagerConfig};
pub use crate::pipeline::DispatchCollaborators;
pub use crate::query::{
    DefaultFailedDispatchQueryFactory, DispatchQuery, DispatchQueryFactory, FailedDispatchQuery,
    FailedDispatchQueryFactory, LocalDispatchQuery, LocalDispatchQueryFactory,
};
pub use crate::state::{
    BasicQueryInfo, BasicQueryStats, DispatchInfo, QueryMetadata, QueryState, QueryStateMachine,
    StateChangeListener,
};
pub use crate::tracker::QueryTracker;
