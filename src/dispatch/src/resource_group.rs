// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The interface to resource group selection and admission.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::DispatchError;
use crate::prepare::QueryType;
use crate::query::DispatchQuery;
use crate::session::ResourceEstimates;

/// The dotted path of a resource group, e.g. `global.adhoc.alice`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceGroupId(Vec<String>);

impl ResourceGroupId {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ResourceGroupId(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ResourceGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// The facts about a query that resource group selectors match on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionCriteria {
    pub authenticated: bool,
    pub user: String,
    pub user_groups: BTreeSet<String>,
    pub source: Option<String>,
    pub client_tags: BTreeSet<String>,
    pub resource_estimates: ResourceEstimates,
    pub query_type: Option<QueryType>,
}

/// The outcome of resource group selection.
///
/// `context` is opaque to dispatch and handed back to the
/// [`ResourceGroupManager`] on submission.
#[derive(Clone)]
pub struct SelectionContext {
    pub resource_group_id: ResourceGroupId,
    pub context: Arc<dyn Any + Send + Sync>,
}

impl SelectionContext {
    pub fn new(resource_group_id: ResourceGroupId) -> Self {
        SelectionContext {
            resource_group_id,
            context: Arc::new(()),
        }
    }
}

impl Debug for SelectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionContext")
            .field("resource_group_id", &self.resource_group_id)
            .finish_non_exhaustive()
    }
}

/// Places queries in resource groups and admits them for execution.
#[async_trait]
pub trait ResourceGroupManager: Debug + Send + Sync {
    /// Chooses the resource group `criteria` belong to.
    ///
    /// Returns [`DispatchError::NoResourceGroup`] if no group matches.
    async fn select_group(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<SelectionContext, DispatchError>;

    /// Hands `query` to its resource group, which starts it once capacity
    /// allows by calling [`DispatchQuery::start_waiting_for_resources`].
    ///
    /// Must not block. An error means the group refused the query outright.
    fn submit(
        &self,
        query: Arc<dyn DispatchQuery>,
        selection: SelectionContext,
    ) -> Result<(), DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[mz_ore::test]
    fn resource_group_id() {
        let id = ResourceGroupId::new(["global", "adhoc"]);
        assert_eq!(id.to_string(), "global.adhoc");
        assert_eq!(id.segments().len(), 2);
        assert!(ResourceGroupId::new(["global"]) < id);
    }
}
