// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Sessions and the collaborators that build them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::time::Duration;

use serde::Serialize;

use crate::error::DispatchError;
use crate::id::QueryId;
use crate::prepare::QueryType;
use crate::resource_group::ResourceGroupId;

/// The authenticated caller of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user: String,
    /// The authenticated principal, if the user was authenticated by a
    /// mechanism that produces one.
    pub principal: Option<String>,
    pub groups: BTreeSet<String>,
}

impl Identity {
    pub fn new(user: impl Into<String>) -> Self {
        Identity {
            user: user.into(),
            ..Default::default()
        }
    }
}

/// Caller supplied estimates of the resources a query needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceEstimates {
    pub execution_time: Option<Duration>,
    pub cpu_time: Option<Duration>,
    pub peak_memory_bytes: Option<u64>,
}

/// Everything the client told us about the session a query runs in.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub identity: Identity,
    pub source: Option<String>,
    pub client_tags: BTreeSet<String>,
    pub resource_estimates: ResourceEstimates,
    /// Session properties set explicitly by the client.
    pub system_properties: BTreeMap<String, String>,
    /// The transaction the client has open, if any.
    pub transaction_id: Option<String>,
}

impl SessionContext {
    pub fn new(identity: Identity) -> Self {
        SessionContext {
            identity,
            ..Default::default()
        }
    }
}

/// The materialized session of a single query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub query_id: QueryId,
    pub identity: Identity,
    pub source: Option<String>,
    pub client_tags: BTreeSet<String>,
    pub resource_estimates: ResourceEstimates,
    pub system_properties: BTreeMap<String, String>,
    pub transaction_id: Option<String>,
}

impl Session {
    /// Builds a session from nothing but the identifying parts of a context.
    ///
    /// Used when a query fails before its real session could be built.
    pub fn minimal(query_id: QueryId, context: &SessionContext) -> Self {
        Session {
            query_id,
            identity: context.identity.clone(),
            source: context.source.clone(),
            client_tags: BTreeSet::new(),
            resource_estimates: ResourceEstimates::default(),
            system_properties: BTreeMap::new(),
            transaction_id: None,
        }
    }

    /// Fills in `defaults` for every property the client did not set.
    pub fn with_default_properties(mut self, defaults: BTreeMap<String, String>) -> Self {
        for (name, value) in defaults {
            self.system_properties.entry(name).or_insert(value);
        }
        self
    }
}

/// Builds the [`Session`] of a query from its [`SessionContext`].
pub trait SessionSupplier: Debug + Send + Sync {
    fn create_session(
        &self,
        query_id: &QueryId,
        context: &SessionContext,
    ) -> Result<Session, DispatchError>;
}

/// The stock [`SessionSupplier`], which copies the context into the session.
#[derive(Debug, Clone, Default)]
pub struct QuerySessionSupplier;

impl SessionSupplier for QuerySessionSupplier {
    fn create_session(
        &self,
        query_id: &QueryId,
        context: &SessionContext,
    ) -> Result<Session, DispatchError> {
        if context.identity.user.is_empty() {
            return Err(DispatchError::InvalidSessionContext(
                "user must be set".into(),
            ));
        }
        Ok(Session {
            query_id: query_id.clone(),
            identity: context.identity.clone(),
            source: context.source.clone(),
            client_tags: context.client_tags.clone(),
            resource_estimates: context.resource_estimates.clone(),
            system_properties: context.system_properties.clone(),
            transaction_id: context.transaction_id.clone(),
        })
    }
}

/// Supplies system default session properties for a query once its resource
/// group is known.
pub trait SessionPropertyDefaults: Debug + Send + Sync {
    /// Returns the defaults that apply to `session` in `resource_group`.
    ///
    /// Callers apply the result with [`Session::with_default_properties`], so
    /// implementations need not filter out properties the client already set.
    fn system_defaults(
        &self,
        session: &Session,
        query_type: Option<QueryType>,
        resource_group: &ResourceGroupId,
    ) -> BTreeMap<String, String>;
}

/// Default properties from static configuration: a global set, overlaid by a
/// set per resource group.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionPropertyDefaults {
    global: BTreeMap<String, String>,
    by_group: BTreeMap<ResourceGroupId, BTreeMap<String, String>>,
}

impl StaticSessionPropertyDefaults {
    pub fn new(global: BTreeMap<String, String>) -> Self {
        StaticSessionPropertyDefaults {
            global,
            by_group: BTreeMap::new(),
        }
    }

    /// Sets the defaults specific to `group`, which win over global defaults.
    pub fn with_group(
        mut self,
        group: ResourceGroupId,
        defaults: BTreeMap<String, String>,
    ) -> Self {
        self.by_group.insert(group, defaults);
        self
    }
}

impl SessionPropertyDefaults for StaticSessionPropertyDefaults {
    fn system_defaults(
        &self,
        _session: &Session,
        _query_type: Option<QueryType>,
        resource_group: &ResourceGroupId,
    ) -> BTreeMap<String, String> {
        let mut defaults = self.global.clone();
        if let Some(group) = self.by_group.get(resource_group) {
            defaults.extend(group.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        defaults
    }
}
