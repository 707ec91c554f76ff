// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Fakes of the services dispatch depends on, for tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mz_dyncfg::ConfigSet;
use mz_ore::cast::duration_to_millis_saturating;
use mz_ore::metrics::MetricsRegistry;
use mz_ore::now::{EpochMillis, NowFn};

use crate::access::AccessControl;
use crate::dyncfgs::all_dyncfgs;
use crate::error::DispatchError;
use crate::id::QueryId;
use crate::manager::{DispatchManager, DispatchManagerConfig};
use crate::pipeline::DispatchCollaborators;
use crate::prepare::{PreparedQuery, QueryPreparer, Statement, StatementKind};
use crate::query::{DefaultFailedDispatchQueryFactory, DispatchQuery, LocalDispatchQueryFactory};
use crate::resource_group::{
    ResourceGroupId, ResourceGroupManager, SelectionContext, SelectionCriteria,
};
use crate::session::{
    Identity, QuerySessionSupplier, Session, SessionContext, StaticSessionPropertyDefaults,
};
use crate::state::QueryMetadata;
use crate::transaction::NoTransactionManager;

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(millis: EpochMillis) -> Self {
        ManualClock {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    pub fn now_fn(&self) -> NowFn {
        let millis = Arc::clone(&self.millis);
        NowFn::from(move || millis.load(Ordering::SeqCst))
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(duration_to_millis_saturating(by), Ordering::SeqCst);
    }

    pub fn set(&self, millis: EpochMillis) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

pub fn test_configs() -> ConfigSet {
    all_dyncfgs(ConfigSet::default())
}

pub fn context(user: &str) -> SessionContext {
    SessionContext::new(Identity::new(user))
}

pub fn metadata(id: &str, sql: &str) -> QueryMetadata {
    let query_id = QueryId::new(id).expect("valid query id");
    QueryMetadata {
        session: Session::minimal(query_id, &context("alice")),
        query: sql.into(),
        prepare_sql: None,
        query_type: None,
        resource_group_id: None,
    }
}

/// Classifies statements by their first keyword and rejects unknown ones.
///
/// The keyword `PANIC` panics.
#[derive(Debug, Default)]
pub struct TestPreparer;

impl QueryPreparer for TestPreparer {
    fn prepare_query(&self, _session: &Session, sql: &str) -> Result<PreparedQuery, DispatchError> {
        let keyword = sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        let kind = match keyword.as_str() {
            "SELECT" => StatementKind::Select,
            "EXPLAIN" => StatementKind::Explain,
            "INSERT" => StatementKind::Insert,
            "START" => StatementKind::StartTransaction,
            "COMMIT" => StatementKind::Commit,
            "ROLLBACK" => StatementKind::Rollback,
            "PANIC" => panic!("preparer exploded"),
            _ => {
                return Err(DispatchError::MalformedStatement(format!(
                    "mismatched input '{keyword}'"
                )))
            }
        };
        Ok(PreparedQuery {
            statement: Statement {
                kind,
                sql: sql.trim().to_string(),
            },
            prepare_sql: None,
        })
    }
}

#[derive(Debug, Default)]
pub struct TestAccessControl {
    pub denied_users: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl AccessControl for TestAccessControl {
    async fn check_can_execute_query(&self, identity: &Identity) -> Result<(), DispatchError> {
        if self.denied_users.lock().unwrap().contains(&identity.user) {
            return Err(DispatchError::AccessDenied(format!(
                "user {} cannot execute queries",
                identity.user
            )));
        }
        Ok(())
    }
}

/// Places every query in `global.<user>` and remembers what was submitted.
///
/// Submitted queries stay queued until [`Self::start_all`] unless
/// `start_immediately` is set. `panic_on_submit` makes submission panic.
#[derive(Debug, Default)]
pub struct TestResourceGroupManager {
    pub reject_submissions: AtomicBool,
    pub panic_on_submit: AtomicBool,
    pub no_matching_group: AtomicBool,
    pub start_immediately: AtomicBool,
    pub submitted: Mutex<Vec<Arc<dyn DispatchQuery>>>,
}

impl TestResourceGroupManager {
    pub fn submitted_ids(&self) -> Vec<QueryId> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|query| query.query_id().clone())
            .collect()
    }

    pub fn start_all(&self) {
        for query in self.submitted.lock().unwrap().iter() {
            query.start_waiting_for_resources();
        }
    }
}

#[async_trait]
impl ResourceGroupManager for TestResourceGroupManager {
    async fn select_group(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<SelectionContext, DispatchError> {
        if self.no_matching_group.load(Ordering::SeqCst) {
            return Err(DispatchError::NoResourceGroup(criteria.user.clone()));
        }
        Ok(SelectionContext::new(ResourceGroupId::new([
            "global",
            criteria.user.as_str(),
        ])))
    }

    fn submit(
        &self,
        query: Arc<dyn DispatchQuery>,
        _selection: SelectionContext,
    ) -> Result<(), DispatchError> {
        if self.panic_on_submit.load(Ordering::SeqCst) {
            panic!("resource groups exploded");
        }
        if self.reject_submissions.load(Ordering::SeqCst) {
            return Err(DispatchError::SubmissionRejected("queue full".into()));
        }
        if self.start_immediately.load(Ordering::SeqCst) {
            query.start_waiting_for_resources();
        }
        self.submitted.lock().unwrap().push(query);
        Ok(())
    }
}

/// A [`DispatchManager`] wired to fakes.
#[derive(Debug)]
pub struct TestHarness {
    pub clock: ManualClock,
    pub configs: ConfigSet,
    pub registry: MetricsRegistry,
    pub access_control: Arc<TestAccessControl>,
    pub resource_groups: Arc<TestResourceGroupManager>,
    pub manager: DispatchManager,
}

impl TestHarness {
    pub fn new() -> Self {
        let clock = ManualClock::new(1_700_000_000_000);
        let configs = test_configs();
        let registry = MetricsRegistry::new();
        let access_control = Arc::new(TestAccessControl::default());
        let resource_groups = Arc::new(TestResourceGroupManager::default());
        let property_defaults = StaticSessionPropertyDefaults::new(BTreeMap::from([(
            "query_max_memory".to_string(),
            "1GB".to_string(),
        )]));
        let collaborators = DispatchCollaborators {
            session_supplier: Arc::new(QuerySessionSupplier),
            access_control: Arc::clone(&access_control) as _,
            query_preparer: Arc::new(TestPreparer),
            resource_group_manager: Arc::clone(&resource_groups) as _,
            session_property_defaults: Arc::new(property_defaults),
            transaction_manager: Arc::new(NoTransactionManager),
            dispatch_query_factory: Arc::new(LocalDispatchQueryFactory::new(clock.now_fn())),
            failed_dispatch_query_factory: Arc::new(DefaultFailedDispatchQueryFactory::new(
                clock.now_fn(),
            )),
        };
        let manager = DispatchManager::new(DispatchManagerConfig {
            collaborators,
            configs: configs.clone(),
            metrics_registry: registry.clone(),
            now: clock.now_fn(),
        });
        TestHarness {
            clock,
            configs,
            registry,
            access_control,
            resource_groups,
            manager,
        }
    }
}
