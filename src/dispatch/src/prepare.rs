// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The interface to statement preparation.

use std::fmt::Debug;

use serde::Serialize;

use crate::error::DispatchError;
use crate::session::Session;

/// The coarse kind of a statement, as far as dispatch is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum StatementKind {
    Select,
    Explain,
    Describe,
    Insert,
    Update,
    Delete,
    CreateTableAs,
    DataDefinition,
    StartTransaction,
    Commit,
    Rollback,
    Other,
}

impl StatementKind {
    /// The query type used for resource group selection, if the statement has
    /// one.
    pub fn query_type(&self) -> Option<QueryType> {
        match self {
            StatementKind::Select => Some(QueryType::Select),
            StatementKind::Explain => Some(QueryType::Explain),
            StatementKind::Describe => Some(QueryType::Describe),
            StatementKind::Insert | StatementKind::CreateTableAs => Some(QueryType::Insert),
            StatementKind::Update => Some(QueryType::Update),
            StatementKind::Delete => Some(QueryType::Delete),
            StatementKind::DataDefinition => Some(QueryType::DataDefinition),
            StatementKind::StartTransaction
            | StatementKind::Commit
            | StatementKind::Rollback
            | StatementKind::Other => None,
        }
    }

    pub fn is_transaction_control(&self) -> bool {
        matches!(
            self,
            StatementKind::StartTransaction | StatementKind::Commit | StatementKind::Rollback
        )
    }
}

/// The category a statement falls in for resource group selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum QueryType {
    Select,
    Explain,
    Describe,
    Insert,
    Update,
    Delete,
    DataDefinition,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Select => "SELECT",
            QueryType::Explain => "EXPLAIN",
            QueryType::Describe => "DESCRIBE",
            QueryType::Insert => "INSERT",
            QueryType::Update => "UPDATE",
            QueryType::Delete => "DELETE",
            QueryType::DataDefinition => "DATA_DEFINITION",
        }
    }
}

/// A parsed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub kind: StatementKind,
    /// The normalized text of the statement.
    pub sql: String,
}

/// The result of preparing a query's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedQuery {
    pub statement: Statement,
    /// The text of the prepared statement, when the query executes one.
    pub prepare_sql: Option<String>,
}

impl PreparedQuery {
    pub fn query_type(&self) -> Option<QueryType> {
        self.statement.kind.query_type()
    }

    pub fn is_transaction_control(&self) -> bool {
        self.statement.kind.is_transaction_control()
    }
}

/// Parses and normalizes query text.
pub trait QueryPreparer: Debug + Send + Sync {
    /// Returns [`DispatchError::MalformedStatement`] if `sql` does not parse.
    fn prepare_query(&self, session: &Session, sql: &str) -> Result<PreparedQuery, DispatchError>;
}
