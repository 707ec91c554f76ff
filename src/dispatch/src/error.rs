// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use thiserror::Error;

use crate::id::QueryId;

/// A failure to admit, prepare, or dispatch a query.
///
/// Errors are stored on the query they caused to fail and handed out to every
/// reader of that query, hence `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("query text is empty")]
    EmptyQuery,
    #[error("Query text length ({length}) exceeds the maximum length ({max})")]
    QueryTextTooLarge { length: usize, max: usize },
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("invalid session context: {0}")]
    InvalidSessionContext(String),
    #[error("{0}")]
    MalformedStatement(String),
    #[error("no resource group matched: {0}")]
    NoResourceGroup(String),
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),
    #[error("resource group rejected query: {0}")]
    SubmissionRejected(String),
    #[error("query {0} already registered")]
    DuplicateQueryId(QueryId),
    #[error("query {0} not found")]
    UnknownQueryId(QueryId),
    #[error("invalid query id {0:?}")]
    InvalidQueryId(String),
    #[error("query was abandoned by the client, as it may have exited; last heartbeat {}ms ago", .0.as_millis())]
    AbandonedQuery(Duration),
    #[error("query exceeded the maximum run time limit of {}ms", .0.as_millis())]
    ExceededTimeLimit(Duration),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// A stable code identifying the kind of error.
    ///
    /// Codes are used as metric label values and reported to clients in
    /// query info, so they must not change.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::EmptyQuery => "EMPTY_QUERY",
            DispatchError::QueryTextTooLarge { .. } => "QUERY_TEXT_TOO_LARGE",
            DispatchError::AccessDenied(_) => "PERMISSION_DENIED",
            DispatchError::InvalidSessionContext(_) => "INVALID_SESSION_PROPERTY",
            DispatchError::MalformedStatement(_) => "SYNTAX_ERROR",
            DispatchError::NoResourceGroup(_) => "QUERY_REJECTED",
            DispatchError::TransactionConflict(_) => "TRANSACTION_CONFLICT",
            DispatchError::SubmissionRejected(_) => "QUERY_QUEUE_FULL",
            DispatchError::DuplicateQueryId(_) => "DUPLICATE_QUERY_ID",
            DispatchError::UnknownQueryId(_) => "NOT_FOUND",
            DispatchError::InvalidQueryId(_) => "INVALID_QUERY_ID",
            DispatchError::AbandonedQuery(_) => "ABANDONED_QUERY",
            DispatchError::ExceededTimeLimit(_) => "EXCEEDED_TIME_LIMIT",
            DispatchError::Internal(_) => "GENERIC_INTERNAL_ERROR",
        }
    }

    /// Reports whether the error was caused by the client rather than by the
    /// system.
    pub fn is_user_error(&self) -> bool {
        match self {
            DispatchError::EmptyQuery
            | DispatchError::QueryTextTooLarge { .. }
            | DispatchError::AccessDenied(_)
            | DispatchError::InvalidSessionContext(_)
            | DispatchError::MalformedStatement(_)
            | DispatchError::TransactionConflict(_)
            | DispatchError::InvalidQueryId(_)
            | DispatchError::AbandonedQuery(_)
            | DispatchError::ExceededTimeLimit(_) => true,
            DispatchError::NoResourceGroup(_)
            | DispatchError::SubmissionRejected(_)
            | DispatchError::DuplicateQueryId(_)
            | DispatchError::UnknownQueryId(_)
            | DispatchError::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[mz_ore::test]
    fn messages_and_codes() {
        let err = DispatchError::QueryTextTooLarge {
            length: 12,
            max: 10,
        };
        assert_eq!(
            err.to_string(),
            "Query text length (12) exceeds the maximum length (10)"
        );
        assert_eq!(err.code(), "QUERY_TEXT_TOO_LARGE");
        assert!(err.is_user_error());

        let err = DispatchError::ExceededTimeLimit(Duration::from_secs(2));
        assert_eq!(
            err.to_string(),
            "query exceeded the maximum run time limit of 2000ms"
        );

        let err = DispatchError::Internal("boom".into());
        assert_eq!(err.code(), "GENERIC_INTERNAL_ERROR");
        assert!(!err.is_user_error());
    }
}
