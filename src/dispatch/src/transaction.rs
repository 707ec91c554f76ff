// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt::Debug;

use crate::error::DispatchError;
use crate::session::Session;

/// Binds queries to the transactions their clients have open.
pub trait TransactionManager: Debug + Send + Sync {
    /// Marks the transaction of `session`, if any, as active.
    ///
    /// `transaction_control` is set when the statement itself starts or ends a
    /// transaction.
    fn activate_transaction(
        &self,
        session: &Session,
        transaction_control: bool,
    ) -> Result<(), DispatchError>;
}

/// A [`TransactionManager`] for deployments without multi-statement
/// transactions.
///
/// Any query that claims an open transaction is rejected unless it is itself
/// transaction control.
#[derive(Debug, Clone, Default)]
pub struct NoTransactionManager;

impl TransactionManager for NoTransactionManager {
    fn activate_transaction(
        &self,
        session: &Session,
        transaction_control: bool,
    ) -> Result<(), DispatchError> {
        match &session.transaction_id {
            Some(id) if !transaction_control => Err(DispatchError::TransactionConflict(format!(
                "unknown transaction {id}"
            ))),
            _ => Ok(()),
        }
    }
}
