// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::session::Identity;

/// Decides whether an identity may run queries at all.
#[async_trait]
pub trait AccessControl: Debug + Send + Sync {
    /// Returns [`DispatchError::AccessDenied`] if `identity` may not execute
    /// queries.
    async fn check_can_execute_query(&self, identity: &Identity) -> Result<(), DispatchError>;
}

/// An [`AccessControl`] that admits everyone.
#[derive(Debug, Clone, Default)]
pub struct AllowAllAccessControl;

#[async_trait]
impl AccessControl for AllowAllAccessControl {
    async fn check_can_execute_query(&self, _identity: &Identity) -> Result<(), DispatchError> {
        Ok(())
    }
}
