// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Query identifiers and capability slugs.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use mz_ore::now::{EpochMillis, NowFn};
use rand::Rng;
use serde::Serialize;

use crate::error::DispatchError;

/// The largest counter value a generated [`QueryId`] carries before wrapping.
const MAX_QUERY_COUNTER: u32 = 99_999;

/// The length of the random coordinator suffix of a generated [`QueryId`].
const COORDINATOR_ID_LEN: usize = 5;

/// A globally unique query identifier.
///
/// Identifiers are restricted to lowercase ASCII letters, digits and `_`, so
/// that they can be safely embedded in URLs and log lines.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct QueryId(String);

impl QueryId {
    /// Validates and wraps an identifier supplied by a caller.
    pub fn new(id: impl Into<String>) -> Result<Self, DispatchError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if valid {
            Ok(QueryId(id))
        } else {
            Err(DispatchError::InvalidQueryId(id))
        }
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates [`QueryId`]s of the form `YYYYMMDD_HHMMSS_NNNNN_ccccc`.
///
/// The counter restarts whenever the wall-clock second changes and wraps
/// after [`MAX_QUERY_COUNTER`] within the same second. The suffix is chosen
/// once per generator and distinguishes coordinators that share a clock.
#[derive(Debug)]
pub struct QueryIdGenerator {
    coordinator_id: String,
    now: NowFn,
    state: Mutex<GeneratorState>,
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_second: EpochMillis,
    counter: u32,
}

impl QueryIdGenerator {
    pub fn new(now: NowFn) -> Self {
        let mut rng = rand::thread_rng();
        let coordinator_id = (0..COORDINATOR_ID_LEN)
            .map(|_| {
                let i = rng.gen_range(0..36u32);
                char::from_digit(i, 36).unwrap_or('0')
            })
            .collect();
        Self::with_coordinator_id(now, coordinator_id)
    }

    pub(crate) fn with_coordinator_id(now: NowFn, coordinator_id: String) -> Self {
        QueryIdGenerator {
            coordinator_id,
            now,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    /// The random suffix shared by every identifier from this generator.
    pub fn coordinator_id(&self) -> &str {
        &self.coordinator_id
    }

    pub fn create_next_query_id(&self) -> QueryId {
        let now = self.now.now();
        let second = now / 1000;
        let counter = {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.last_second != second {
                state.last_second = second;
                state.counter = 0;
            }
            let counter = state.counter;
            state.counter = if counter >= MAX_QUERY_COUNTER {
                0
            } else {
                counter + 1
            };
            counter
        };
        let timestamp = i64::try_from(now)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_default();
        QueryId(format!(
            "{}_{:05}_{}",
            timestamp.format("%Y%m%d_%H%M%S"),
            counter,
            self.coordinator_id
        ))
    }
}

/// An unguessable token that authorizes its holder to poll or cancel one
/// specific query.
#[derive(Clone, PartialEq, Eq)]
pub struct Slug(String);

impl Slug {
    pub fn random() -> Self {
        Slug(format!("x{}", uuid::Uuid::new_v4().simple()))
    }

    /// Reports whether `candidate` is this slug.
    pub fn matches(&self, candidate: &str) -> bool {
        self.0 == candidate
    }
}

impl fmt::Debug for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Slug(<redacted>)")
    }
}
