// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dyncfgs used by query dispatch.

use std::time::Duration;

use mz_dyncfg::{Config, ConfigSet};

// All configuration names should be prefixed with "dispatch_" to avoid name collisions.

/// The longest query text, in characters, that is accepted for dispatch.
pub const MAX_QUERY_LENGTH: Config<usize> = Config::new(
    "dispatch_max_query_length",
    1_000_000,
    "The longest query text, in characters, that is accepted for dispatch.",
);

/// How often submitted queries are drained into the dispatch pipeline.
pub const ADMISSION_BATCH_INTERVAL: Config<Duration> = Config::new(
    "dispatch_admission_batch_interval",
    Duration::from_millis(200),
    "How often submitted queries are drained into the dispatch pipeline.",
);

/// How long a finished query is kept after its last heartbeat.
pub const QUERY_MIN_EXPIRE_AGE: Config<Duration> = Config::new(
    "dispatch_query_min_expire_age",
    Duration::from_secs(15 * 60),
    "How long a finished query is kept after its last heartbeat.",
);

/// The number of expired queries that are kept regardless of age.
pub const QUERY_MAX_HISTORY: Config<usize> = Config::new(
    "dispatch_query_max_history",
    0,
    "The number of expired queries that are kept regardless of age.",
);

/// How long an unfinished query may go without a heartbeat before it is
/// considered abandoned.
pub const QUERY_CLIENT_TIMEOUT: Config<Duration> = Config::new(
    "dispatch_query_client_timeout",
    Duration::from_secs(5 * 60),
    "How long an unfinished query may go without a heartbeat before it is \
    considered abandoned.",
);

/// The age after which an unfinished query is failed.
pub const QUERY_MAX_RUN_TIME: Config<Duration> = Config::new(
    "dispatch_query_max_run_time",
    Duration::from_secs(100 * 24 * 60 * 60),
    "The age after which an unfinished query is failed.",
);

/// How often the query tracker looks for queries to fail or remove.
pub const QUERY_EXPIRATION_SWEEP_INTERVAL: Config<Duration> = Config::new(
    "dispatch_query_expiration_sweep_interval",
    Duration::from_secs(1),
    "How often the query tracker looks for queries to fail or remove.",
);

/// Adds the full set of all dispatch `Config`s.
pub fn all_dyncfgs(configs: ConfigSet) -> ConfigSet {
    configs
        .add(&MAX_QUERY_LENGTH)
        .add(&ADMISSION_BATCH_INTERVAL)
        .add(&QUERY_MIN_EXPIRE_AGE)
        .add(&QUERY_MAX_HISTORY)
        .add(&QUERY_CLIENT_TIMEOUT)
        .add(&QUERY_MAX_RUN_TIME)
        .add(&QUERY_EXPIRATION_SWEEP_INTERVAL)
}
