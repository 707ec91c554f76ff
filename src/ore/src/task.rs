// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tokio task utilities.
//!
//! ## Named task spawning
//!
//! The [`spawn`] function wraps [`tokio::spawn`] to attach a name to every
//! task. The name is recorded on a [`tracing`] span that the task runs inside
//! of, so that log lines emitted by a background task identify the task that
//! emitted them. The name is supplied by a closure so that formatting costs
//! are only paid when a task is actually spawned.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawns a new asynchronous task with a name.
///
/// See [`tokio::spawn`] and the [module][`self`] docs for more
/// information.
#[track_caller]
#[allow(clippy::disallowed_methods)]
pub fn spawn<Fut, Name, NameClosure>(nc: NameClosure, future: Fut) -> JoinHandle<Fut::Output>
where
    Name: AsRef<str>,
    NameClosure: FnOnce() -> Name,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = nc();
    let span = tracing::debug_span!("task", name = name.as_ref());
    tokio::spawn(future.instrument(span))
}
