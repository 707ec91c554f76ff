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

//! Panic utilities.

use std::any::Any;
use std::panic::UnwindSafe;

/// Like [`std::panic::catch_unwind`], but returns the panic message instead of
/// the opaque panic payload.
pub fn catch_unwind_str<F, R>(f: F) -> Result<R, String>
where
    F: FnOnce() -> R + UnwindSafe,
{
    std::panic::catch_unwind(f).map_err(|payload| payload_str(payload.as_ref()))
}

/// Extracts the message of a panic payload, as produced by the `panic!` macro.
pub fn payload_str(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catches_messages() {
        assert_eq!(catch_unwind_str(|| 1), Ok(1));
        let err = catch_unwind_str::<_, ()>(|| panic!("static")).unwrap_err();
        assert_eq!(err, "static");
        let n = 7;
        let err = catch_unwind_str::<_, ()>(move || panic!("formatted {n}")).unwrap_err();
        assert_eq!(err, "formatted 7");
        let err = catch_unwind_str::<_, ()>(|| std::panic::panic_any(5)).unwrap_err();
        assert_eq!(err, "Box<dyn Any>");
    }
}
