// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Dynamically updatable configuration.
//!
//! Basic usage:
//! - A type-safe static `Config` is defined near where it is used.
//! - Once in the lifetime of a process, all interesting `Config`s are
//!   registered to a `ConfigSet`. The values within a `ConfigSet` are shared,
//!   though multiple `ConfigSet`s may be created and each are completely
//!   independent (i.e. one in each unit test).
//! - A `ConfigSet` is plumbed around as necessary and may be used to get or
//!   set the value of `Config`.
//!
//! ```
//! # use mz_dyncfg::{Config, ConfigSet};
//! const FOO: Config<usize> = Config::new("foo", 1, "description of foo");
//! fn bar(cfg: &ConfigSet) {
//!     assert_eq!(FOO.get(&cfg), 1);
//! }
//! fn main() {
//!     let cfg = ConfigSet::default().add(&FOO);
//!     bar(&cfg);
//! }
//! ```
//!
//! Values are read at the point of use, so an update applied through
//! [ConfigUpdates::apply] is observed by the next [Config::get] in every clone
//! of the set.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::error;

/// A handle to a dynamically updatable configuration value.
///
/// This represents a strongly-typed named config of type `T`. It may be
/// registered to a set of such configs with [ConfigSet::add] and then later
/// used to retrieve the latest value at any time with [Self::get].
///
/// The supported types are [usize] and [Duration].
#[derive(Clone, Debug)]
pub struct Config<T: ConfigType> {
    name: &'static str,
    desc: &'static str,
    default: T,
}

impl<T: ConfigType> Config<T> {
    /// Constructs a handle for a config of type `T`.
    ///
    /// It is best practice, but not strictly required, for the name to be
    /// globally unique within a process.
    pub const fn new(name: &'static str, default: T, desc: &'static str) -> Self {
        Config {
            name,
            default,
            desc,
        }
    }

    /// The name of this config.
    pub fn name(&self) -> &str {
        self.name
    }

    /// The description of this config.
    pub fn desc(&self) -> &str {
        self.desc
    }

    /// The default value of this config.
    pub fn default(&self) -> &T {
        &self.default
    }

    /// Returns the latest value of this config within the given set.
    ///
    /// Panics if this config was not previously registered to the set.
    pub fn get(&self, set: &ConfigSet) -> T {
        T::get(T::shared(self, set).expect("config should be registered to set"))
    }
}

/// A type usable as a [Config].
pub trait ConfigType: Clone + Sized {
    /// A value of this type, sharable between config value updaters and
    /// config value retrievers.
    type Shared;

    /// Extracts the sharable value for a config of this type from a set.
    fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>>;

    /// Converts this type to its type-erased enum equivalent.
    fn to_val(val: &Self) -> ConfigVal;

    /// Retrieves the current config value of this type from a value of its
    /// corresponding sharable type.
    fn get(x: &Self::Shared) -> Self;

    /// Updates the sharable value for a config of this type to the given value.
    fn set(x: &Self::Shared, val: Self);
}

/// An set of [Config]s with values independent of other [ConfigSet]s (even if
/// they contain the same configs).
#[derive(Clone, Default)]
pub struct ConfigSet {
    configs: BTreeMap<String, ConfigEntry>,
}

impl ConfigSet {
    /// Adds the given config to this set.
    ///
    /// Names are required to be unique within a set, but each set is entirely
    /// independent. The same `Config` may be registered to multiple
    /// [ConfigSet]s and thus have independent values (e.g. imagine a units test
    /// executing concurrently in the same process).
    ///
    /// Panics if a config with the same name has previously been registered to
    /// this set.
    pub fn add<T: ConfigType>(mut self, config: &Config<T>) -> Self {
        let entry = ConfigEntry {
            name: config.name,
            desc: config.desc,
            default: T::to_val(&config.default),
            val: T::to_val(&config.default),
        };
        if let Some(prev) = self.configs.insert(config.name.to_owned(), entry) {
            panic!("{} registered twice", prev.name);
        }
        self
    }

    /// Returns the configs currently registered to this set.
    pub fn entries(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.configs.values()
    }
}

impl fmt::Debug for ConfigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ConfigSet { configs } = self;
        f.debug_map()
            .entries(configs.iter().map(|(name, val)| (name, val.val())))
            .finish()
    }
}

/// An entry for a config in a [ConfigSet].
#[derive(Clone, Debug)]
pub struct ConfigEntry {
    name: &'static str,
    desc: &'static str,
    default: ConfigVal,
    val: ConfigVal,
}

impl ConfigEntry {
    /// The name of this config.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The description of this config.
    pub fn desc(&self) -> &'static str {
        self.desc
    }

    /// The default value of this config.
    ///
    /// This value is never updated.
    pub fn default(&self) -> &ConfigVal {
        &self.default
    }

    /// The sharable value of this config in the set.
    pub fn val(&self) -> &ConfigVal {
        &self.val
    }
}

/// A type-erased [ConfigType::Shared] for when set of different types are
/// stored in a collection.
#[derive(Clone, Debug)]
pub enum ConfigVal {
    /// A `usize` shared value.
    Usize(Arc<AtomicU64>),
    /// A 'Duration' shared value.
    Duration(Arc<RwLock<Duration>>),
}

/// A batch of value updates to [Config]s, applied to a [ConfigSet] together.
#[derive(Clone, Debug, Default)]
pub struct ConfigUpdates {
    updates: BTreeMap<String, ConfigVal>,
}

impl ConfigUpdates {
    /// Adds a new value for the given config to this set of updates.
    ///
    /// If a value of the same config has previously been added to these
    /// updates, replaces it.
    pub fn add<T: ConfigType>(&mut self, config: &Config<T>, val: T) {
        self.updates.insert(config.name.to_owned(), T::to_val(&val));
    }

    /// Applies these config updates to the given [ConfigSet].
    ///
    /// The value updates for any configs unknown by the given set are skipped.
    /// Ditto for config type mismatches. Both are logged.
    pub fn apply(&self, set: &ConfigSet) {
        fn copy<T: ConfigType>(src: &T::Shared, dst: &T::Shared) {
            T::set(dst, T::get(src))
        }

        for (name, val) in self.updates.iter() {
            let Some(config) = set.configs.get(name) else {
                error!("config update {} {:?} not known set: {:?}", name, val, set);
                continue;
            };
            match (val, &config.val) {
                (ConfigVal::Usize(src), ConfigVal::Usize(dst)) => copy::<usize>(src, dst),
                (ConfigVal::Duration(src), ConfigVal::Duration(dst)) => {
                    copy::<Duration>(src, dst)
                }
                (src, dst) => error!(
                    "config update {} type mismatch: {:?} vs {:?}",
                    name, src, dst
                ),
            }
        }
    }
}

mod impls {
    use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    use mz_ore::cast::CastFrom;

    use crate::{Config, ConfigSet, ConfigType, ConfigVal};

    impl ConfigType for usize {
        type Shared = AtomicU64;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            let entry = vals.configs.get(config.name)?;
            match entry.val() {
                ConfigVal::Usize(x) => Some(x),
                x => panic!("expected usize value got {:?}", x),
            }
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::Usize(Arc::new(u64::cast_from(*val).into()))
        }
        fn set(x: &Self::Shared, val: Self) {
            x.store(u64::cast_from(val), SeqCst);
        }
        fn get(x: &Self::Shared) -> Self {
            usize::cast_from(x.load(SeqCst))
        }
    }

    impl ConfigType for Duration {
        type Shared = RwLock<Duration>;

        fn shared<'a>(config: &Config<Self>, vals: &'a ConfigSet) -> Option<&'a Arc<Self::Shared>> {
            let entry = vals.configs.get(config.name)?;
            match entry.val() {
                ConfigVal::Duration(x) => Some(x),
                x => panic!("expected Duration value got {:?}", x),
            }
        }
        fn to_val(val: &Self) -> ConfigVal {
            ConfigVal::Duration(Arc::new(RwLock::new(*val)))
        }
        fn set(x: &Self::Shared, val: Self) {
            *x.write().expect("lock poisoned") = val;
        }
        fn get(x: &Self::Shared) -> Self {
            *x.read().expect("lock poisoned")
        }
    }
}
