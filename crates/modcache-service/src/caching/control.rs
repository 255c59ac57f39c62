use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The inputs that implicitly affect every build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Config,
    Options,
    Dependencies,
}

impl AsRef<str> for ChangeKind {
    fn as_ref(&self) -> &str {
        match self {
            Self::Config => "config",
            Self::Options => "options",
            Self::Dependencies => "dependencies",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// A freshly loaded value reported by one of the upstream providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlChange {
    /// The raw text of the (re)loaded configuration.
    Config(String),
    /// The complete options map after a change.
    Options(BTreeMap<String, String>),
    /// The version of the rebuilt dependency graph.
    Dependencies(i64),
}

impl ControlChange {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Config(_) => ChangeKind::Config,
            Self::Options(_) => ChangeKind::Options,
            Self::Dependencies(_) => ChangeKind::Dependencies,
        }
    }
}

/// Bookkeeping used to decide whether a snapshot still matches its inputs.
///
/// Fields stay `None` until the corresponding provider reported for the first time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    pub raw_config: Option<String>,
    pub options: Option<BTreeMap<String, String>>,
    pub dependencies_version: Option<i64>,
    pub init_stamp: u64,
}

impl CacheControl {
    pub fn new(init_stamp: u64) -> Self {
        Self {
            init_stamp,
            ..Default::default()
        }
    }

    /// Whether a snapshot produced under `self` may be reused by a process started with
    /// `restart_stamp`.
    ///
    /// A stamp of `0` means "no overrides" and only matches another `0`. Otherwise the running
    /// configuration must be no newer than the one that produced the persisted cache.
    pub fn is_reusable_for(&self, restart_stamp: u64) -> bool {
        if restart_stamp == 0 {
            self.init_stamp == 0
        } else {
            restart_stamp <= self.init_stamp
        }
    }

    /// Whether the field for `change` was ever recorded.
    pub fn has_recorded(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Config => self.raw_config.is_some(),
            ChangeKind::Options => self.options.is_some(),
            ChangeKind::Dependencies => self.dependencies_version.is_some(),
        }
    }

    /// Whether `change` carries a value different from the recorded one.
    pub fn differs(&self, change: &ControlChange) -> bool {
        match change {
            ControlChange::Config(text) => self.raw_config.as_ref() != Some(text),
            ControlChange::Options(options) => self.options.as_ref() != Some(options),
            ControlChange::Dependencies(version) => self.dependencies_version != Some(*version),
        }
    }

    /// Returns a copy with the field for `change` replaced and the other fields inherited.
    pub fn with_change(&self, change: ControlChange) -> Self {
        let mut control = self.clone();
        control.apply(change);
        control
    }

    pub fn apply(&mut self, change: ControlChange) {
        match change {
            ControlChange::Config(text) => self.raw_config = Some(text),
            ControlChange::Options(options) => self.options = Some(options),
            ControlChange::Dependencies(version) => self.dependencies_version = Some(version),
        }
    }
}
