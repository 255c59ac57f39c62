use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};

/// The eyecatcher of the generator used for builds that do not depend on any condition.
const NO_KEY: &str = "nokey";

/// The request-varying conditions a build may depend on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    features: BTreeMap<String, bool>,
    params: BTreeMap<String, String>,
    coerce_undefined_to_false: bool,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the requested value of a feature flag.
    pub fn with_feature(mut self, name: impl Into<String>, value: bool) -> Self {
        self.features.insert(name.into(), value);
        self
    }

    /// Sets a request parameter, such as the locale.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Treats features a generator depends on but which the request does not mention as `false`.
    pub fn coerce_undefined_to_false(mut self, coerce: bool) -> Self {
        self.coerce_undefined_to_false = coerce;
        self
    }

    pub fn feature(&self, name: &str) -> Option<bool> {
        self.features.get(name).copied()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// A composable function from [`Conditions`] to a part of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyGenerator {
    /// Always yields the same text.
    Fixed(String),
    /// Yields `name:value` for the named request parameter, or nothing if it is absent.
    Param(String),
    /// Yields the requested values of the given features.
    ///
    /// `None` stands for "every requested feature". A `provisional` generator is only a guess
    /// that has to be replaced once the first build reported which features it really examined.
    FeatureSet {
        features: Option<BTreeSet<String>>,
        provisional: bool,
    },
}

impl KeyGenerator {
    /// The generator used by builders that do not declare any.
    pub fn no_key() -> Self {
        Self::Fixed(NO_KEY.into())
    }

    pub fn features<I, S>(features: I, provisional: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::FeatureSet {
            features: Some(features.into_iter().map(Into::into).collect()),
            provisional,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(
            self,
            Self::FeatureSet {
                provisional: true,
                ..
            }
        )
    }

    pub fn generate_key(&self, conditions: &Conditions) -> String {
        match self {
            Self::Fixed(text) => text.clone(),
            Self::Param(name) => conditions
                .param(name)
                .map(|value| format!("{name}:{value}"))
                .unwrap_or_default(),
            Self::FeatureSet { features, .. } => {
                let mut selected: BTreeMap<&str, bool> = BTreeMap::new();
                match features {
                    None => {
                        for (name, value) in &conditions.features {
                            selected.insert(name, *value);
                        }
                    }
                    Some(features) => {
                        for name in features {
                            match conditions.feature(name) {
                                Some(value) => {
                                    selected.insert(name, value);
                                }
                                None if conditions.coerce_undefined_to_false => {
                                    selected.insert(name, false);
                                }
                                None => {}
                            }
                        }
                    }
                }

                let mut key = String::from("has{");
                for (i, (name, value)) in selected.into_iter().enumerate() {
                    if i > 0 {
                        key.push(',');
                    }
                    if !value {
                        key.push('!');
                    }
                    key.push_str(name);
                }
                key.push('}');
                key
            }
        }
    }

    /// Combines two generators describing the same condition.
    ///
    /// Combining is idempotent. For two feature sets it is also commutative: a non-provisional
    /// set absorbs a provisional one, and two non-provisional sets yield their union.
    /// Generators that do not describe the same condition cannot be merged. Then `other` wins,
    /// as it is the one reported by the most recent build.
    pub fn combine(&self, other: &Self) -> Self {
        if self == other {
            return self.clone();
        }
        match (self, other) {
            (
                Self::FeatureSet {
                    features: a,
                    provisional: pa,
                },
                Self::FeatureSet {
                    features: b,
                    provisional: pb,
                },
            ) => {
                if *pa && !*pb {
                    return other.clone();
                }
                if *pb && !*pa {
                    return self.clone();
                }
                let features = match (a, b) {
                    (Some(a), Some(b)) => Some(a.union(b).cloned().collect()),
                    _ => None,
                };
                Self::FeatureSet {
                    features,
                    provisional: *pa && *pb,
                }
            }
            _ => {
                tracing::warn!(
                    current = %self,
                    discovered = %other,
                    "Replacing mismatched key generator"
                );
                other.clone()
            }
        }
    }
}

impl fmt::Display for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(text) => f.write_str(text),
            Self::Param(name) => write!(f, "param:{name}"),
            Self::FeatureSet {
                features,
                provisional,
            } => {
                f.write_str("has:")?;
                match features {
                    Some(features) => {
                        f.write_char('[')?;
                        for (i, name) in features.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            f.write_str(name)?;
                        }
                        f.write_char(']')?;
                    }
                    None => f.write_str("null")?,
                }
                if *provisional {
                    f.write_str(":provisional")?;
                }
                Ok(())
            }
        }
    }
}

/// An ordered list of [`KeyGenerator`]s determining the key space of one artifact's builds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyGeneratorSet(Vec<KeyGenerator>);

impl Default for KeyGeneratorSet {
    fn default() -> Self {
        Self(vec![KeyGenerator::no_key()])
    }
}

impl From<Vec<KeyGenerator>> for KeyGeneratorSet {
    fn from(generators: Vec<KeyGenerator>) -> Self {
        if generators.is_empty() {
            Self::default()
        } else {
            Self(generators)
        }
    }
}

impl KeyGeneratorSet {
    pub fn generators(&self) -> &[KeyGenerator] {
        &self.0
    }

    /// Whether any generator of the set is still provisional.
    pub fn is_provisional(&self) -> bool {
        self.0.iter().any(KeyGenerator::is_provisional)
    }

    /// Computes the cache key, joining all non-empty parts with `;`.
    pub fn generate_key(&self, conditions: &Conditions) -> String {
        let mut key = String::new();
        for generator in &self.0 {
            let part = generator.generate_key(conditions);
            if part.is_empty() {
                continue;
            }
            if !key.is_empty() {
                key.push(';');
            }
            key.push_str(&part);
        }
        key
    }

    /// Combines two sets element-wise.
    ///
    /// Sets of different length cannot be matched up. In that case `other` wins, as it is the one
    /// reported by the most recent build.
    pub fn combine(&self, other: &Self) -> Self {
        if self.0.len() != other.0.len() {
            tracing::debug!(
                old = %self,
                new = %other,
                "Replacing key generators of different shape"
            );
            return other.clone();
        }
        Self(
            self.0
                .iter()
                .zip(&other.0)
                .map(|(a, b)| a.combine(b))
                .collect(),
        )
    }
}

impl fmt::Display for KeyGeneratorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, generator) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_char(';')?;
            }
            write!(f, "{generator}")?;
        }
        Ok(())
    }
}
