//! Telemetry types sent to the remote backend
//!
//! All input validations should happen here. A [`TelemetryRecord`] can only
//! be built from a [`Categories`] set, which guarantees every known category
//! is present in the message, even when nothing was detected.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidCategoryError {
    #[error("category name must not be empty")]
    Empty,

    #[error("category name '{0}' must not contain ':'")]
    Colon(String),

    #[error("at least one category is required")]
    NoCategories,
}

/// Name of a detection class, e.g. `apple`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Category(String);

impl Category {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Category {
    type Error = InvalidCategoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value.is_empty() {
            return Err(InvalidCategoryError::Empty);
        }
        // the detector output uses ':' as separator, a category with a colon
        // could never be matched
        if value.contains(':') {
            return Err(InvalidCategoryError::Colon(value.to_owned()));
        }
        Ok(Self(value.to_owned()))
    }
}

impl FromStr for Category {
    type Err = InvalidCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The fixed set of categories reported by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Categories(BTreeSet<Category>);

impl Categories {
    pub fn new<I>(categories: I) -> Result<Self, InvalidCategoryError>
    where
        I: IntoIterator<Item = Category>,
    {
        let set: BTreeSet<Category> = categories.into_iter().collect();
        if set.is_empty() {
            return Err(InvalidCategoryError::NoCategories);
        }
        Ok(Self(set))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.0.iter()
    }
}

impl Default for Categories {
    fn default() -> Self {
        Self(
            ["apple", "banana", "potato"]
                .into_iter()
                .map(|name| Category(name.to_owned()))
                .collect(),
        )
    }
}

/// Detection counts for a single capture cycle.
///
/// Serializes to a JSON object with keys in lexicographic order, e.g.
/// `{"apple":0,"banana":2,"potato":1}`. That encoding is what goes over the
/// wire.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(transparent)]
pub struct TelemetryRecord(BTreeMap<String, u64>);

impl TelemetryRecord {
    /// Create a record with every category set to zero
    pub fn zeroed(categories: &Categories) -> Self {
        Self(
            categories
                .iter()
                .map(|c| (c.as_str().to_owned(), 0))
                .collect(),
        )
    }

    /// Count one detection of `category`.
    ///
    /// Unknown categories are ignored, the return value tells whether the
    /// detection was counted.
    pub fn count(&mut self, category: &str) -> bool {
        match self.0.get_mut(category) {
            Some(count) => {
                *count = count.saturating_add(1);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Encode the record in the canonical wire format
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }

    /// Decode a record from the wire format
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = serde_json::to_string(&self.0).map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}
