//! Partition key ranges, query ranges and collection identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{MAX_EXCLUSIVE, MIN_INCLUSIVE};
use crate::Error;

/// Characters the service reserves in resource ids
const RESERVED_ID_CHARS: [char; 4] = ['/', '\\', '?', '#'];

/// A contiguous slice of the partition key hash space owned by one physical partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKeyRange {
    /// Range id, used to address the partition on the wire
    pub id: String,
    /// Inclusive lower boundary
    pub min_inclusive: String,
    /// Exclusive upper boundary
    pub max_exclusive: String,
    /// Ids of the ranges this one was split from
    #[serde(default)]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(
        id: impl Into<String>,
        min_inclusive: impl Into<String>,
        max_exclusive: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
            parents: Vec::new(),
        }
    }

    /// Record the ranges this one was split from
    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parents = parents;
        self
    }

    /// True if this range covers the whole key space
    pub fn is_full_range(&self) -> bool {
        self.min_inclusive == MIN_INCLUSIVE && self.max_exclusive == MAX_EXCLUSIVE
    }
}

/// A range of effective partition keys targeted by a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRange {
    pub min: String,
    pub max: String,
    pub is_min_inclusive: bool,
    pub is_max_inclusive: bool,
}

impl QueryRange {
    pub fn new(
        min: impl Into<String>,
        max: impl Into<String>,
        is_min_inclusive: bool,
        is_max_inclusive: bool,
    ) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
            is_min_inclusive,
            is_max_inclusive,
        }
    }

    /// `[min, max)`
    pub fn half_open(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self::new(min, max, true, false)
    }

    /// `[key, key]`, a single effective partition key
    pub fn point(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(key.clone(), key, true, true)
    }

    /// The whole key space
    pub fn full() -> Self {
        Self::half_open(MIN_INCLUSIVE, MAX_EXCLUSIVE)
    }

    /// Reject ranges whose bounds are inverted
    pub fn validate(&self) -> crate::Result<()> {
        if self.min > self.max {
            return Err(Error::InvalidQueryRange {
                min: self.min.clone(),
                max: self.max.clone(),
            });
        }
        Ok(())
    }

    /// True if no key can fall inside the range
    pub fn is_empty(&self) -> bool {
        self.min > self.max
            || (self.min == self.max && !(self.is_min_inclusive && self.is_max_inclusive))
    }

    /// True if `[range.min_inclusive, range.max_exclusive)` intersects this range
    pub fn overlaps(&self, range: &PartitionKeyRange) -> bool {
        if self.is_empty() {
            return false;
        }
        let starts_before_range_end = self.min < range.max_exclusive;
        let ends_after_range_start = if self.is_max_inclusive {
            range.min_inclusive <= self.max
        } else {
            range.min_inclusive < self.max
        };
        starts_before_range_end && ends_after_range_start
    }
}

impl From<&PartitionKeyRange> for QueryRange {
    fn from(range: &PartitionKeyRange) -> Self {
        Self::half_open(range.min_inclusive.clone(), range.max_exclusive.clone())
    }
}

/// Validated collection identifier
///
/// Validation happens before any network activity so malformed input never
/// reaches the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionId(String);

impl CollectionId {
    /// Parse a bare collection id
    pub fn parse(id: &str) -> crate::Result<Self> {
        let invalid = |reason: &str| Error::InvalidCollectionId {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        if id.trim().is_empty() {
            return Err(invalid("id is empty"));
        }
        if id.trim() != id {
            return Err(invalid("id has leading or trailing whitespace"));
        }
        if let Some(c) = id.chars().find(|c| RESERVED_ID_CHARS.contains(c)) {
            return Err(invalid(&format!("reserved character {:?}", c)));
        }
        Ok(Self(id.to_string()))
    }

    /// Extract the collection id from a `dbs/{db}/colls/{coll}` link
    pub fn from_link(link: &str) -> crate::Result<Self> {
        let segments: Vec<&str> = link.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["dbs", db, "colls", coll] if !db.is_empty() => Self::parse(coll),
            _ => Err(Error::InvalidCollectionId {
                id: link.to_string(),
                reason: "expected a link of the form dbs/{db}/colls/{coll}".to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CollectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CollectionId {
    type Error = Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<CollectionId> for String {
    fn from(id: CollectionId) -> Self {
        id.0
    }
}
