//! Routing map: the complete, ordered set of partition key ranges for a collection

use std::collections::{BTreeSet, HashSet};

use crate::constants::{MAX_EXCLUSIVE, MIN_INCLUSIVE};
use crate::{CollectionId, Error, PartitionKeyRange, QueryRange};

/// Ordered, contiguous partition boundaries of one collection
///
/// Invariants (checked by [`RoutingMap::try_new`]):
/// - ranges are sorted by `min_inclusive`
/// - `ranges[i].max_exclusive == ranges[i + 1].min_inclusive`
/// - the first range starts at `""` and the last ends at `"FF"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingMap {
    collection: CollectionId,
    ranges: Vec<PartitionKeyRange>,
}

impl RoutingMap {
    /// Build a routing map from the flat list returned by the metadata service
    ///
    /// Ranges that are listed as the parent of another returned range have
    /// already been split and are dropped before validation.
    pub fn try_new(
        collection: CollectionId,
        ranges: impl IntoIterator<Item = PartitionKeyRange>,
    ) -> crate::Result<Self> {
        let ranges: Vec<PartitionKeyRange> = ranges.into_iter().collect();

        let gone: HashSet<&str> = ranges
            .iter()
            .flat_map(|r| r.parents.iter().map(String::as_str))
            .collect();
        let mut live: Vec<PartitionKeyRange> = ranges
            .iter()
            .filter(|r| !gone.contains(r.id.as_str()))
            .cloned()
            .collect();

        live.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));

        validate_coverage(&collection, &live)?;

        Ok(Self {
            collection,
            ranges: live,
        })
    }

    pub fn collection(&self) -> &CollectionId {
        &self.collection
    }

    /// All ranges in ascending boundary order
    pub fn ranges(&self) -> &[PartitionKeyRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Look up a range by id
    pub fn get(&self, id: &str) -> Option<&PartitionKeyRange> {
        self.ranges.iter().find(|r| r.id == id)
    }

    /// Range owning a single effective partition key
    pub fn range_for_key(&self, key: &str) -> Option<&PartitionKeyRange> {
        let idx = self
            .ranges
            .partition_point(|r| r.max_exclusive.as_str() <= key);
        self.ranges
            .get(idx)
            .filter(|r| r.min_inclusive.as_str() <= key)
    }

    /// Every range intersecting `query`, in ascending boundary order
    pub fn overlapping(&self, query: &QueryRange) -> Vec<&PartitionKeyRange> {
        if query.is_empty() {
            return Vec::new();
        }

        // First range whose upper bound lies above the query's lower bound
        let start = self
            .ranges
            .partition_point(|r| r.max_exclusive <= query.min);

        self.ranges[start..]
            .iter()
            .take_while(|r| query.overlaps(r))
            .collect()
    }

    /// Union of the ranges intersecting any of `queries`, deduplicated, in ascending order
    pub fn overlapping_many(&self, queries: &[QueryRange]) -> Vec<&PartitionKeyRange> {
        let mut seen = BTreeSet::new();
        for query in queries {
            for range in self.overlapping(query) {
                seen.insert(range.min_inclusive.as_str());
            }
        }
        self.ranges
            .iter()
            .filter(|r| seen.contains(r.min_inclusive.as_str()))
            .collect()
    }
}

fn validate_coverage(collection: &CollectionId, ranges: &[PartitionKeyRange]) -> crate::Result<()> {
    let incomplete = |reason: String| Error::IncompleteRoutingMap {
        collection: collection.to_string(),
        reason,
    };

    let (first, last) = match (ranges.first(), ranges.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(incomplete("no partition key ranges".to_string())),
    };

    if first.min_inclusive != MIN_INCLUSIVE {
        return Err(incomplete(format!(
            "first range {} starts at {:?}",
            first.id, first.min_inclusive
        )));
    }
    if last.max_exclusive != MAX_EXCLUSIVE {
        return Err(incomplete(format!(
            "last range {} ends at {:?}",
            last.id, last.max_exclusive
        )));
    }

    for pair in ranges.windows(2) {
        if pair[0].max_exclusive != pair[1].min_inclusive {
            return Err(incomplete(format!(
                "gap or overlap between range {} (max {:?}) and range {} (min {:?})",
                pair[0].id, pair[0].max_exclusive, pair[1].id, pair[1].min_inclusive
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection() -> CollectionId {
        CollectionId::parse("orders").unwrap()
    }

    fn create_test_map() -> RoutingMap {
        RoutingMap::try_new(
            collection(),
            vec![
                PartitionKeyRange::new("3", "0x7FFF", "FF"),
                PartitionKeyRange::new("1", "", "0x3FFF"),
                PartitionKeyRange::new("2", "0x3FFF", "0x7FFF"),
            ],
        )
        .unwrap()
    }

    fn ids(ranges: Vec<&PartitionKeyRange>) -> Vec<&str> {
        ranges.into_iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_ranges_sorted_and_contiguous() {
        let map = create_test_map();
        let ranges = map.ranges();

        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].min_inclusive, MIN_INCLUSIVE);
        assert_eq!(ranges[2].max_exclusive, MAX_EXCLUSIVE);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].max_exclusive, pair[1].min_inclusive);
        }
    }

    #[test]
    fn test_overlapping_spans_boundary() {
        let map = create_test_map();
        let hits = map.overlapping(&QueryRange::half_open("0x5000", "0x9000"));
        assert_eq!(ids(hits), vec!["2", "3"]);
    }

    #[test]
    fn test_overlapping_single_partition() {
        let map = create_test_map();
        assert_eq!(ids(map.overlapping(&QueryRange::half_open("0x4000", "0x5000"))), vec!["2"]);
        // Query ending exactly on a boundary does not reach the next range
        assert_eq!(ids(map.overlapping(&QueryRange::half_open("0x4000", "0x7FFF"))), vec!["2"]);
        assert_eq!(ids(map.overlapping(&QueryRange::point("0x7FFF"))), vec!["3"]);
    }

    #[test]
    fn test_overlapping_full_range() {
        let map = create_test_map();
        assert_eq!(ids(map.overlapping(&QueryRange::full())), vec!["1", "2", "3"]);
        assert!(map.overlapping(&QueryRange::half_open("0x10", "0x10")).is_empty());
    }

    #[test]
    fn test_overlapping_many_dedups() {
        let map = create_test_map();
        let hits = map.overlapping_many(&[
            QueryRange::point("0x8000"),
            QueryRange::half_open("", "0x1000"),
            QueryRange::point("0x9000"),
        ]);
        assert_eq!(ids(hits), vec!["1", "3"]);
    }

    #[test]
    fn test_range_for_key() {
        let map = create_test_map();
        assert_eq!(map.range_for_key("").unwrap().id, "1");
        assert_eq!(map.range_for_key("0x3FFF").unwrap().id, "2");
        assert_eq!(map.range_for_key("0xA000").unwrap().id, "3");
        assert!(map.range_for_key("FF").is_none());
    }

    #[test]
    fn test_split_parents_dropped() {
        let map = RoutingMap::try_new(
            collection(),
            vec![
                PartitionKeyRange::new("0", "", "FF"),
                PartitionKeyRange::new("1", "", "0x7FFF").with_parents(vec!["0".into()]),
                PartitionKeyRange::new("2", "0x7FFF", "FF").with_parents(vec!["0".into()]),
            ],
        )
        .unwrap();
        assert_eq!(ids(map.ranges().iter().collect()), vec!["1", "2"]);
        assert!(map.get("0").is_none());
    }

    #[test]
    fn test_incomplete_maps_rejected() {
        let gap = RoutingMap::try_new(
            collection(),
            vec![
                PartitionKeyRange::new("1", "", "0x3FFF"),
                PartitionKeyRange::new("2", "0x5000", "FF"),
            ],
        );
        assert!(matches!(gap, Err(Error::IncompleteRoutingMap { .. })));

        let short =
            RoutingMap::try_new(collection(), vec![PartitionKeyRange::new("1", "", "0x3FFF")]);
        assert!(matches!(short, Err(Error::IncompleteRoutingMap { .. })));

        let empty = RoutingMap::try_new(collection(), Vec::new());
        assert!(matches!(empty, Err(Error::IncompleteRoutingMap { .. })));
    }
}
