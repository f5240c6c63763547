//! Node identity and vector clocks.
//!
//! Node IDs are topological coordinates, outermost first: `(2,3,4,5)` could
//! mean datacenter 2, pod 3, rack 4, node 5. Nodes should be arranged so
//! that failures are less correlated when the shared prefix is shorter.
//!
//! A vector clock represents a version in the store and determines whether
//! two updates are causally connected. Clocks are partially ordered; clocks
//! that cannot be compared correspond to concurrent updates of the same
//! value.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Topological node identifier, ordered lexicographically.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(Vec<u32>);

impl NodeId {
    /// Create a node ID from topological coordinates, outermost first.
    pub fn new(parts: impl Into<Vec<u32>>) -> Self {
        NodeId(parts.into())
    }

    /// The empty node ID, used as the root neighborhood prefix.
    pub fn empty() -> Self {
        NodeId(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn parts(&self) -> &[u32] {
        &self.0
    }

    /// The prefix of the given length (saturating).
    pub fn prefix(&self, len: usize) -> NodeId {
        NodeId(self.0[..len.min(self.0.len())].to_vec())
    }

    /// The neighborhood prefix for this node: everything but the last
    /// coordinate. The empty prefix denotes the root neighborhood.
    pub fn neighborhood_prefix(&self) -> NodeId {
        self.prefix(self.0.len().saturating_sub(1))
    }
}

impl From<Vec<u32>> for NodeId {
    fn from(parts: Vec<u32>) -> Self {
        NodeId(parts)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, ")")
    }
}

/// Outcome of comparing two vector clocks under the causal partial order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Occurred {
    /// Clock 1 is after clock 2.
    After,
    /// Clock 1 is before clock 2.
    Before,
    /// Clocks 1 and 2 are concurrent.
    Concurrent,
    /// Clocks 1 and 2 are equal.
    Equal,
}

impl fmt::Display for Occurred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Occurred::After => "AFTER",
            Occurred::Before => "BEFORE",
            Occurred::Concurrent => "CONCURRENT",
            Occurred::Equal => "EQUAL",
        };
        f.write_str(s)
    }
}

/// A single clock entry: a node ID and the version counter for that node.
pub type ClockEntry = (NodeId, u64);

/// A vector clock: a wall-clock timestamp plus per-node version counters
/// kept strictly ascending by node ID.
///
/// The timestamp is advisory; it is consulted only by the default
/// last-writer-wins resolver. Causality is determined by the entries alone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    timestamp: SystemTime,
    entries: Vec<ClockEntry>,
}

impl Default for VectorClock {
    fn default() -> Self {
        VectorClock {
            timestamp: SystemTime::now(),
            entries: Vec::new(),
        }
    }
}

impl VectorClock {
    /// An empty clock stamped with the current time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from entries, which must be unique and ascending by
    /// node ID.
    pub fn with_entries(timestamp: SystemTime, entries: Vec<ClockEntry>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        VectorClock { timestamp, entries }
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn entries(&self) -> &[ClockEntry] {
        &self.entries
    }

    /// A copy of this clock with the entry for `id` advanced by one and the
    /// timestamp set to the current time.
    pub fn incremented(&self, id: &NodeId) -> VectorClock {
        self.incremented_at(id, SystemTime::now())
    }

    /// A copy of this clock with the entry for `id` advanced by one
    /// (inserted in order if absent) and the given timestamp.
    pub fn incremented_at(&self, id: &NodeId, timestamp: SystemTime) -> VectorClock {
        let mut entries = self.entries.clone();
        match entries.binary_search_by(|(eid, _)| eid.cmp(id)) {
            Ok(index) => entries[index].1 += 1,
            Err(index) => entries.insert(index, (id.clone(), 1)),
        }
        VectorClock { timestamp, entries }
    }

    /// Merge with another clock, taking the pairwise maximum counter over
    /// the union of node IDs; the timestamp is set to the current time.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        self.merge_at(other, SystemTime::now())
    }

    /// Merge with another clock using an explicit timestamp.
    pub fn merge_at(&self, other: &VectorClock, timestamp: SystemTime) -> VectorClock {
        let mut entries = Vec::with_capacity(self.entries.len().max(other.entries.len()));
        let mut p1 = self.entries.iter().peekable();
        let mut p2 = other.entries.iter().peekable();

        while let (Some((id1, c1)), Some((id2, c2))) = (p1.peek(), p2.peek()) {
            match id1.cmp(id2) {
                Ordering::Equal => {
                    entries.push(((*id1).clone(), (*c1).max(*c2)));
                    p1.next();
                    p2.next();
                }
                Ordering::Less => {
                    entries.push(((*id1).clone(), *c1));
                    p1.next();
                }
                Ordering::Greater => {
                    entries.push(((*id2).clone(), *c2));
                    p2.next();
                }
            }
        }
        entries.extend(p1.cloned());
        entries.extend(p2.cloned());

        VectorClock { timestamp, entries }
    }

    /// Compare under the causal partial order: whether this clock occurred
    /// after, before, concurrent with, or equal to `other`.
    pub fn compare(&self, other: &VectorClock) -> Occurred {
        let mut self_bigger = false;
        let mut other_bigger = false;
        let mut p1 = self.entries.iter().peekable();
        let mut p2 = other.entries.iter().peekable();

        while let (Some((id1, c1)), Some((id2, c2))) = (p1.peek(), p2.peek()) {
            match id1.cmp(id2) {
                Ordering::Equal => {
                    if c1 > c2 {
                        self_bigger = true;
                    } else if c1 < c2 {
                        other_bigger = true;
                    }
                    p1.next();
                    p2.next();
                }
                Ordering::Less => {
                    self_bigger = true;
                    p1.next();
                }
                Ordering::Greater => {
                    other_bigger = true;
                    p2.next();
                }
            }
        }
        if p1.peek().is_some() {
            self_bigger = true;
        } else if p2.peek().is_some() {
            other_bigger = true;
        }

        match (self_bigger, other_bigger) {
            (false, false) => Occurred::Equal,
            (false, true) => Occurred::Before,
            (true, false) => Occurred::After,
            (true, true) => Occurred::Concurrent,
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        write!(f, "{{{secs}, [")?;
        for (i, (id, counter)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "({id}, {counter})")?;
        }
        write!(f, "]}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn nid(parts: &[u32]) -> NodeId {
        NodeId::new(parts.to_vec())
    }

    fn clock(ts: SystemTime, entries: &[(&[u32], u64)]) -> VectorClock {
        VectorClock::with_entries(
            ts,
            entries.iter().map(|(id, c)| (nid(id), *c)).collect(),
        )
    }

    #[test]
    fn test_increment_keeps_entries_ordered() {
        let now = SystemTime::now();
        let n1 = nid(&[1, 2, 3]);
        let n2 = nid(&[2, 1, 4]);
        let n3 = nid(&[1, 3, 2]);
        let n4 = nid(&[1, 2, 1]);

        let v = VectorClock::with_entries(now, vec![]).incremented_at(&n1, now);
        assert_eq!(clock(now, &[(&[1, 2, 3], 1)]), v);

        let v = v.incremented_at(&n2, now);
        assert_eq!(clock(now, &[(&[1, 2, 3], 1), (&[2, 1, 4], 1)]), v);

        let v = v.incremented_at(&n2, now);
        assert_eq!(clock(now, &[(&[1, 2, 3], 1), (&[2, 1, 4], 2)]), v);

        let v = v.incremented_at(&n1, now);
        assert_eq!(clock(now, &[(&[1, 2, 3], 2), (&[2, 1, 4], 2)]), v);

        let v = v.incremented_at(&n3, now);
        assert_eq!(
            clock(now, &[(&[1, 2, 3], 2), (&[1, 3, 2], 1), (&[2, 1, 4], 2)]),
            v
        );

        let v = v.incremented_at(&n4, now);
        assert_eq!(
            clock(
                now,
                &[
                    (&[1, 2, 1], 1),
                    (&[1, 2, 3], 2),
                    (&[1, 3, 2], 1),
                    (&[2, 1, 4], 2)
                ]
            ),
            v
        );
        assert!(v.entries().windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_increment_coalesces_repeat_nodes() {
        let now = SystemTime::now();
        let n1 = nid(&[1, 2, 3]);
        let n2 = nid(&[1, 3, 2]);

        let v = VectorClock::with_entries(now, vec![])
            .incremented_at(&n1, now)
            .incremented_at(&n2, now)
            .incremented_at(&n2, now);
        assert_eq!(clock(now, &[(&[1, 2, 3], 1), (&[1, 3, 2], 2)]), v);
    }

    #[test]
    fn test_compare_reflexive_equal() {
        let now = SystemTime::now();
        let v = VectorClock::with_entries(now, vec![]);
        assert_eq!(Occurred::Equal, v.compare(&v));

        let v = clock(now, &[(&[1, 2, 3], 2), (&[1, 3, 2], 1)]);
        assert_eq!(Occurred::Equal, v.compare(&v));
    }

    #[test]
    fn test_compare_increment_is_after() {
        let now = SystemTime::now();
        let a = nid(&[1]);
        let v = clock(now, &[(&[1, 2, 3], 2)]);
        assert_eq!(Occurred::After, v.incremented_at(&a, now).compare(&v));
        assert_eq!(Occurred::Before, v.compare(&v.incremented_at(&a, now)));
    }

    #[test]
    fn test_compare_distinct_increments_concurrent() {
        let now = SystemTime::now();
        let v = VectorClock::with_entries(now, vec![]);
        let v1 = v.incremented_at(&nid(&[1, 2, 3]), now);
        let v2 = v.incremented_at(&nid(&[1, 3, 2]), now);
        assert_eq!(Occurred::Concurrent, v1.compare(&v2));
        assert_eq!(Occurred::Concurrent, v2.compare(&v1));
    }

    #[test]
    fn test_compare_missing_node_is_before() {
        let now = SystemTime::now();
        let v1 = clock(now, &[(&[1, 2, 3], 2), (&[1, 3, 2], 1)]);
        let v2 = clock(
            now,
            &[(&[1, 2, 3], 2), (&[1, 3, 2], 1), (&[2, 1, 4], 1)],
        );
        assert_eq!(Occurred::Before, v1.compare(&v2));
        assert_eq!(Occurred::After, v2.compare(&v1));
        assert_eq!(
            Occurred::After,
            v1.compare(&VectorClock::with_entries(now, vec![]))
        );
    }

    #[test_case(3, 2, Occurred::After; "counter dominates")]
    #[test_case(2, 3, Occurred::Before; "counter dominated")]
    #[test_case(2, 2, Occurred::Equal; "counters equal")]
    fn test_compare_shared_nodes(left: u64, right: u64, expected: Occurred) {
        let now = SystemTime::now();
        let a = clock(now, &[(&[1, 2, 3], left), (&[1, 3, 2], 2), (&[2, 1, 4], 1)]);
        let b = clock(now, &[(&[1, 2, 3], right), (&[1, 3, 2], 2), (&[2, 1, 4], 1)]);
        assert_eq!(expected, a.compare(&b));
    }

    #[test]
    fn test_merge_ordered_union_of_maxima() {
        let now = SystemTime::now();

        let e = clock(now, &[]);
        assert_eq!(e, clock(now, &[]).merge_at(&clock(now, &[]), now));

        let v1 = clock(now, &[(&[1, 3, 2], 1)]);
        let v2 = clock(now, &[(&[1, 2, 3], 1)]);
        assert_eq!(
            clock(now, &[(&[1, 2, 3], 1), (&[1, 3, 2], 1)]),
            v1.merge_at(&v2, now)
        );

        let v1 = clock(
            now,
            &[(&[1, 2, 3], 3), (&[1, 3, 2], 1), (&[2, 1, 4], 1), (&[2, 2, 5], 1)],
        );
        let v2 = clock(now, &[(&[1, 2, 3], 1), (&[1, 3, 2], 2), (&[2, 2, 4], 1)]);
        assert_eq!(
            clock(
                now,
                &[
                    (&[1, 2, 3], 3),
                    (&[1, 3, 2], 2),
                    (&[2, 1, 4], 1),
                    (&[2, 2, 4], 1),
                    (&[2, 2, 5], 1)
                ]
            ),
            v1.merge_at(&v2, now)
        );
    }

    #[test]
    fn test_merge_commutative_idempotent() {
        let now = SystemTime::now();
        let v1 = clock(now, &[(&[1, 2, 3], 3), (&[2, 1, 4], 1)]);
        let v2 = clock(now, &[(&[1, 2, 3], 1), (&[1, 3, 2], 2)]);
        assert_eq!(v1.merge_at(&v2, now), v2.merge_at(&v1, now));
        assert_eq!(v1, v1.merge_at(&v1, now));
    }

    #[test]
    fn test_node_id_display_and_order() {
        assert_eq!("(1,2,3)", nid(&[1, 2, 3]).to_string());
        assert_eq!("()", NodeId::empty().to_string());
        assert!(nid(&[1, 2, 3]) < nid(&[1, 3, 2]));
        assert!(nid(&[1, 2]) < nid(&[1, 2, 0]));
    }

    #[test]
    fn test_neighborhood_prefix() {
        assert_eq!(nid(&[1, 2]), nid(&[1, 2, 3]).neighborhood_prefix());
        assert_eq!(NodeId::empty(), nid(&[1]).neighborhood_prefix());
        assert_eq!(NodeId::empty(), NodeId::empty().neighborhood_prefix());
    }
}
