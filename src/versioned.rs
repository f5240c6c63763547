//! Values tagged with version information.

use crate::clock::{Occurred, VectorClock};
use serde::{Deserialize, Serialize};

/// A value in the store combined with its vector clock. A versioned with an
/// absent value is a tombstone marking a deletion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<V> {
    value: Option<V>,
    version: VectorClock,
}

/// The raw byte-level versioned value stored by processors and engines.
pub type RawVersioned = Versioned<Vec<u8>>;

impl<V> Versioned<V> {
    pub fn new(value: Option<V>, version: VectorClock) -> Self {
        Versioned { value, version }
    }

    /// A tombstone carrying only version information.
    pub fn tombstone(version: VectorClock) -> Self {
        Versioned {
            value: None,
            version,
        }
    }

    /// An absent value under an empty clock, returned for missing keys.
    pub fn absent() -> Self {
        Versioned {
            value: None,
            version: VectorClock::new(),
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn get(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn value_or<'a>(&'a self, default: &'a V) -> &'a V {
        self.value.as_ref().unwrap_or(default)
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }

    pub fn version(&self) -> &VectorClock {
        &self.version
    }

    pub fn into_parts(self) -> (Option<V>, VectorClock) {
        (self.value, self.version)
    }

    /// Map the payload type, keeping the clock.
    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Versioned<U> {
        Versioned {
            value: self.value.map(f),
            version: self.version,
        }
    }
}

/// Insert a candidate into an antichain of versioned values.
///
/// Returns `false` without modifying `values` when the candidate is before
/// or equal to any existing version. Otherwise drops every version the
/// candidate supersedes, appends it, and returns `true`. The input must be
/// an antichain; the output is one.
pub(crate) fn antichain_insert<V: Clone>(
    values: &mut Vec<Versioned<V>>,
    candidate: &Versioned<V>,
) -> bool {
    let mut kept: Vec<Versioned<V>> = Vec::with_capacity(values.len() + 1);
    for existing in values.iter() {
        match candidate.version().compare(existing.version()) {
            Occurred::Before | Occurred::Equal => return false,
            Occurred::After => {}
            Occurred::Concurrent => kept.push(existing.clone()),
        }
    }
    kept.push(candidate.clone());
    *values = kept;
    true
}
