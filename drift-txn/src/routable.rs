// Routables: Keys, Ranges, Seekables, Unseekables and Route (spec §3.2, §4.1).
//
// Seekables is the concrete data a transaction reads/writes (Keys or
// Ranges). Unseekables is the routing-only projection of the same thing
// (RoutingKeys or RoutingRanges) used purely for message dispatch across
// shard boundaries -- it never needs full key resolution, only enough to
// decide "does this shard's range-cover intersect this transaction".
//
// All containers here are kept sorted and deduplicated/non-overlapping on
// construction so every subsequent operation (slice, union, contains) can
// run as a linear merge or binary search rather than re-sorting.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use drift_base::{err, Error};

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Key(pub Vec<u8>);

impl Key {
    pub fn from_str(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

/// A half-open [start, end) key range. `end` being `None` means "to the
/// end of the keyspace", mirroring how a shard's range can extend to the
/// top of the hash space.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Key,
    pub end: Option<Key>,
}

impl Range {
    pub fn new(start: Key, end: Option<Key>) -> Self {
        Range { start, end }
    }

    pub fn contains_key(&self, k: &Key) -> bool {
        k >= &self.start && self.end.as_ref().map_or(true, |e| k < e)
    }

    pub fn intersects(&self, other: &Range) -> bool {
        let starts_before_other_ends = other.end.as_ref().map_or(true, |e| &self.start < e);
        let other_starts_before_self_ends = self.end.as_ref().map_or(true, |e| &other.start < e);
        starts_before_other_ends && other_starts_before_self_ends
    }

    pub fn contains_range(&self, other: &Range) -> bool {
        let start_ok = other.start >= self.start;
        let end_ok = match (&self.end, &other.end) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(se), Some(oe)) => oe <= se,
        };
        start_ok && end_ok
    }
}

// Ranges are compared by start key only; within one non-overlapping sorted
// sequence that's enough to order them, and the cases above never compare
// ranges that overlap.
impl Ord for Range {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start.cmp(&other.start)
    }
}
impl PartialOrd for Range {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A sorted, deduplicated set of Keys.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize, Deserialize)]
pub struct Keys(Vec<Key>);

impl Keys {
    pub fn new(mut keys: Vec<Key>) -> Self {
        keys.sort();
        keys.dedup();
        Keys(keys)
    }

    pub fn as_slice(&self) -> &[Key] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.0.binary_search(key).is_ok()
    }

    pub fn contains_all(&self, other: &Keys) -> bool {
        other.0.iter().all(|k| self.contains(k))
    }

    /// The subset of keys intersecting `ranges`.
    pub fn slice(&self, ranges: &Ranges) -> Keys {
        Keys(
            self.0
                .iter()
                .filter(|k| ranges.contains(k))
                .cloned()
                .collect(),
        )
    }

    pub fn union(&self, other: &Keys) -> Keys {
        if self.0.is_empty() {
            return other.clone();
        }
        if other.0.is_empty() {
            return self.clone();
        }
        let mut out = Vec::with_capacity(self.0.len() + other.0.len());
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                Ordering::Less => {
                    out.push(self.0[i].clone());
                    i += 1;
                }
                Ordering::Greater => {
                    out.push(other.0[j].clone());
                    j += 1;
                }
                Ordering::Equal => {
                    out.push(self.0[i].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&self.0[i..]);
        out.extend_from_slice(&other.0[j..]);
        Keys(out)
    }
}

/// A sorted, non-overlapping sequence of Ranges.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize, Deserialize)]
pub struct Ranges(Vec<Range>);

impl Ranges {
    /// Builds a normalized Ranges from arbitrary input, merging overlapping
    /// or adjacent ranges so the non-overlap invariant always holds.
    pub fn new(mut ranges: Vec<Range>) -> Self {
        ranges.sort();
        let mut merged: Vec<Range> = Vec::with_capacity(ranges.len());
        for r in ranges {
            if let Some(last) = merged.last_mut() {
                if last.end.as_ref().map_or(true, |e| &r.start <= e) {
                    if last.end.is_some() {
                        last.end = match (&last.end, &r.end) {
                            (Some(a), Some(b)) => Some(a.max(b).clone()),
                            _ => None,
                        };
                    }
                    continue;
                }
            }
            merged.push(r);
        }
        Ranges(merged)
    }

    pub fn as_slice(&self) -> &[Range] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        // Binary search for the last range whose start is <= key, then
        // check containment -- ranges are sorted and non-overlapping so
        // at most one range can contain `key`.
        match self.0.binary_search_by(|r| r.start.cmp(key)) {
            Ok(_) => true,
            Err(0) => false,
            Err(idx) => self.0[idx - 1].contains_key(key),
        }
    }

    pub fn contains_all(&self, other: &Ranges) -> bool {
        other.0.iter().all(|r| self.covers_range(r))
    }

    fn covers_range(&self, other: &Range) -> bool {
        self.0.iter().any(|r| r.contains_range(other))
    }

    /// The subset of `self` intersecting `ranges`, via a linear merge scan
    /// over both sorted sequences.
    pub fn slice(&self, ranges: &Ranges) -> Ranges {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < ranges.0.len() {
            let a = &self.0[i];
            let b = &ranges.0[j];
            if a.intersects(b) {
                let start = a.start.clone().max(b.start.clone());
                let end = match (&a.end, &b.end) {
                    (None, e) => e.clone(),
                    (e, None) => e.clone(),
                    (Some(ae), Some(be)) => Some(ae.min(be).clone()),
                };
                out.push(Range::new(start, end));
            }
            let a_ends_first = match (&a.end, &b.end) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(ae), Some(be)) => ae <= be,
            };
            if a_ends_first {
                i += 1;
            } else {
                j += 1;
            }
        }
        Ranges(out)
    }

    pub fn union(&self, other: &Ranges) -> Ranges {
        if self.0.is_empty() {
            return other.clone();
        }
        if other.0.is_empty() {
            return self.clone();
        }
        let mut combined = self.0.clone();
        combined.extend(other.0.iter().cloned());
        Ranges::new(combined)
    }
}

/// The concrete data a transaction reads or writes.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Seekables {
    Keys(Keys),
    Ranges(Ranges),
}

impl Seekables {
    pub fn to_unseekables(&self) -> Unseekables {
        match self {
            Seekables::Keys(k) => Unseekables::RoutingKeys(k.clone()),
            Seekables::Ranges(r) => Unseekables::RoutingRanges(r.clone()),
        }
    }
}

/// The routing-only projection of a Seekables, used for message dispatch.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Unseekables {
    RoutingKeys(Keys),
    RoutingRanges(Ranges),
}

impl Unseekables {
    pub fn contains_key(&self, key: &Key) -> bool {
        match self {
            Unseekables::RoutingKeys(k) => k.contains(key),
            Unseekables::RoutingRanges(r) => r.contains(key),
        }
    }

    /// Linear-merge union; panics (via caller's Error) only through
    /// `Route::union`, never here -- two heterogeneous Unseekables variants
    /// cannot be unioned, so callers are expected to have matched variants.
    fn union(&self, other: &Unseekables) -> Result<Unseekables, Error> {
        match (self, other) {
            (Unseekables::RoutingKeys(a), Unseekables::RoutingKeys(b)) => {
                Ok(Unseekables::RoutingKeys(a.union(b)))
            }
            (Unseekables::RoutingRanges(a), Unseekables::RoutingRanges(b)) => {
                Ok(Unseekables::RoutingRanges(a.union(b)))
            }
            _ => Err(err("cannot union a RoutingKeys Unseekables with a RoutingRanges Unseekables")),
        }
    }

    /// A conservative overlap test used by conflict detection: true iff
    /// the two projections might address a common key. Heterogeneous
    /// pairs (one Keys, one Ranges) are checked key-by-range; this is
    /// exact, not an approximation, since a Keys set can always be tested
    /// against a Ranges sequence directly.
    pub fn intersects(&self, other: &Unseekables) -> bool {
        match (self, other) {
            (Unseekables::RoutingKeys(a), Unseekables::RoutingKeys(b)) => {
                a.as_slice().iter().any(|k| b.contains(k))
            }
            (Unseekables::RoutingRanges(a), Unseekables::RoutingRanges(b)) => !a.slice(b).is_empty(),
            (Unseekables::RoutingKeys(k), Unseekables::RoutingRanges(r))
            | (Unseekables::RoutingRanges(r), Unseekables::RoutingKeys(k)) => {
                k.as_slice().iter().any(|key| r.contains(key))
            }
        }
    }

    fn insert_key(&self, key: &Key) -> Unseekables {
        match self {
            Unseekables::RoutingKeys(k) => {
                Unseekables::RoutingKeys(k.union(&Keys::new(vec![key.clone()])))
            }
            Unseekables::RoutingRanges(r) => {
                if r.contains(key) {
                    Unseekables::RoutingRanges(r.clone())
                } else {
                    let point = Range::new(key.clone(), Some(Key(append_zero(&key.0))));
                    Unseekables::RoutingRanges(r.union(&Ranges::new(vec![point])))
                }
            }
        }
    }
}

fn append_zero(bytes: &[u8]) -> Vec<u8> {
    let mut v = bytes.to_vec();
    v.push(0);
    v
}

/// A FullRoute's content covers the transaction's entire touched range-set.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct FullRoute {
    pub home_key: Key,
    pub content: Unseekables,
}

/// A PartialRoute covers a sub-range of the transaction's touched
/// range-set, tracked explicitly in `covering` so `covers()` can answer
/// without consulting the full route.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PartialRoute {
    pub home_key: Key,
    pub covering: Ranges,
    pub content: Unseekables,
}

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Route {
    Full(FullRoute),
    Partial(PartialRoute),
}

impl Route {
    pub fn home_key(&self) -> &Key {
        match self {
            Route::Full(f) => &f.home_key,
            Route::Partial(p) => &p.home_key,
        }
    }

    /// The route's content with the home key inserted if it is absent --
    /// every Route must contain its home key in this projection.
    pub fn to_maximal_unseekables(&self) -> Unseekables {
        match self {
            Route::Full(f) => {
                if f.content.contains_key(&f.home_key) {
                    f.content.clone()
                } else {
                    f.content.insert_key(&f.home_key)
                }
            }
            Route::Partial(p) => {
                if p.content.contains_key(&p.home_key) {
                    p.content.clone()
                } else {
                    p.content.insert_key(&p.home_key)
                }
            }
        }
    }

    /// True iff this route covers `ranges`: always true for a FullRoute,
    /// true for a PartialRoute iff its `covering` superset-contains `ranges`.
    pub fn covers(&self, ranges: &Ranges) -> bool {
        match self {
            Route::Full(_) => true,
            Route::Partial(p) => p.covering.contains_all(ranges),
        }
    }

    /// Unions two PartialRoutes. Their home keys must agree -- a
    /// PartialRoute with a mismatched home key union is an invariant
    /// violation (spec §7: "Route violation... fails loudly"), not a
    /// recoverable condition.
    pub fn union_partial(a: &PartialRoute, b: &PartialRoute) -> Result<PartialRoute, Error> {
        if a.home_key != b.home_key {
            return Err(err("cannot union PartialRoutes with different home keys"));
        }
        Ok(PartialRoute {
            home_key: a.home_key.clone(),
            covering: a.covering.union(&b.covering),
            content: a.content.union(&b.content)?,
        })
    }
}
