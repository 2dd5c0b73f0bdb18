// Linearizability oracle (spec.md §8.a): per key, tracks which event sits
// at which position in the order reads have revealed so far, and flags a
// violation the moment two observations can't both be telling the truth.
//
// This is an external collaborator per spec.md §1 ("the linearizability
// verifier, specified only as an oracle in §8"), not part of the
// coordination core -- `drift-txn`'s own integration tests drive it to
// check the scenarios in spec.md §8.b, but nothing in `drift-txn` depends
// on this crate at runtime.
//
// Time is a caller-supplied logical tick (the same deterministic
// convention `drift_txn::Clock`/`ProgressLog` use), not wall-clock.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

pub type Time = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
enum Presence {
    Unknown,
    Present,
    Absent,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct EventRecord<E> {
    position: usize,
    visible_by: Option<Time>,
    visible_until: Option<Time>,
    result: Presence,
    _event: std::marker::PhantomData<E>,
}

impl<E> EventRecord<E> {
    fn new(position: usize) -> Self {
        EventRecord {
            position,
            visible_by: None,
            visible_until: None,
            result: Presence::Unknown,
            _event: std::marker::PhantomData,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Violation<E> {
    /// Two reads disagree about which event sits at a shared position.
    PositionDisagreement { position: usize, first: E, second: E },
    /// An event's visibility window overlaps the next position's in a way
    /// that implies they were not linearized in position order.
    VisibilityOverlap { earlier: E, later: E },
    /// An event a prior read declared absent is now reported present.
    AbsentThenPresent { event: E },
}

/// Per-key linearizability state. One instance per key; the embedder owns
/// a map from key to `KeyOracle` (not provided here, since the core never
/// assumes a particular key type beyond `Ord + Clone`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(bound = "E: Ord + Serialize + serde::de::DeserializeOwned")]
pub struct KeyOracle<E: Ord + Clone + Debug> {
    events_by_position: BTreeMap<usize, E>,
    records: BTreeMap<E, EventRecord<E>>,
}

impl<E: Ord + Clone + Debug> KeyOracle<E> {
    pub fn new() -> Self {
        KeyOracle { events_by_position: BTreeMap::new(), records: BTreeMap::new() }
    }

    /// Observe one read of this key's write sequence, valid throughout
    /// `[start, end]`. `sequence` is every write the read considered
    /// applied, in commit order -- a prefix of the "true" total order.
    pub fn observe_read(&mut self, sequence: &[E], start: Time, end: Time) -> Result<(), Violation<E>> {
        // Bind each prefix position to its event, or confirm agreement
        // with whatever an earlier read already bound it to.
        for (position, event) in sequence.iter().enumerate() {
            match self.events_by_position.get(&position) {
                Some(existing) if existing != event => {
                    return Err(Violation::PositionDisagreement {
                        position,
                        first: existing.clone(),
                        second: event.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    self.events_by_position.insert(position, event.clone());
                }
            }
        }

        // Any event already bound to a position beyond this read's length
        // wasn't observed: this read declares it absent as of `end`.
        let not_observed: Vec<E> = self
            .events_by_position
            .range(sequence.len()..)
            .map(|(_, e)| e.clone())
            .collect();
        for event in not_observed {
            let rec = self
                .records
                .entry(event.clone())
                .or_insert_with(|| EventRecord::new(self.events_by_position.iter().find(|(_, e)| **e == event).map(|(p, _)| *p).unwrap_or(usize::MAX)));
            rec.result = Presence::Absent;
        }

        for (position, event) in sequence.iter().enumerate() {
            let rec = self.records.entry(event.clone()).or_insert_with(|| EventRecord::new(position));
            if rec.result == Presence::Absent {
                return Err(Violation::AbsentThenPresent { event: event.clone() });
            }
            rec.position = position;
            rec.visible_by = Some(rec.visible_by.map_or(end, |v| v.min(end)));
            rec.visible_until = Some(rec.visible_until.map_or(start, |v| v.max(start)));
            rec.result = Presence::Present;
        }

        for window in sequence.windows(2) {
            let (earlier, later) = (&window[0], &window[1]);
            let earlier_until = self.records.get(earlier).and_then(|r| r.visible_until);
            let later_by = self.records.get(later).and_then(|r| r.visible_by);
            if let (Some(vu), Some(vb)) = (earlier_until, later_by) {
                if vu >= vb {
                    return Err(Violation::VisibilityOverlap {
                        earlier: earlier.clone(),
                        later: later.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
