// The example in-memory data store (spec.md §1, §6.2): stands in for
// whatever real keyed store an embedder plugs into `drift_txn::Store`.
// Deliberately a test/demo shim, not a production store -- no persistence,
// no multi-version history, just a `BTreeMap<Key, Vec<u8>>` behind the two
// operations the core actually calls.
//
// Grounded on `submerge-txn::Store`, which the teacher declares as a bare
// trait (`get`/`put`/`abort`) for an embedder to implement rather than
// owning a concrete store itself; this crate is that embedder.

use std::collections::BTreeMap;

use drift_base::Error;
use drift_txn::{Key, Keys, Store, Writes};

#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    values: BTreeMap<Key, Vec<u8>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore { values: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Store for InMemoryStore {
    fn read(&self, keys: &Keys) -> Result<BTreeMap<Key, Vec<u8>>, Error> {
        Ok(keys
            .as_slice()
            .iter()
            .filter_map(|k| self.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    fn apply(&mut self, writes: &Writes) -> Result<(), Error> {
        for (key, value) in writes {
            self.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}
