// The data-store interface an embedder implements (spec.md §6.2). The core
// never inspects values -- they're opaque byte strings keyed by the same
// `Key` type routing uses -- and only ever calls these two operations,
// scoped to a single command's read or a single CommandStore's apply.
//
// Mirrors how `submerge-txn::Store` is declared as a trait the embedder
// supplies rather than a concrete type the protocol owns.

use std::collections::BTreeMap;

use drift_base::Error;

use crate::command::Writes;
use crate::routable::{Key, Keys};

pub trait Store {
    /// Read the current value of every key in `keys` that has one. Keys
    /// with no stored value are simply absent from the result map.
    fn read(&self, keys: &Keys) -> Result<BTreeMap<Key, Vec<u8>>, Error>;

    /// Apply a batch of writes atomically (spec.md §6.2: "atomic at the
    /// per-CommandStore level").
    fn apply(&mut self, writes: &Writes) -> Result<(), Error>;
}
