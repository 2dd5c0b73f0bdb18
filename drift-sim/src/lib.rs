//! Placeholder for the simulation / burn-test runner (spec.md §1: "the
//! simulation burn-test runner" is an out-of-scope external collaborator).
//! A real implementation would drive a cluster of `drift_txn::CommandStore`s
//! against an injected, seeded network fault model and replay the result
//! through `drift_verify`; none of that is built here, so this crate
//! exists only to keep the workspace's crate layout honest about where
//! that harness would live.
