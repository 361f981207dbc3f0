//! Crate-level behaviour tests against fake sandbox filesystem executables.

mod behaviour;
