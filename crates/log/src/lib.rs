//! Change log: immutable change records and the append-only change store.
//!
//! # Invariants
//! - The store is append-only; no update or delete operation exists.
//! - A failed append mutates nothing (the whole batch is validated first).
//! - Corrections are modeled as new changes, including tombstones.

pub mod change;

pub use change::{Change, ChangeStore, LogError};

pub fn crate_info() -> &'static str {
    "deltastore-log v0.1.0"
}
