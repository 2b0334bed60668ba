//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod edit;
pub mod invariants;
pub mod merge;
pub mod path;
pub mod selector;
pub mod tags;
pub mod tools;
pub mod types;
