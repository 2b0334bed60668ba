//! Beam-search orchestration for model-driven code generation.
//!
//! A language model proposes tool calls (file edits, dependency installs,
//! `complete`); each candidate is applied to its own copy-on-write sandbox and
//! validated by a concurrent, fail-soft check pipeline. Failures flow back to
//! the model as tool results until some candidate validates.
//!
//! - **[`core`]**: Pure, deterministic logic (tool decoding, beam selection,
//!   tree invariants, merging). No I/O.
//! - **[`io`]**: Side-effecting adapters (config, processes, sandboxes, model
//!   bridges, prompts, checkpoints, progress events).
//!
//! Orchestration modules ([`actor`], [`stage`], [`session`]) combine the two:
//! one search per stage or unit, stages sequenced into a build, and a
//! multi-turn session on top.

pub mod actor;
pub mod core;
pub mod diff;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
pub mod stage;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tree;
pub mod validation;
