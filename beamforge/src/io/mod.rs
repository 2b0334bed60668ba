//! Side-effecting adapters: configuration, processes, sandboxes, models, prompts, persistence.

pub mod checkpoint;
pub mod config;
pub mod events;
pub mod init;
pub mod model;
pub mod process;
pub mod prompt;
pub mod sandbox;
pub mod service;
pub mod workspace;
