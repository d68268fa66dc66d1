pub mod archive;
pub mod check;
pub mod cleanup;
pub mod commands;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod dependency;
pub mod error;
pub mod http;
pub mod install;
pub mod installer;
pub mod lease;
pub mod messages;
pub mod progress;
pub mod repository;
pub mod resolver;
pub mod runtime;
pub mod scheduler;
pub mod version;
pub mod worker;

pub use error::{Error, Result};

/// Repositories and installers faked for orchestration tests.
#[cfg(test)]
pub mod test_utils;
