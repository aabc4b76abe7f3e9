pub mod config;
pub mod cookies;
pub mod error;
pub mod metadata;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod sweeper;
pub mod task;
pub mod validate;

#[cfg(test)]
mod test_support;
