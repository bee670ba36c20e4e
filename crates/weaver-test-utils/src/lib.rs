//! Shared test utilities for Weaver crates.

mod fixtures;
mod mock_executor;

pub use fixtures::{chain, diamond, test_config, write_workflow};
pub use mock_executor::MockExecutor;
