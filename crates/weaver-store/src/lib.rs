//! Persistence backends for Weaver.

mod store;

pub use store::SqliteStore;
