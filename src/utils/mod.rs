//! Small shared utilities.

mod kv_store;

pub use kv_store::KvStore;
