//! At-rest protection for credentials persisted in the key/value table.

pub mod builtin;

pub use builtin::{parse_master_key, TokenSealer};
