#![forbid(unsafe_code)]

pub mod repo;
pub mod store;

pub use store::{AvatartStore, StorageError};
