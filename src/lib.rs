pub mod common;
pub mod server;
pub mod transfer;

pub type Error = crate::common::error::MusterError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

// ID types
pub type JobId = u32;
pub type UserId = u32;
