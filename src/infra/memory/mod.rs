//! In-process backends used as test doubles.

mod kv;
mod repos;

pub use kv::MemoryKv;
pub use repos::InMemoryRepositories;
