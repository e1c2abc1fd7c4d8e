//! Keyed limiter registry with idle eviction.

mod keyed;
mod sweeper;

pub use keyed::{Registry, RegistryBuilder};
