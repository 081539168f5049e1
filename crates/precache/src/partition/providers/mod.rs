//! # Partition Providers
//!
//! Backends implementing [`PartitionStore`] and [`Partition`].

pub use self::file::{FilePartition, FileStore};
pub use self::memory::{MemoryPartition, MemoryStore};
pub use self::provider::{EntryWriter, Partition, PartitionStore};

// Provider interface
pub mod provider;

// Individual provider implementations
pub mod file;
pub mod memory;
