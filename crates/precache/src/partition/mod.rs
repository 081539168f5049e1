//! # Partition System
//!
//! Named, independently deletable stores of responses. The cache keeps
//! four of them per application: live content, install-time staging, the
//! version-independent manifest store and the bounded runtime partition.

pub mod providers;
mod types;

pub use providers::{
    EntryWriter, FilePartition, FileStore, MemoryPartition, MemoryStore, Partition,
    PartitionStore,
};
pub use types::{
    EntryMeta, MatchOptions, PartitionNames, PartitionResult, PartitionRole, ResponseHead,
    StoredResponse,
};
