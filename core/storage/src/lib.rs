//! Store adapters for profilesync.
//!
//! The sync engine talks to three external collaborators through the traits
//! defined here:
//! - [`RemoteStore`]: the authoritative remote document store
//! - [`LocalStore`]: the per-device persistent key-value store
//! - [`ReachabilitySignal`]: the platform's connectivity signal
//!
//! In-memory implementations of each are provided for tests and development,
//! plus a file-backed local store.
//!
//! # Design Principles
//! - Provider isolation: no backend-specific logic in the sync engine
//! - Async operations: all I/O operations are async
//! - Unified error semantics: consistent error types across backends

pub mod local;
pub mod memory;
pub mod network;
pub mod remote;

pub use local::{FileLocalStore, LocalStore, MemoryLocalStore};
pub use memory::MemoryRemoteStore;
pub use network::{ManualReachability, ReachabilitySignal};
pub use remote::{BatchWrite, ChangeStream, RemoteStore, StoredDocument};
