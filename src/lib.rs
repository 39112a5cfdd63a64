// SlabPool - a self-tuning, size-classed slab allocator
//
// Serves many small, short-lived buffers out of page-backed slabs fronted
// by a three-tier block cache, and continuously retunes shard counts and
// per-class weights to the observed size distribution.

#![warn(rust_2018_idioms)]

pub mod allocator;
pub mod cache;
pub mod manager;
pub mod page;
pub mod shard;
pub mod size_class;
pub mod slab;
pub mod stats;
pub mod weight;

// Re-exports for convenience
pub use allocator::Allocator;
pub use size_class::{SizeCategory, SizeClass};
pub use stats::Stats;
pub use weight::config::{Config, Format};
pub use weight::hub::{Event, EventHub, EventType};
pub use weight::watcher::FileWatcher;
pub use weight::CancelToken;

/// SlabPool error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid argument: {0}")]
        BadArgument(String),

        #[error("OS failure (errno {0})")]
        OsFailure(i32),

        #[error("Out of memory: {0}")]
        OutOfMemory(String),

        #[error("Invalid configuration ({scope}): {detail}")]
        InvalidConfiguration { scope: String, detail: String },

        #[error("Queue closed")]
        QueueClosed,

        #[error("Queue full")]
        QueueFull,

        #[error("Buffer closed")]
        BufferClosed,

        #[error("Operation cancelled")]
        Cancelled,

        #[error("Timeout: {0}")]
        Timeout(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
