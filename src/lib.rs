pub mod bookmarks;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod mongo;
pub mod output;
pub mod replicator;
pub mod scheduler;
pub mod stats;
pub mod sync;

pub use bookmarks::State;
pub use catalog::Catalog;
pub use config::Config;
pub use error::{Error, Result};
pub use replicator::Replicator;
