//! Persistence for the sync engine
//!
//! - [`MailStore`] and friends: structured state (SQLite or in-memory)
//! - [`BlobStore`]: compressed message bodies on disk

mod blob;
mod memory;
mod sqlite;
mod traits;

pub use blob::{BlobKey, BlobStore, BodyKind, FileBlobStore, InMemoryBlobStore};
pub use memory::InMemoryMailStore;
pub use sqlite::SqliteMailStore;
pub use traits::{
    EmailQuery, EngineStore, MailStore, OutboxStore, SeenIdStore, SummaryStore, TimestampLog,
};
