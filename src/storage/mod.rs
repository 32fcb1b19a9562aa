//! Persistent state and blob storage.
//!
//! - **Status store** ([`StatusStore`], [`SqliteStatusStore`]): run stage,
//!   attempt counters, candidate images with evaluation and caption state,
//!   validation results and consumer links.
//! - **Blob storage** ([`BlobStorage`]): dataset images, training archives
//!   and adapter files.
//! - **Migrations**: schema management through a `_migrations` table.
//!
//! ```rust,ignore
//! use persona_forge::storage::{SqliteStatusStore, StatusStore};
//!
//! let store = SqliteStatusStore::connect("persona-forge.db").await?;
//! let run = store.get_run(run_id).await?;
//! let counts = store.image_counts(run_id).await?;
//! ```

pub mod blob;
pub mod migrations;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use blob::{BlobStorage, HttpBlobConfig, HttpBlobStorage, LocalBlobStorage};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use sqlite::SqliteStatusStore;
pub use store::{ConsumerLink, StatusStore};
