//! facewatch-store: SQLite persistence for facewatch.
//!
//! Implements the core's identity store, settings provider and event sink
//! over one database, plus identity registration guarded against duplicate
//! faces.

pub mod error;
pub mod identities;
pub mod store;

pub use error::{Result, StoreError};
pub use identities::{IdentitySummary, RegisteredFace};
pub use store::{default_db_path, SqliteStore};
