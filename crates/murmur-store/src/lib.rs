pub mod blobs;
pub mod database;
pub mod error;
pub mod json_file;
pub mod keys;
pub mod messages;
pub mod records;

pub use blobs::BlobStore;
pub use database::Database;
pub use error::StoreError;
pub use messages::MessageLog;
pub use records::{CollectionSpec, IdPolicy, RecordStore};
