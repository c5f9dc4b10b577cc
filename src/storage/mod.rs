pub mod sqlite;

pub use sqlite::{RepositoryStore, StagingPair, StorageError};
