//! Storage backends the upload driver writes to.
//!
//! A backend only has to provide idempotent "ensure" operations for the
//! container and the target object, and a handle that appends blocks to the
//! end of that object.

use std::future::Future;

use bytes::Bytes;

pub mod memory;
pub mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{operation} failed for {target}")]
    Request {
        operation: &'static str,
        target: String,
        transient: bool,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("container {0} does not exist")]
    ContainerNotFound(String),

    #[error("append position mismatch for {key}: expected {expected} bytes, object has {actual}")]
    PositionMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
}

impl StoreError {
    /// Returns true if repeating the failed request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Request {
                transient: true,
                ..
            }
        )
    }
}

/// A remote object that only grows by appending blocks at its end.
pub trait AppendObject {
    /// Appends `block` after everything appended so far.
    ///
    /// The block either lands entirely or the call fails. Callers must not
    /// issue the next append before this one returns.
    fn append_block(&mut self, block: Bytes) -> impl Future<Output = Result<(), StoreError>>;
}

pub trait BlobStore {
    type Object: AppendObject;

    /// Creates the container unless it already exists.
    fn ensure_container(&self, name: &str) -> impl Future<Output = Result<(), StoreError>>;

    /// Opens the append object `name`, creating it empty if it doesn't exist.
    fn ensure_append_object(
        &self,
        container: &str,
        name: &str,
    ) -> impl Future<Output = Result<Self::Object, StoreError>>;
}
