use std::collections::BTreeSet;

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::{RepoError, Result};
use crate::path::ObjectKey;

/// Content type stored on directory marker objects.
pub const DIRECTORY_CONTENT_TYPE: &str = "application/x-directory";

/// User metadata attribute (without the `x-amz-meta-` prefix) flagging a
/// directory marker.
pub const DIRECTORY_META_ATTRIBUTE: &str = "directory";

/// Streaming body of an object. Dropping it releases the connection.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Metadata returned by a HEAD on a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: ObjectKey,
    pub size: u64,
    pub is_directory: bool,
}

/// One page of a prefix listing. `continuation` is `None` on the last page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub keys: Vec<String>,
    pub common_prefixes: Vec<String>,
    pub continuation: Option<String>,
}

/// Trait implemented by every object store client.
///
/// The client only moves bytes and metadata for single keys or key
/// prefixes; directory semantics and path handling live above it. All
/// network, authentication and protocol failures surface as
/// `RepoError::Transport`.
#[async_trait::async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Fetch metadata of the object stored at `key`.
    async fn head(&self, key: &ObjectKey) -> Result<ObjectMeta>;

    /// Open a streaming read of the object at `key`.
    async fn open_read(&self, key: &ObjectKey) -> Result<ObjectReader>;

    /// Open a sink that replaces the object at `key` once finished.
    async fn open_write(&self, key: &ObjectKey) -> Result<Box<dyn ObjectSink>>;

    /// Store a zero-byte directory marker at `key`.
    async fn put_directory_marker(&self, key: &ObjectKey) -> Result<()>;

    /// Delete every key in `keys`. Keys missing from the store are
    /// reported as `NotFound` after the remaining keys were deleted.
    async fn delete_many(&self, keys: &BTreeSet<ObjectKey>) -> Result<()>;

    /// List one page of keys starting with `prefix`. With a delimiter,
    /// keys containing it after the prefix are rolled up into
    /// `common_prefixes`.
    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ListingPage>;

    async fn exists(&self, key: &ObjectKey) -> Result<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(RepoError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Size in bytes of a regular object.
    async fn head_length(&self, key: &ObjectKey) -> Result<u64> {
        let meta = self.head(key).await?;
        if meta.is_directory {
            return Err(RepoError::IsDirectory(key.to_string()));
        }
        Ok(meta.size)
    }

    /// Whether `key` holds a directory marker. Missing keys are not
    /// directories.
    async fn is_directory(&self, key: &ObjectKey) -> Result<bool> {
        match self.head(key).await {
            Ok(meta) => Ok(meta.is_directory),
            Err(RepoError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Write side of an object upload.
///
/// Nothing is visible in the store until `finish` returns. A sink that is
/// dropped or aborted leaves the previous object (if any) untouched.
#[async_trait::async_trait]
pub trait ObjectSink: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Commit the upload.
    async fn finish(self: Box<Self>) -> Result<()>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>);
}
