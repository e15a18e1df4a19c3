//! In-process object store.
//!
//! Selected with `mock = true`. Listing follows ListObjectsV2: keys come
//! back sorted, a delimiter rolls deeper keys up into common prefixes, and
//! pages are capped at `page_size` entries with the last entry as the
//! continuation token.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::debug;

use blobrepo_common::backend::{ListingPage, ObjectMeta, ObjectReader, ObjectSink, ObjectStoreClient};
use blobrepo_common::{ObjectKey, RepoError, Result};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    is_directory: bool,
}

#[derive(Clone)]
pub struct MemoryBackend {
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
    page_size: usize,
    loose_prefix: bool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            page_size: DEFAULT_PAGE_SIZE,
            loose_prefix: false,
        }
    }

    /// Cap listing pages at `page_size` entries (keys plus prefixes).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Ignore a trailing `/` in listing prefixes, the way some S3 mock
    /// servers do.
    pub fn with_loose_prefix_filter(mut self) -> Self {
        self.loose_prefix = true;
        self
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `data` at `key` directly.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects().insert(
            key.into(),
            StoredObject {
                data: data.into(),
                is_directory: false,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects().get(key).map(|o| o.data.clone())
    }

    /// All stored keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    fn prefix_filter<'a>(&self, prefix: &'a str) -> &'a str {
        if self.loose_prefix {
            prefix.trim_end_matches('/')
        } else {
            prefix
        }
    }
}

/// A listing entry: either a key or a rolled-up common prefix.
enum Entry {
    Key(String),
    Prefix(String),
}

impl Entry {
    fn marker(&self) -> &str {
        match self {
            Entry::Key(k) | Entry::Prefix(k) => k,
        }
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryBackend {
    async fn head(&self, key: &ObjectKey) -> Result<ObjectMeta> {
        let objects = self.objects();
        let object = objects
            .get(key.as_str())
            .ok_or_else(|| RepoError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            key: key.clone(),
            size: object.data.len() as u64,
            is_directory: object.is_directory,
        })
    }

    async fn open_read(&self, key: &ObjectKey) -> Result<ObjectReader> {
        let data = self
            .get(key.as_str())
            .ok_or_else(|| RepoError::NotFound(key.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn open_write(&self, key: &ObjectKey) -> Result<Box<dyn ObjectSink>> {
        Ok(Box::new(MemorySink {
            backend: self.clone(),
            key: key.to_string(),
            buffer: BytesMut::new(),
        }))
    }

    async fn put_directory_marker(&self, key: &ObjectKey) -> Result<()> {
        self.objects().insert(
            key.to_string(),
            StoredObject {
                data: Bytes::new(),
                is_directory: true,
            },
        );
        Ok(())
    }

    async fn delete_many(&self, keys: &BTreeSet<ObjectKey>) -> Result<()> {
        let mut objects = self.objects();
        let missing: Vec<&str> = keys
            .iter()
            .filter(|key| objects.remove(key.as_str()).is_none())
            .map(ObjectKey::as_str)
            .collect();
        debug!(deleted = keys.len() - missing.len(), missing = missing.len(), "Memory delete complete");
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RepoError::NotFound(missing.join(", ")))
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ListingPage> {
        let objects = self.objects();
        let filter = self.prefix_filter(prefix);
        let start = match continuation {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Unbounded,
        };

        // A token that is itself a rolled-up prefix covers every key below it.
        let rolled_up = match (continuation, delimiter) {
            (Some(token), Some(delim)) if !delim.is_empty() => token
                .strip_prefix(prefix)
                .filter(|rest| rest.contains(delim))
                .map(|_| token),
            _ => None,
        };

        let mut entries: Vec<Entry> = Vec::new();
        let mut truncated = false;
        for key in objects
            .range::<String, _>((start, Bound::Unbounded))
            .map(|(k, _)| k)
            .filter(|k| k.starts_with(filter))
        {
            if rolled_up.is_some_and(|p| key.starts_with(p)) {
                continue;
            }

            let entry = match (delimiter, key.strip_prefix(prefix)) {
                (Some(delim), Some(rest)) if !delim.is_empty() => match rest.find(delim) {
                    Some(idx) => Entry::Prefix(format!("{}{}", prefix, &rest[..idx + delim.len()])),
                    None => Entry::Key(key.clone()),
                },
                _ => Entry::Key(key.clone()),
            };

            if let (Entry::Prefix(p), Some(Entry::Prefix(last))) = (&entry, entries.last()) {
                if p == last {
                    continue;
                }
            }
            if entries.len() == self.page_size {
                truncated = true;
                break;
            }
            entries.push(entry);
        }

        let continuation = if truncated {
            entries.last().map(|e| e.marker().to_string())
        } else {
            None
        };
        let mut page = ListingPage {
            continuation,
            ..ListingPage::default()
        };
        for entry in entries {
            match entry {
                Entry::Key(k) => page.keys.push(k),
                Entry::Prefix(p) => page.common_prefixes.push(p),
            }
        }
        Ok(page)
    }
}

struct MemorySink {
    backend: MemoryBackend,
    key: String,
    buffer: BytesMut,
}

#[async_trait]
impl ObjectSink for MemorySink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let MemorySink { backend, key, buffer } = *self;
        debug!(key = %key, size = buffer.len(), "Memory upload complete");
        backend.insert(key, buffer.freeze());
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        debug!(key = %self.key, "Memory upload aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn backend_with(keys: &[&str]) -> MemoryBackend {
        let backend = MemoryBackend::new();
        for key in keys {
            backend.insert(*key, Bytes::from_static(b"x"));
        }
        backend
    }

    #[tokio::test]
    async fn test_sink_commits_on_finish_only() {
        let backend = MemoryBackend::new();
        let key = ObjectKey::new("a/f");

        let mut sink = backend.open_write(&key).await.unwrap();
        sink.write(Bytes::from_static(b"hello ")).await.unwrap();
        sink.write(Bytes::from_static(b"world")).await.unwrap();
        assert!(!backend.exists(&key).await.unwrap());
        sink.finish().await.unwrap();

        let mut reader = backend.open_read(&key).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
        assert_eq!(backend.head_length(&key).await.unwrap(), 11);

        let mut sink = backend.open_write(&ObjectKey::new("a/g")).await.unwrap();
        sink.write(Bytes::from_static(b"partial")).await.unwrap();
        sink.abort().await;
        assert_eq!(backend.get("a/g"), None);
    }

    #[tokio::test]
    async fn test_directory_marker_head() {
        let backend = MemoryBackend::new();
        let key = ObjectKey::new("dir/");
        backend.put_directory_marker(&key).await.unwrap();
        assert!(backend.is_directory(&key).await.unwrap());
        assert!(matches!(
            backend.head_length(&key).await,
            Err(RepoError::IsDirectory(_))
        ));
        assert!(!backend.is_directory(&ObjectKey::new("nope/")).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_with_delimiter_rolls_up_prefixes() {
        let backend = backend_with(&["a/", "a/b/f3", "a/b/f4", "a/f1", "a/f2", "b/f5"]);
        let page = backend.list_page("a/", Some("/"), None).await.unwrap();
        assert_eq!(page.keys, vec!["a/", "a/f1", "a/f2"]);
        assert_eq!(page.common_prefixes, vec!["a/b/"]);
        assert_eq!(page.continuation, None);

        let page = backend.list_page("a/", None, None).await.unwrap();
        assert_eq!(page.keys.len(), 5);
    }

    #[tokio::test]
    async fn test_list_paginates_past_common_prefix() {
        let backend = backend_with(&["a/b/f3", "a/b/f4", "a/f1"]).with_page_size(1);

        let first = backend.list_page("a/", Some("/"), None).await.unwrap();
        assert_eq!(first.common_prefixes, vec!["a/b/"]);
        let token = first.continuation.clone().unwrap();

        let second = backend.list_page("a/", Some("/"), Some(&token)).await.unwrap();
        assert_eq!(second.keys, vec!["a/f1"]);
        assert_eq!(second.continuation, None);
    }

    #[tokio::test]
    async fn test_loose_prefix_filter() {
        let backend = backend_with(&["a/f1", "ab"]).with_loose_prefix_filter();
        let page = backend.list_page("a/", Some("/"), None).await.unwrap();
        assert_eq!(page.keys, vec!["a/f1", "ab"]);
    }

    #[tokio::test]
    async fn test_delete_many_reports_missing() {
        let backend = backend_with(&["a", "b"]);
        let keys: BTreeSet<ObjectKey> = ["a", "c"].into_iter().map(ObjectKey::new).collect();
        let err = backend.delete_many(&keys).await.unwrap_err();
        assert!(matches!(err, RepoError::NotFound(ref k) if k == "c"));
        assert_eq!(backend.keys(), vec!["b"]);
    }
}
