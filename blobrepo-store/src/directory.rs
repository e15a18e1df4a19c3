//! Directory semantics on top of a store that only knows keys and
//! prefixes.

use std::collections::BTreeSet;

use tracing::debug;

use blobrepo_common::backend::{ListingPage, ObjectStoreClient};
use blobrepo_common::path::DELIMITER;
use blobrepo_common::{Namespace, ObjectKey, PathType, RepoError, Result};

const DELIMITER_STR: &str = "/";

#[derive(Debug, Clone, Copy)]
pub struct DirectoryEmulator {
    namespace: Namespace,
}

impl DirectoryEmulator {
    pub fn new(namespace: Namespace) -> Self {
        Self { namespace }
    }

    pub async fn exists(&self, client: &dyn ObjectStoreClient, key: &ObjectKey) -> Result<bool> {
        if key.is_root() {
            return Ok(true);
        }
        match self.namespace {
            Namespace::Hierarchical => {
                if client.exists(key).await? {
                    return Ok(true);
                }
                // Directories written without a marker still exist as prefixes.
                if key.is_directory_form() {
                    return has_entry_below(client, key.as_str()).await;
                }
                Ok(false)
            }
            Namespace::Flat => client.exists(&key.trim_directory()).await,
        }
    }

    /// Write a directory marker, and markers for any missing ancestors.
    /// No-op in the flat namespace and for the root.
    pub async fn create_directory(&self, client: &dyn ObjectStoreClient, key: &ObjectKey) -> Result<()> {
        if self.namespace == Namespace::Flat {
            return Ok(());
        }
        let mut missing = Vec::new();
        let mut current = Some(key.as_directory());
        while let Some(dir) = current.take() {
            if dir.is_root() || client.exists(&dir).await? {
                break;
            }
            current = dir.parent();
            missing.push(dir);
        }
        for dir in missing.iter().rev() {
            client.put_directory_marker(dir).await?;
            debug!(key = %dir, "Created directory marker");
        }
        Ok(())
    }

    /// Delete every object below `key`, including the marker in the
    /// hierarchical namespace.
    pub async fn delete_directory(&self, client: &dyn ObjectStoreClient, key: &ObjectKey) -> Result<()> {
        if key.is_root() {
            return Err(RepoError::InvalidPath("refusing to delete the repository root".into()));
        }
        let prefix = key.trim_directory().as_directory();
        let keys: BTreeSet<ObjectKey> = collect_pages(client, prefix.as_str(), None)
            .await?
            .into_iter()
            .flat_map(|page| page.keys)
            .filter(|k| k.starts_with(prefix.as_str()))
            .map(ObjectKey::new)
            .collect();

        debug!(prefix = %prefix, count = keys.len(), "Deleting directory");
        if keys.is_empty() {
            return Ok(());
        }
        client.delete_many(&keys).await
    }

    /// Immediate children of `key`, prefix stripped, sub-directories with
    /// a trailing `/`. Sorted and free of duplicates.
    pub async fn list_children(&self, client: &dyn ObjectStoreClient, key: &ObjectKey) -> Result<Vec<String>> {
        let prefix = key.trim_directory().as_directory();
        let pages = collect_pages(client, prefix.as_str(), Some(DELIMITER_STR)).await?;

        let mut children = BTreeSet::new();
        for entry in pages
            .into_iter()
            .flat_map(|page| page.keys.into_iter().chain(page.common_prefixes))
        {
            // Some stores ignore the trailing delimiter when filtering.
            let Some(rest) = entry.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let child = match rest.find(DELIMITER) {
                Some(idx) => &rest[..=idx],
                None => rest,
            };
            children.insert(child.to_string());
        }
        Ok(children.into_iter().collect())
    }

    pub async fn classify(&self, client: &dyn ObjectStoreClient, key: &ObjectKey) -> Result<PathType> {
        let is_directory = match self.namespace {
            Namespace::Hierarchical => {
                key.is_root()
                    || client.is_directory(key).await?
                    || (!key.is_directory_form() && client.is_directory(&key.as_directory()).await?)
            }
            Namespace::Flat => !key.trim_directory().as_str().contains(DELIMITER),
        };
        Ok(if is_directory { PathType::Directory } else { PathType::File })
    }
}

/// Whether any listed key or common prefix really sits below `prefix`.
/// Stops at the first page that has one.
async fn has_entry_below(client: &dyn ObjectStoreClient, prefix: &str) -> Result<bool> {
    let mut continuation: Option<String> = None;
    loop {
        let page = client
            .list_page(prefix, Some(DELIMITER_STR), continuation.as_deref())
            .await?;
        if page
            .keys
            .iter()
            .chain(&page.common_prefixes)
            .any(|entry| entry.starts_with(prefix))
        {
            return Ok(true);
        }
        continuation = page.continuation;
        if continuation.is_none() {
            return Ok(false);
        }
    }
}

/// Page through a listing until the store reports no continuation.
async fn collect_pages(
    client: &dyn ObjectStoreClient,
    prefix: &str,
    delimiter: Option<&str>,
) -> Result<Vec<ListingPage>> {
    let mut pages = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let page = client
            .list_page(prefix, delimiter, continuation.as_deref())
            .await?;
        continuation = page.continuation.clone();
        pages.push(page);
        if continuation.is_none() {
            return Ok(pages);
        }
    }
}
