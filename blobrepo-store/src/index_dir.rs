//! Local side of a transfer: the directory holding the index files of a
//! search core.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite};

use blobrepo_common::footer::FOOTER_LENGTH;
use blobrepo_common::{RepoError, Result};

/// An index file opened for reading.
pub struct IndexInput {
    pub name: String,
    pub length: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

#[async_trait]
pub trait IndexDirectory: Send + Sync {
    async fn open_input(&self, name: &str) -> Result<IndexInput>;

    /// Create a new file; existing files are never overwritten.
    async fn create_output(&self, name: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Size of the checksum record every index file ends with.
    fn footer_length(&self) -> u64 {
        FOOTER_LENGTH
    }
}

/// [`IndexDirectory`] over a directory on the local file system.
#[derive(Debug, Clone)]
pub struct FsIndexDirectory {
    root: PathBuf,
}

impl FsIndexDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file_path(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        if name.is_empty() {
            return Err(RepoError::InvalidPath("file name cannot be empty".into()));
        }
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(RepoError::InvalidPath(format!(
                "file name must stay inside the index directory: {name}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

fn map_not_found(err: std::io::Error, path: &Path) -> RepoError {
    if err.kind() == std::io::ErrorKind::NotFound {
        RepoError::NotFound(path.display().to_string())
    } else {
        RepoError::Io(err)
    }
}

#[async_trait]
impl IndexDirectory for FsIndexDirectory {
    async fn open_input(&self, name: &str) -> Result<IndexInput> {
        let path = self.file_path(name)?;
        let file = File::open(&path).await.map_err(|e| map_not_found(e, &path))?;
        let length = file.metadata().await?.len();
        Ok(IndexInput {
            name: name.to_string(),
            length,
            reader: Box::new(file),
        })
    }

    async fn create_output(&self, name: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let path = self.file_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Box::new(file))
    }
}
