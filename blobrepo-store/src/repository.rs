//! Backup repository facade: the operations a search server calls to back
//! up index files to, and restore them from, an object store.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use blobrepo_common::backend::{ObjectReader, ObjectSink, ObjectStoreClient};
use blobrepo_common::{LogicalPath, Namespace, ObjectKey, PathType, RepoError, Result};

use crate::backend;
use crate::config::{Properties, RepositoryConfig};
use crate::directory::DirectoryEmulator;
use crate::index_dir::IndexDirectory;
use crate::transfer::TransferEngine;

/// A remote file opened for reading.
pub struct RemoteInput {
    pub key: ObjectKey,
    pub length: u64,
    pub reader: ObjectReader,
}

pub struct BackupRepository {
    namespace: Namespace,
    directories: DirectoryEmulator,
    engine: TransferEngine,
    properties: Properties,
    client: Option<Box<dyn ObjectStoreClient>>,
}

impl BackupRepository {
    /// An uninitialized repository; call [`BackupRepository::init`] before use.
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            directories: DirectoryEmulator::new(namespace),
            engine: TransferEngine::default(),
            properties: Properties::new(),
            client: None,
        }
    }

    /// A repository over an already constructed client.
    pub fn with_client(namespace: Namespace, client: Box<dyn ObjectStoreClient>) -> Self {
        let mut repo = Self::new(namespace);
        repo.client = Some(client);
        repo
    }

    pub fn with_engine(mut self, engine: TransferEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Configure the repository, replacing and closing any previous client.
    pub fn init(&mut self, properties: Properties) -> Result<()> {
        let config = RepositoryConfig::from_properties(&properties)?;
        self.init_with_config(properties, &config)
    }

    pub fn init_with_config(&mut self, properties: Properties, config: &RepositoryConfig) -> Result<()> {
        let client = backend::from_config(config)?;
        self.properties = properties;
        if self.client.replace(client).is_some() {
            debug!("Closed previous object store client");
        }
        info!(namespace = %self.namespace, "Backup repository initialized");
        Ok(())
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn config_property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    fn client(&self) -> Result<&dyn ObjectStoreClient> {
        self.client
            .as_deref()
            .ok_or_else(|| RepoError::Config("repository not initialized".into()))
    }

    /// Normalize a host-supplied location into a directory path without
    /// touching the store.
    pub fn normalize(&self, location: &str) -> Result<LogicalPath> {
        self.namespace.normalize(location)
    }

    /// Normalize `location` and make sure its directory exists. Failing to
    /// create the directory is logged, not returned.
    pub async fn create_uri(&self, location: &str) -> Result<LogicalPath> {
        let path = self.normalize(location)?;
        debug!(location, path = %path, "Create URI");
        if let Err(e) = self.ensure_directory(&path).await {
            warn!(path = %path, error = %e, "Could not create directory for location");
        }
        Ok(path)
    }

    async fn ensure_directory(&self, path: &LogicalPath) -> Result<()> {
        if !self.exists(path).await? {
            self.create_directory(path).await?;
        }
        Ok(())
    }

    pub fn resolve<S: AsRef<str>>(&self, base: &LogicalPath, components: &[S]) -> Result<LogicalPath> {
        self.namespace.resolve(base, components)
    }

    pub fn resolve_directory<S: AsRef<str>>(
        &self,
        base: &LogicalPath,
        components: &[S],
    ) -> Result<LogicalPath> {
        self.namespace.resolve_directory(base, components)
    }

    pub async fn exists(&self, path: &LogicalPath) -> Result<bool> {
        let key = self.namespace.to_object_key(path);
        debug!(key = %key, "Path exists");
        self.directories.exists(self.client()?, &key).await
    }

    pub async fn create_directory(&self, path: &LogicalPath) -> Result<()> {
        let key = self.namespace.directory_key(path);
        debug!(key = %key, "Create directory");
        self.directories.create_directory(self.client()?, &key).await
    }

    pub async fn delete_directory(&self, path: &LogicalPath) -> Result<()> {
        let key = self.namespace.directory_key(path);
        debug!(key = %key, "Delete directory");
        self.directories.delete_directory(self.client()?, &key).await
    }

    /// Delete the named files below `path`. Missing files fail the call
    /// unless `ignore_missing` is set.
    pub async fn delete<S: AsRef<str>>(
        &self,
        path: &LogicalPath,
        files: &[S],
        ignore_missing: bool,
    ) -> Result<()> {
        let mut keys = BTreeSet::new();
        for file in files {
            let file_path = self.resolve(path, &[file.as_ref()])?;
            keys.insert(self.namespace.file_key(&file_path)?);
        }
        if keys.is_empty() {
            return Ok(());
        }

        debug!(path = %path, count = keys.len(), ignore_missing, "Delete files");
        match self.client()?.delete_many(&keys).await {
            Err(RepoError::NotFound(missing)) if ignore_missing => {
                debug!(missing = %missing, "Ignoring missing files");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn list_all(&self, path: &LogicalPath) -> Result<Vec<String>> {
        let key = self.namespace.to_object_key(path);
        debug!(key = %key, "List all");
        self.directories.list_children(self.client()?, &key).await
    }

    pub async fn get_path_type(&self, path: &LogicalPath) -> Result<PathType> {
        let key = self.namespace.to_object_key(path);
        debug!(key = %key, "Get path type");
        self.directories.classify(self.client()?, &key).await
    }

    pub async fn open_input(&self, path: &LogicalPath, file_name: &str) -> Result<RemoteInput> {
        require_name(file_name, "need a valid file name to read from the store")?;
        let key = self.namespace.file_key(&self.resolve(path, &[file_name])?)?;
        debug!(key = %key, "Read from store");

        let client = self.client()?;
        let length = client.head_length(&key).await?;
        let reader = client.open_read(&key).await?;
        Ok(RemoteInput { key, length, reader })
    }

    pub async fn create_output(&self, path: &LogicalPath) -> Result<Box<dyn ObjectSink>> {
        let key = self.namespace.file_key(path)?;
        debug!(key = %key, "Write to store");
        self.client()?.open_write(&key).await
    }

    /// Back up `file_name` from `source_dir` into the directory `dest`.
    pub async fn copy_file_from(
        &self,
        source_dir: &dyn IndexDirectory,
        file_name: &str,
        dest: &LogicalPath,
    ) -> Result<()> {
        self.copy_index_file_from(source_dir, file_name, dest, file_name).await
    }

    pub async fn copy_index_file_from(
        &self,
        source_dir: &dyn IndexDirectory,
        source_file_name: &str,
        dest: &LogicalPath,
        dest_file_name: &str,
    ) -> Result<()> {
        require_name(source_file_name, "must have a valid source file name to copy")?;
        require_name(dest_file_name, "must have a valid destination file name to copy")?;

        let key = self.namespace.file_key(&self.resolve(dest, &[dest_file_name])?)?;
        let client = self.client()?;
        let start = Instant::now();
        debug!(key = %key, "Upload started");

        let input = source_dir.open_input(source_file_name).await?;
        let footer_length = source_dir.footer_length();
        if input.length <= footer_length {
            return Err(RepoError::CorruptSource {
                name: input.name,
                reason: format!("file is too small: {}", input.length),
            });
        }
        if let Some(parent) = key.parent() {
            self.directories.create_directory(client, &parent).await?;
        }
        let size = self
            .engine
            .copy_into_store(client, input, footer_length, &key)
            .await?;

        info!(key = %key, size, elapsed_ms = start.elapsed().as_millis() as u64, "Upload finished");
        Ok(())
    }

    /// Restore `file_name` from `source` into `dest_dir`.
    ///
    /// In the flat namespace `file_name` is a fully qualified key; the local
    /// file is named after everything past its first `/`.
    pub async fn copy_file_to(
        &self,
        source: &LogicalPath,
        file_name: &str,
        dest_dir: &dyn IndexDirectory,
    ) -> Result<()> {
        match self.namespace {
            Namespace::Hierarchical => {
                self.copy_index_file_to(source, file_name, dest_dir, file_name).await
            }
            Namespace::Flat => {
                let local_name = file_name
                    .split_once('/')
                    .map_or(file_name, |(_, rest)| rest);
                self.copy_index_file_to(&self.namespace.root(), file_name, dest_dir, local_name)
                    .await
            }
        }
    }

    pub async fn copy_index_file_to(
        &self,
        source: &LogicalPath,
        source_file_name: &str,
        dest_dir: &dyn IndexDirectory,
        dest_file_name: &str,
    ) -> Result<()> {
        require_name(source_file_name, "must have a valid source file name to copy")?;
        require_name(dest_file_name, "must have a valid destination file name to copy")?;

        let key = self.namespace.file_key(&self.resolve(source, &[source_file_name])?)?;
        let client = self.client()?;
        let start = Instant::now();
        debug!(key = %key, "Download started");

        // Fail before a local file is created for a missing or directory key.
        client.head_length(&key).await?;
        let mut output = dest_dir.create_output(dest_file_name).await?;
        let size = self
            .engine
            .copy_out_of_store(client, &key, output.as_mut())
            .await?;

        info!(key = %key, size, elapsed_ms = start.elapsed().as_millis() as u64, "Download finished");
        Ok(())
    }

    /// Release the object store client. The repository must be
    /// re-initialized before further use.
    pub fn close(&mut self) {
        if self.client.take().is_some() {
            debug!("Object store client closed");
        }
    }
}

fn require_name(name: &str, message: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RepoError::InvalidPath(message.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::index_dir::FsIndexDirectory;
    use blobrepo_common::footer::seal;
    use tokio::io::AsyncReadExt;

    fn repo(namespace: Namespace) -> (BackupRepository, MemoryBackend) {
        let backend = MemoryBackend::new();
        let repo = BackupRepository::with_client(namespace, Box::new(backend.clone()));
        (repo, backend)
    }

    #[tokio::test]
    async fn test_uninitialized_repository() {
        let repo = BackupRepository::new(Namespace::Hierarchical);
        let err = repo.exists(&Namespace::Hierarchical.root()).await.unwrap_err();
        assert!(matches!(err, RepoError::Config(_)));
    }

    #[tokio::test]
    async fn test_init_with_mock_and_reinit() {
        let mut repo = BackupRepository::new(Namespace::Flat);
        let props: Properties = [
            ("mock".to_string(), "true".to_string()),
            ("bucket.name".to_string(), "backups".to_string()),
        ]
        .into();
        let config = RepositoryConfig::resolve_with(&props, |_| None).unwrap();
        repo.init_with_config(props.clone(), &config).unwrap();
        assert_eq!(repo.config_property("bucket.name"), Some("backups"));
        assert_eq!(repo.config_property("missing"), None);

        repo.init_with_config(props, &config).unwrap();
        assert!(repo.exists(&repo.namespace().root()).await.unwrap());

        repo.close();
        assert!(repo.exists(&repo.namespace().root()).await.is_err());
    }

    #[tokio::test]
    async fn test_create_uri() {
        let (repo, backend) = repo(Namespace::Hierarchical);
        let path = repo.create_uri("bucket/path").await.unwrap();
        assert!(path.to_string().ends_with("/path/"));
        assert_eq!(path.scheme(), Namespace::Hierarchical.scheme());
        assert!(repo.exists(&path).await.unwrap());
        assert_eq!(backend.keys(), vec!["bucket/", "bucket/path/"]);

        assert!(matches!(
            repo.create_uri("").await,
            Err(RepoError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_create_directory_reports_failures_create_uri_hides() {
        let (mut repo, backend) = repo(Namespace::Hierarchical);
        let path = repo.normalize("made/here").unwrap();
        repo.create_directory(&path).await.unwrap();
        repo.create_directory(&path).await.unwrap();
        assert_eq!(backend.keys(), vec!["made/", "made/here/"]);

        repo.close();
        let path = repo.normalize("later").unwrap();
        assert!(repo.create_directory(&path).await.is_err());
        assert_eq!(repo.create_uri("later").await.unwrap(), path);
    }

    #[tokio::test]
    async fn test_too_small_upload_leaves_no_markers() {
        let (repo, backend) = repo(Namespace::Hierarchical);
        let local = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("_0.cfs"), [0u8; 16]).unwrap();
        let source_dir = FsIndexDirectory::new(local.path());
        let dest = repo.normalize("fresh/core").unwrap();

        let err = repo
            .copy_index_file_from(&source_dir, "_0.cfs", &dest, "_0.cfs")
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::CorruptSource { ref name, .. } if name == "_0.cfs"));
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_backup_and_restore_hierarchical() {
        let (repo, backend) = repo(Namespace::Hierarchical);
        let local = tempfile::tempdir().unwrap();
        let restored = tempfile::tempdir().unwrap();
        let file = seal(b"segment bytes");
        std::fs::write(local.path().join("_0.cfs"), &file).unwrap();

        let dest = repo.create_uri("backups/core1").await.unwrap();
        let source_dir = FsIndexDirectory::new(local.path());
        repo.copy_file_from(&source_dir, "_0.cfs", &dest).await.unwrap();
        assert_eq!(backend.get("backups/core1/_0.cfs").unwrap().as_ref(), file.as_slice());
        assert_eq!(repo.list_all(&dest).await.unwrap(), vec!["_0.cfs"]);

        let file_path = repo.resolve(&dest, &["_0.cfs"]).unwrap();
        assert_eq!(repo.get_path_type(&file_path).await.unwrap(), PathType::File);
        assert_eq!(repo.get_path_type(&dest).await.unwrap(), PathType::Directory);

        let dest_dir = FsIndexDirectory::new(restored.path());
        repo.copy_file_to(&dest, "_0.cfs", &dest_dir).await.unwrap();
        assert_eq!(std::fs::read(restored.path().join("_0.cfs")).unwrap(), file);
    }

    #[tokio::test]
    async fn test_restore_missing_file_leaves_no_local_file() {
        let (repo, _backend) = repo(Namespace::Hierarchical);
        let restored = tempfile::tempdir().unwrap();
        let dest_dir = FsIndexDirectory::new(restored.path());
        let source = repo.normalize("backups").unwrap();

        let err = repo.copy_file_to(&source, "missing", &dest_dir).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!restored.path().join("missing").exists());
    }

    #[tokio::test]
    async fn test_flat_restore_uses_fully_qualified_name() {
        let (repo, backend) = repo(Namespace::Flat);
        let file = seal(b"flat body");
        backend.insert("location/segments_2", file.clone());

        let restored = tempfile::tempdir().unwrap();
        let dest_dir = FsIndexDirectory::new(restored.path());
        let elsewhere = repo.normalize("elsewhere").unwrap();
        repo.copy_file_to(&elsewhere, "location/segments_2", &dest_dir)
            .await
            .unwrap();
        assert_eq!(std::fs::read(restored.path().join("segments_2")).unwrap(), file);
    }

    #[tokio::test]
    async fn test_flat_backup_writes_no_markers() {
        let (repo, backend) = repo(Namespace::Flat);
        let local = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("f"), seal(b"abc")).unwrap();

        let dest = repo.create_uri("location").await.unwrap();
        repo.copy_file_from(&FsIndexDirectory::new(local.path()), "f", &dest)
            .await
            .unwrap();
        assert_eq!(backend.keys(), vec!["location/f"]);
        assert_eq!(repo.get_path_type(&dest).await.unwrap(), PathType::Directory);
        assert_eq!(repo.list_all(&dest).await.unwrap(), vec!["f"]);
    }

    #[tokio::test]
    async fn test_delete_ignore_missing() {
        let (repo, backend) = repo(Namespace::Hierarchical);
        backend.insert("dir/a", "1");
        backend.insert("dir/b", "2");
        let dir = repo.normalize("dir").unwrap();

        let err = repo.delete(&dir, &["a", "zz"], false).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(backend.keys(), vec!["dir/b"]);

        repo.delete(&dir, &["b", "zz"], true).await.unwrap();
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_delete_directory_then_list_empty() {
        let (repo, backend) = repo(Namespace::Hierarchical);
        let dir = repo.create_uri("snap").await.unwrap();
        backend.insert("snap/f1", "1");
        backend.insert("snap/sub/f2", "2");

        repo.delete_directory(&dir).await.unwrap();
        assert!(repo.list_all(&dir).await.unwrap().is_empty());
        assert!(!repo.exists(&dir).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_input_and_create_output() {
        let (repo, _backend) = repo(Namespace::Hierarchical);
        let dir = repo.create_uri("io").await.unwrap();
        let file = repo.resolve(&dir, &["blob"]).unwrap();

        let mut sink = repo.create_output(&file).await.unwrap();
        sink.write(bytes::Bytes::from_static(b"payload")).await.unwrap();
        sink.finish().await.unwrap();

        let mut input = repo.open_input(&dir, "blob").await.unwrap();
        assert_eq!(input.length, 7);
        assert_eq!(input.key.as_str(), "io/blob");
        let mut data = Vec::new();
        input.reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"payload");

        assert!(matches!(
            repo.open_input(&dir, "").await,
            Err(RepoError::InvalidPath(_))
        ));
        assert!(matches!(
            repo.open_input(&repo.normalize("/").unwrap(), "io/").await,
            Err(RepoError::InvalidPath(_))
        ));
        assert!(matches!(
            repo.create_output(&dir).await,
            Err(RepoError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_copy_index_file_renames() {
        let (repo, backend) = repo(Namespace::Hierarchical);
        let local = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("src"), seal(b"renamed")).unwrap();
        let source_dir = FsIndexDirectory::new(local.path());
        let dest = repo.normalize("r").unwrap();

        repo.copy_index_file_from(&source_dir, "src", &dest, "dst")
            .await
            .unwrap();
        assert!(backend.get("r/dst").is_some());

        let err = repo
            .copy_index_file_from(&source_dir, "src", &dest, "")
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::InvalidPath(_)));

        repo.copy_index_file_to(&dest, "dst", &source_dir, "copy")
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(local.path().join("copy")).unwrap(),
            std::fs::read(local.path().join("src")).unwrap()
        );
    }
}
