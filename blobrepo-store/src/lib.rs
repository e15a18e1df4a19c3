//! Backup repository over S3-compatible object stores.
//!
//! [`repository::BackupRepository`] is the entry point. It maps logical
//! paths onto object keys, emulates directories, and streams index files
//! between a local [`index_dir::IndexDirectory`] and the store.

pub mod backend;
pub mod config;
pub mod directory;
pub mod index_dir;
pub mod repository;
pub mod transfer;

pub use repository::BackupRepository;
