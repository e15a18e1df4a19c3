//! Shared types for the blobrepo backup repository: logical paths and
//! object keys, the two namespace variants, the object store capability
//! traits, the checksum footer codec and the error taxonomy.

pub mod backend;
pub mod error;
pub mod footer;
pub mod namespace;
pub mod path;

pub use error::{RepoError, Result};
pub use namespace::Namespace;
pub use path::{LogicalPath, ObjectKey, PathType, Scheme};
