//! Hierarchical paths as seen by the host, and the flat object keys they
//! map to.
//!
//! A `LogicalPath` renders as a URI: `s3://host/a/b/` when a host
//! (authority) is present, `s3:///a/b/` otherwise. Directory paths end
//! with `/`, file paths never do.

use std::fmt;
use std::str::FromStr;

use crate::error::{RepoError, Result};

/// Separator between path components and inside object keys.
pub const DELIMITER: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    S3,
    Swarm,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::S3 => "s3",
            Scheme::Swarm => "swarm",
        }
    }

    /// Split a recognised `scheme:` prefix (case-insensitive) off `raw`.
    pub fn split_prefix(raw: &str) -> Option<(Scheme, &str)> {
        [Scheme::S3, Scheme::Swarm].into_iter().find_map(|scheme| {
            let name = scheme.as_str();
            let head = raw.get(..name.len())?;
            let rest = raw[name.len()..].strip_prefix(':')?;
            head.eq_ignore_ascii_case(name).then_some((scheme, rest))
        })
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(Scheme::S3),
            "swarm" => Ok(Scheme::Swarm),
            other => Err(RepoError::InvalidPath(format!("unknown scheme '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalPath {
    scheme: Scheme,
    host: Option<String>,
    path: String,
}

impl LogicalPath {
    /// Build a path; `path` gets a leading `/` if it lacks one and an empty
    /// host is treated as no host.
    pub fn new(scheme: Scheme, host: Option<String>, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with(DELIMITER) {
            path.insert(0, DELIMITER);
        }
        Self {
            scheme,
            host: host.filter(|h| !h.is_empty()),
            path,
        }
    }

    pub fn root(scheme: Scheme) -> Self {
        Self::new(scheme, None, "/")
    }

    /// Parse the URI form produced by `Display`. Also accepts `s3:/a/b`
    /// (no authority) and `s3:a/b`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme, rest) = Scheme::split_prefix(raw)
            .ok_or_else(|| RepoError::InvalidPath(format!("missing scheme in '{raw}'")))?;

        match rest.strip_prefix("//") {
            Some(authority_and_path) => {
                let (host, path) = match authority_and_path.find(DELIMITER) {
                    Some(idx) => authority_and_path.split_at(idx),
                    None => (authority_and_path, "/"),
                };
                Ok(Self::new(scheme, Some(host.to_string()), path))
            }
            None => Ok(Self::new(scheme, None, rest)),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the path carries directory intent (trailing `/`).
    pub fn is_directory(&self) -> bool {
        self.path.ends_with(DELIMITER)
    }

    pub fn is_root(&self) -> bool {
        self.host.is_none() && self.path == "/"
    }

    /// Same path with a trailing `/`.
    pub fn as_directory(&self) -> Self {
        if self.is_directory() {
            return self.clone();
        }
        Self {
            scheme: self.scheme,
            host: self.host.clone(),
            path: format!("{}{}", self.path, DELIMITER),
        }
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme,
            self.host.as_deref().unwrap_or(""),
            self.path
        )
    }
}

impl FromStr for LogicalPath {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A key in the flat object-store namespace. The empty key is the root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty() || self.0 == "/"
    }

    pub fn is_directory_form(&self) -> bool {
        self.0.ends_with(DELIMITER)
    }

    /// Key with exactly one trailing `/`; the root stays empty.
    pub fn as_directory(&self) -> Self {
        if self.is_root() {
            return Self::root();
        }
        if self.is_directory_form() {
            self.clone()
        } else {
            Self(format!("{}{}", self.0, DELIMITER))
        }
    }

    /// Key with any trailing `/` removed.
    pub fn trim_directory(&self) -> Self {
        Self(self.0.trim_end_matches(DELIMITER).to_string())
    }

    /// Validate the key as a file key: non-empty, no trailing `/`.
    pub fn as_file(&self) -> Result<Self> {
        if self.is_root() {
            return Err(RepoError::InvalidPath("path cannot be empty".into()));
        }
        if self.is_directory_form() {
            return Err(RepoError::InvalidPath(format!(
                "path for file can't end with '/': {}",
                self.0
            )));
        }
        Ok(self.clone())
    }

    /// Directory key of the enclosing directory, `None` for top-level keys
    /// and the root.
    pub fn parent(&self) -> Option<Self> {
        let trimmed = self.0.trim_end_matches(DELIMITER);
        let idx = trimmed.rfind(DELIMITER)?;
        Some(Self(trimmed[..=idx].to_string()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Classification of a path for the host's restore logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    File,
    Directory,
}
