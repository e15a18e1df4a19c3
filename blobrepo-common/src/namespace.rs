//! Path resolution for the two object-store namespace variants.
//!
//! `Hierarchical` stores (plain S3) keep zero-byte directory markers and
//! list by path prefix. `Flat` stores (Swarm) keep every object in one
//! logical bucket; directories exist only as key prefixes.

use std::fmt;
use std::str::FromStr;

use crate::error::{RepoError, Result};
use crate::path::{LogicalPath, ObjectKey, Scheme, DELIMITER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Hierarchical,
    Flat,
}

impl Namespace {
    pub fn scheme(&self) -> Scheme {
        match self {
            Namespace::Hierarchical => Scheme::S3,
            Namespace::Flat => Scheme::Swarm,
        }
    }

    pub fn root(&self) -> LogicalPath {
        LogicalPath::root(self.scheme())
    }

    /// Turn a host-supplied location into a directory path.
    ///
    /// Locations already carrying this namespace's scheme keep their
    /// authority; anything else is rooted under the scheme with no
    /// authority. The result always ends with `/`.
    pub fn normalize(&self, location: &str) -> Result<LogicalPath> {
        if location.is_empty() {
            return Err(RepoError::InvalidPath(
                "cannot create URI with an empty location".into(),
            ));
        }

        let own_scheme = Scheme::split_prefix(location).is_some_and(|(s, _)| s == self.scheme());
        if own_scheme {
            let mut raw = location.to_string();
            if !raw.ends_with(DELIMITER) {
                raw.push(DELIMITER);
            }
            return LogicalPath::parse(&raw);
        }

        let mut path = String::with_capacity(location.len() + 2);
        if !location.starts_with(DELIMITER) {
            path.push(DELIMITER);
        }
        path.push_str(location);
        if !path.ends_with(DELIMITER) {
            path.push(DELIMITER);
        }
        Ok(LogicalPath::new(self.scheme(), None, path))
    }

    /// Join `components` onto `base`, collapsing repeated separators and
    /// `.` segments. `..` is kept literally.
    pub fn resolve<S: AsRef<str>>(&self, base: &LogicalPath, components: &[S]) -> Result<LogicalPath> {
        self.resolve_inner(base, components, false)
    }

    /// Like [`Namespace::resolve`], but the result is a directory path.
    pub fn resolve_directory<S: AsRef<str>>(
        &self,
        base: &LogicalPath,
        components: &[S],
    ) -> Result<LogicalPath> {
        self.resolve_inner(base, components, true)
    }

    fn resolve_inner<S: AsRef<str>>(
        &self,
        base: &LogicalPath,
        components: &[S],
        directory: bool,
    ) -> Result<LogicalPath> {
        if base.scheme() != self.scheme() {
            return Err(RepoError::SchemeMismatch {
                expected: self.scheme(),
                found: base.to_string(),
            });
        }

        let mut parts: Vec<String> = components.iter().map(|c| c.as_ref().to_string()).collect();

        // A single fully-qualified flat key is taken relative to the root,
        // not to `base`.
        let from_root = *self == Namespace::Flat
            && parts.len() == 1
            && parts[0].contains(DELIMITER);

        if directory {
            match parts.last_mut() {
                Some(last) if !last.ends_with(DELIMITER) => last.push(DELIMITER),
                Some(_) => {}
                None => return Ok(base.as_directory()),
            }
        }

        if from_root {
            let path = collapse_segments(&format!("{}{}", DELIMITER, parts[0]));
            return Ok(LogicalPath::new(self.scheme(), None, path));
        }

        let joined = format!("{}{}{}", base.path(), DELIMITER, parts.join("/"));
        Ok(LogicalPath::new(
            self.scheme(),
            base.host().map(str::to_string),
            collapse_segments(&joined),
        ))
    }

    /// Map a logical path onto its object key.
    ///
    /// With an authority the key is `host + path`, otherwise the path
    /// without its leading separator.
    pub fn to_object_key(&self, path: &LogicalPath) -> ObjectKey {
        match path.host() {
            Some(host) => ObjectKey::new(format!("{}{}", host, path.path())),
            None => ObjectKey::new(path.path().strip_prefix(DELIMITER).unwrap_or(path.path())),
        }
    }

    /// Key under which this namespace stores or looks up a directory.
    pub fn directory_key(&self, path: &LogicalPath) -> ObjectKey {
        let key = self.to_object_key(path);
        match self {
            Namespace::Hierarchical => key.as_directory(),
            Namespace::Flat => key.trim_directory(),
        }
    }

    /// Key of a file; fails if the path is empty or has directory form.
    pub fn file_key(&self, path: &LogicalPath) -> Result<ObjectKey> {
        self.to_object_key(path).as_file()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme().as_str())
    }
}

impl FromStr for Namespace {
    type Err = RepoError;

    /// Accepts the scheme names (`s3`, `swarm`) or the variant names
    /// (`hierarchical`, `flat`).
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "s3" | "hierarchical" => Ok(Namespace::Hierarchical),
            "swarm" | "flat" => Ok(Namespace::Flat),
            other => Err(RepoError::Config(format!("unknown namespace '{other}'"))),
        }
    }
}

fn collapse_segments(path: &str) -> String {
    let trailing = path.ends_with(DELIMITER) || path.ends_with("/.");
    let segments: Vec<&str> = path
        .split(DELIMITER)
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();

    let mut out = String::with_capacity(path.len());
    out.push(DELIMITER);
    out.push_str(&segments.join("/"));
    if trailing && !segments.is_empty() {
        out.push(DELIMITER);
    }
    out
}
