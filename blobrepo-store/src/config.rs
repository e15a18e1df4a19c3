use std::collections::BTreeMap;
use std::path::Path;

use blobrepo_common::{RepoError, Result};

use crate::backend::s3::S3Config;

/// Raw configuration as handed over by the host: dotted keys to values.
pub type Properties = BTreeMap<String, String>;

pub const BUCKET_NAME: &str = "bucket.name";
pub const REGION: &str = "region";
pub const ENDPOINT: &str = "endpoint";
pub const PROXY_HOST: &str = "proxy.host";
pub const PROXY_PORT: &str = "proxy.port";
pub const ACCESS_KEY: &str = "access.key";
pub const SECRET_KEY: &str = "secret.key";
pub const MOCK: &str = "mock";
pub const NAMESPACE: &str = "namespace";

const DEFAULT_REGION: &str = "us-east-1";

/// Environment variable that overrides `key`: `bucket.name` -> `BUCKET_NAME`.
pub fn to_env_var(key: &str) -> String {
    key.to_ascii_uppercase().replace('.', "_")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    pub fn url(&self) -> String {
        if self.host.contains("://") {
            format!("{}:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub bucket_name: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub access_key: String,
    pub secret_key: String,
    pub mock: bool,
}

impl RepositoryConfig {
    /// Resolve against the process environment.
    pub fn from_properties(props: &Properties) -> Result<Self> {
        Self::resolve_with(props, |name| std::env::var(name).ok())
    }

    /// Resolve with an explicit environment lookup. An environment value,
    /// when present, wins over the property.
    pub fn resolve_with<F>(props: &Properties, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| -> Option<String> {
            env(&to_env_var(key))
                .or_else(|| props.get(key).cloned())
                .filter(|v| !v.is_empty())
        };

        let mock = get(MOCK).is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let proxy = match get(PROXY_HOST) {
            Some(host) => {
                let port = get(PROXY_PORT)
                    .ok_or_else(|| RepoError::Config(format!("{PROXY_PORT} is required with {PROXY_HOST}")))?;
                let port = port
                    .parse::<u16>()
                    .map_err(|e| RepoError::Config(format!("invalid {PROXY_PORT} '{port}': {e}")))?;
                Some(ProxyConfig { host, port })
            }
            None => None,
        };

        let access_key = get(ACCESS_KEY)
            .or_else(|| env("AWS_ACCESS_KEY_ID"))
            .unwrap_or_default();
        let secret_key = get(SECRET_KEY)
            .or_else(|| env("AWS_SECRET_ACCESS_KEY"))
            .unwrap_or_default();
        let bucket_name = get(BUCKET_NAME).unwrap_or_default();

        let config = RepositoryConfig {
            bucket_name,
            region: get(REGION).unwrap_or_else(|| DEFAULT_REGION.to_string()),
            endpoint: get(ENDPOINT),
            proxy,
            access_key,
            secret_key,
            mock,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mock {
            return Ok(());
        }
        if self.bucket_name.is_empty() {
            return Err(RepoError::Config(format!("{BUCKET_NAME} must not be empty")));
        }
        if self.access_key.is_empty() || self.secret_key.is_empty() {
            return Err(RepoError::Config(format!(
                "S3 credentials not found for bucket '{}'",
                self.bucket_name
            )));
        }
        Ok(())
    }

    pub fn to_s3_config(&self) -> S3Config {
        S3Config {
            bucket: self.bucket_name.clone(),
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            access_key_id: self.access_key.clone(),
            secret_access_key: self.secret_key.clone(),
            proxy: self.proxy.as_ref().map(ProxyConfig::url),
        }
    }
}

/// Load a property map from a TOML file. Nested tables flatten to dotted
/// keys, so `[proxy] host = "x"` becomes `proxy.host`.
pub fn load_properties(path: &Path) -> Result<Properties> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| RepoError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    parse_properties(&content)
        .map_err(|e| RepoError::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

pub fn parse_properties(content: &str) -> std::result::Result<Properties, toml::de::Error> {
    let table: toml::Table = toml::from_str(content)?;
    let mut props = Properties::new();
    flatten("", &table, &mut props);
    Ok(props)
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut Properties) {
    for (key, value) in table {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(inner) => flatten(&name, inner, out),
            toml::Value::String(s) => {
                out.insert(name, s.clone());
            }
            other => {
                out.insert(name, other.to_string());
            }
        }
    }
}
