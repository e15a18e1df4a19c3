pub mod memory;
pub mod s3;

use blobrepo_common::backend::ObjectStoreClient;
use blobrepo_common::Result;
use tracing::info;

use self::memory::MemoryBackend;
use self::s3::S3Backend;
use crate::config::RepositoryConfig;

/// Construct the object store client selected by `config`.
pub fn from_config(config: &RepositoryConfig) -> Result<Box<dyn ObjectStoreClient>> {
    if config.mock {
        info!("Using in-memory object store");
        return Ok(Box::new(MemoryBackend::new()));
    }

    info!(
        bucket = %config.bucket_name,
        region = %config.region,
        endpoint = config.endpoint.as_deref().unwrap_or("aws"),
        proxy = config.proxy.is_some(),
        "Using S3 object store"
    );
    Ok(Box::new(S3Backend::new(config.to_s3_config())?))
}
