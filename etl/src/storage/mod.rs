use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use common::config::S3Settings;
use common::{Error, Result};
use dashmap::DashMap;
use datafusion::execution::context::SessionContext;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// A resolved storage location: the store that owns it and the key prefix inside that store.
#[derive(Clone)]
pub struct Location {
    pub url: Url,
    pub store: Arc<dyn ObjectStore>,
    pub prefix: Path,
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Location")
            .field("url", &self.url.as_str())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl Location {
    pub fn is_local(&self) -> bool {
        self.url.scheme() == "file"
    }
}

#[derive(Clone)]
pub struct StorageManager {
    s3: Option<S3Settings>,
    client_cache: Arc<DashMap<String, Arc<S3Client>>>,
    object_store_cache: Arc<DashMap<String, Arc<dyn ObjectStore>>>,
}

impl StorageManager {
    pub fn new(s3: Option<S3Settings>) -> Self {
        Self {
            s3,
            client_cache: Arc::new(DashMap::new()),
            object_store_cache: Arc::new(DashMap::new()),
        }
    }

    /// Turns a configured location into a directory URL. Plain paths are
    /// made absolute and treated as local directories.
    pub fn parse_location(location: &str) -> Result<Url> {
        let location = location.trim();
        if location.contains("://") {
            let mut url = Url::parse(location)?;
            if !url.path().ends_with('/') {
                let path = format!("{}/", url.path());
                url.set_path(&path);
            }
            return Ok(url);
        }

        let absolute = std::path::absolute(location)?;
        Url::from_directory_path(&absolute).map_err(|_| {
            Error::InvalidUri(format!(
                "Cannot express '{}' as a file URL",
                absolute.display()
            ))
        })
    }

    pub fn resolve(&self, location: &str) -> Result<Location> {
        let url = Self::parse_location(location)?;
        let store = self.get_object_store(&url)?;
        let prefix = Path::from_url_path(url.path())?;
        Ok(Location { url, store, prefix })
    }

    pub fn get_object_store(&self, url: &Url) -> Result<Arc<dyn ObjectStore>> {
        let cache_key = match url.scheme() {
            "file" => "file".to_string(),
            "s3" => format!("s3://{}", bucket_of(url)?),
            other => {
                return Err(Error::InvalidUri(format!(
                    "Unsupported storage scheme '{}' in {}",
                    other, url
                )));
            }
        };

        if let Some(store) = self.object_store_cache.get(&cache_key) {
            return Ok(store.clone());
        }

        let store: Arc<dyn ObjectStore> = match url.scheme() {
            "file" => Arc::new(LocalFileSystem::new()),
            _ => {
                let s3 = self.s3_settings()?;
                let bucket = bucket_of(url)?;
                Arc::new(
                    AmazonS3Builder::new()
                        .with_bucket_name(bucket)
                        .with_region(&s3.region)
                        .with_access_key_id(&s3.access_key)
                        .with_secret_access_key(&s3.secret_key)
                        .with_endpoint(&s3.endpoint)
                        .with_allow_http(s3.allow_http)
                        .build()?,
                )
            }
        };

        debug!(store = %cache_key, "Created object store");
        self.object_store_cache.insert(cache_key, store.clone());
        Ok(store)
    }

    /// Makes the store behind `url` visible to the query engine. Local files
    /// are always available, so only remote schemes are registered.
    pub fn register_object_store(&self, ctx: &SessionContext, url: &Url) -> Result<()> {
        if url.scheme() == "file" {
            return Ok(());
        }
        let store = self.get_object_store(url)?;
        let root = Url::parse(&format!("{}://{}", url.scheme(), bucket_of(url)?))?;
        ctx.runtime_env().register_object_store(&root, store);
        Ok(())
    }

    /// Checks that the destination can be written before any work starts.
    pub async fn verify_destination(&self, location: &Location) -> Result<()> {
        if location.is_local() {
            let path = location.url.to_file_path().map_err(|_| {
                Error::InvalidUri(format!("Not a local path: {}", location.url))
            })?;
            tokio::fs::create_dir_all(&path).await?;
            return Ok(());
        }

        let bucket = bucket_of(&location.url)?;
        let client = self.get_client(bucket)?;

        match client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "Cannot access bucket '{}': {}",
                bucket, e
            ))),
        }
    }

    /// Removes directories left empty under a local location after files were moved or deleted.
    pub async fn prune_empty_dirs(&self, location: &Location) -> Result<()> {
        if !location.is_local() {
            return Ok(());
        }
        let root = location.url.to_file_path().map_err(|_| {
            Error::InvalidUri(format!("Not a local path: {}", location.url))
        })?;

        tokio::task::spawn_blocking(move || remove_empty_dirs(&root, true))
            .await
            .map_err(|e| Error::Storage(format!("Directory cleanup task failed: {}", e)))??;
        Ok(())
    }

    fn s3_settings(&self) -> Result<&S3Settings> {
        self.s3.as_ref().ok_or_else(|| {
            Error::Storage("s3:// location used but no [storage.s3] section is configured".into())
        })
    }

    fn get_client(&self, bucket: &str) -> Result<Arc<S3Client>> {
        if let Some(client) = self.client_cache.get(bucket) {
            return Ok(client.clone());
        }

        let s3 = self.s3_settings()?;
        let credentials = Credentials::new(&s3.access_key, &s3.secret_key, None, None, "static");

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&s3.endpoint)
            .region(Region::new(s3.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        let client = Arc::new(S3Client::from_conf(s3_config));
        self.client_cache.insert(bucket.to_string(), client.clone());
        Ok(client)
    }
}

fn bucket_of(url: &Url) -> Result<&str> {
    url.host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| Error::InvalidUri(format!("Missing bucket in {}", url)))
}

/// Returns true when `dir` ended up empty and was removed.
fn remove_empty_dirs(dir: &std::path::Path, keep_root: bool) -> Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }

    let mut empty = true;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if !remove_empty_dirs(&path, false)? {
                empty = false;
            }
        } else {
            empty = false;
        }
    }

    if empty && !keep_root {
        std::fs::remove_dir(dir)?;
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location_plain_path() {
        let url = StorageManager::parse_location("/tmp/trips_out").unwrap();
        assert_eq!(url.scheme(), "file");
        assert_eq!(url.path(), "/tmp/trips_out/");
    }

    #[test]
    fn test_parse_location_s3() {
        let url = StorageManager::parse_location("s3://curated/trips").unwrap();
        assert_eq!(url.scheme(), "s3");
        assert_eq!(bucket_of(&url).unwrap(), "curated");
        assert_eq!(url.path(), "/trips/");
    }

    #[test]
    fn test_s3_requires_settings() {
        let storage = StorageManager::new(None);
        let err = storage.resolve("s3://curated/trips").unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn test_unsupported_scheme() {
        let storage = StorageManager::new(None);
        let err = storage.resolve("ftp://example.com/trips").unwrap_err();
        assert!(matches!(err, Error::InvalidUri(_)));
    }

    #[test]
    fn test_local_store_is_cached() {
        let storage = StorageManager::new(None);
        let a = storage.resolve("/tmp/a").unwrap();
        let b = storage.resolve("/tmp/b").unwrap();
        assert!(Arc::ptr_eq(&a.store, &b.store));
        assert_eq!(a.prefix.as_ref(), "tmp/a");
    }

    #[tokio::test]
    async fn test_verify_local_destination_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("out");
        let storage = StorageManager::new(None);
        let location = storage.resolve(target.to_str().unwrap()).unwrap();

        storage.verify_destination(&location).await.unwrap();
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn test_verify_unwritable_destination_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        std::fs::write(&file, b"x").unwrap();

        let storage = StorageManager::new(None);
        let location = storage.resolve(file.join("out").to_str().unwrap()).unwrap();
        let err = storage.verify_destination(&location).await.unwrap_err();
        assert!(err.is_io());
    }

    #[tokio::test]
    async fn test_prune_empty_dirs_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        std::fs::create_dir_all(dir.path().join("d")).unwrap();
        std::fs::write(dir.path().join("d/file.parquet"), b"x").unwrap();

        let storage = StorageManager::new(None);
        let location = storage.resolve(dir.path().to_str().unwrap()).unwrap();
        storage.prune_empty_dirs(&location).await.unwrap();

        assert!(dir.path().is_dir());
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().join("d/file.parquet").exists());
    }
}
