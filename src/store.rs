use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;
use crate::error::StoreError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: Option<u64>,
}

/// The two capabilities the reporter needs from a storage backend. How the
/// backend authenticates is its own business.
pub trait ObjectStore: Send + Sync {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError>;
    fn fetch(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    fn describe(&self) -> String;
}

/// A bucket mirrored on disk: `<root>/<bucket>/<key>`.
pub struct LocalStore {
    base: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl AsRef<Path>, bucket: &str) -> Self {
        Self { base: root.as_ref().join(bucket) }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(key);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(StoreError::AccessDenied(format!("key escapes store root: {}", key)));
        }
        Ok(self.base.join(rel))
    }
}

impl ObjectStore for LocalStore {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        let dir_part = match prefix.rfind('/') { Some(i) => &prefix[..i], None => "" };
        let dir = if dir_part.is_empty() { self.base.clone() } else { self.resolve(dir_part)? };
        if !dir.is_dir() {
            log::debug!("No local partition at {}", dir.to_string_lossy());
            return Ok(vec![]);
        }
        let mut out = Vec::new();
        for de in WalkDir::new(&dir).follow_links(false).sort_by_file_name() {
            let de = de.map_err(|e| StoreError::Io(e.into()))?;
            if !de.file_type().is_file() { continue; }
            let rel = match de.path().strip_prefix(&self.base) { Ok(r) => r, Err(_) => continue };
            let key = rel.components().filter_map(|c| c.as_os_str().to_str()).collect::<Vec<_>>().join("/");
            if !key.starts_with(prefix) { continue; }
            let size = de.metadata().ok().map(|m| m.len());
            out.push(ObjectMeta { key, size });
        }
        Ok(out)
    }

    fn fetch(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(key)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(key.to_string()),
            std::io::ErrorKind::PermissionDenied => StoreError::AccessDenied(key.to_string()),
            _ => StoreError::Io(e),
        })
    }

    fn describe(&self) -> String { format!("local store at {}", self.base.to_string_lossy()) }
}

#[cfg(feature = "s3")]
pub use s3::S3Store;

#[cfg(feature = "s3")]
mod s3 {
    use std::time::Duration;
    use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
    use super::{ObjectMeta, ObjectStore};
    use crate::error::StoreError;

    /// S3 access through the SDK default credential chain for an optional named profile.
    pub struct S3Store {
        bucket: String,
        client: aws_sdk_s3::Client,
        rt: tokio::runtime::Runtime,
        attempt_timeout: Duration,
    }

    impl S3Store {
        pub fn connect(bucket: &str, profile: Option<&str>, attempt_timeout: Duration) -> Result<Self, StoreError> {
            let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
            let config = rt.block_on(async {
                let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
                if let Some(p) = profile { loader = loader.profile_name(p); }
                loader.load().await
            });
            let client = aws_sdk_s3::Client::new(&config);
            Ok(Self { bucket: bucket.to_string(), client, rt, attempt_timeout })
        }
    }

    fn sdk_error<E, R>(e: SdkError<E, R>) -> StoreError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug + Send + Sync + 'static,
    {
        let msg = DisplayErrorContext(&e).to_string();
        match e.code() {
            Some("NoSuchKey") | Some("NoSuchBucket") => StoreError::NotFound(msg),
            Some("AccessDenied") | Some("ExpiredToken") | Some("InvalidAccessKeyId") => StoreError::AccessDenied(msg),
            _ => StoreError::Transport(msg),
        }
    }

    impl ObjectStore for S3Store {
        fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
            self.rt.block_on(async {
                let mut out = Vec::new();
                let mut pages = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix).into_paginator().send();
                while let Some(page) = pages.next().await {
                    let page = page.map_err(sdk_error)?;
                    for obj in page.contents() {
                        if let Some(k) = obj.key() {
                            out.push(ObjectMeta { key: k.to_string(), size: obj.size().map(|s| s.max(0) as u64) });
                        }
                    }
                }
                Ok(out)
            })
        }

        fn fetch(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            let request = async {
                let resp = self.client.get_object().bucket(&self.bucket).key(key).send().await.map_err(sdk_error)?;
                let body = resp.body.collect().await.map_err(|e| StoreError::Transport(e.to_string()))?;
                Ok::<_, StoreError>(body.into_bytes().to_vec())
            };
            self.rt.block_on(async {
                match tokio::time::timeout(self.attempt_timeout, request).await {
                    Ok(r) => r,
                    Err(_) => Err(StoreError::Timeout(self.attempt_timeout)),
                }
            })
        }

        fn describe(&self) -> String { format!("s3://{}", self.bucket) }
    }
}
