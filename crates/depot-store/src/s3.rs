//! S3-backed object store.
//!
//! Unlike a write-behind blob cache, every put is acknowledged by S3 before
//! returning: receive-pack only moves a ref after all objects it points to
//! are durable.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use futures::future::try_join_all;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::store::ObjectStore;
use crate::{Error, Result};

/// S3 configuration
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// Optional prefix for all keys (e.g., "depot/")
    pub prefix: Option<String>,
    /// AWS region (defaults to AWS_REGION env var)
    pub region: Option<String>,
    /// Custom endpoint URL (for S3-compatible services like MinIO, R2, etc.)
    pub endpoint: Option<String>,
}

/// Object store over one S3 bucket.
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3ObjectStore {
    pub async fn new(config: S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(ref region) = config.region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
        }
        let aws_config = loader.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(ref endpoint) = config.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true); // Required for most S3-compatible services
        }
        let client = S3Client::from_conf(s3_config_builder.build());

        let prefix = config.prefix.unwrap_or_default();
        info!("S3 object store on bucket {} (prefix {:?})", config.bucket, prefix);

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix,
        })
    }

    fn s3_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let s3_key = self.s3_key(key);
        debug!("S3 get {}", s3_key);

        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .send()
            .await
        {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| Error::Backend(format!("S3 body for {}: {}", s3_key, e)))?;
                Ok(Some(data.into_bytes()))
            }
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(Error::Backend(format!("S3 get {}: {}", s3_key, service_err)))
                }
            }
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let s3_key = self.s3_key(key);
        debug!("S3 put {} ({} bytes)", s3_key, data.len());

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Error::Backend(format!("S3 put {}: {}", s3_key, e.into_service_error())))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let s3_key = self.s3_key(key);
        debug!("S3 delete {}", s3_key);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .send()
            .await
            .map_err(|e| {
                Error::Backend(format!("S3 delete {}: {}", s3_key, e.into_service_error()))
            })?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let s3_prefix = self.s3_key(prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&s3_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    Error::Backend(format!("S3 list {}: {}", s3_prefix, e.into_service_error()))
                })?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    if let Some(stripped) = key.strip_prefix(&self.prefix) {
                        keys.push(stripped.to_string());
                    }
                }
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        debug!("S3 list {} -> {} keys", s3_prefix, keys.len());
        Ok(keys)
    }

    async fn head(&self, key: &str) -> Result<Option<u64>> {
        let s3_key = self.s3_key(key);

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(Error::Backend(format!("S3 head {}: {}", s3_key, service_err)))
                }
            }
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Bytes>> {
        // S3 has no multi-get; issue the GETs concurrently instead.
        let fetched = try_join_all(keys.iter().map(|key| async move {
            self.get(key).await.map(|data| (key.clone(), data))
        }))
        .await?;

        Ok(fetched
            .into_iter()
            .filter_map(|(key, data)| data.map(|d| (key, d)))
            .collect())
    }
}
