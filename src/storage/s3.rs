//! S3-compatible object storage
//!
//! `S3Config` is always available so configuration can carry it; the client
//! itself requires the `s3` feature. Create-if-absent writes use conditional
//! puts (`If-None-Match: *`).

use serde::{Deserialize, Serialize};

/// S3/MinIO configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Config {
    /// Custom endpoint URL (MinIO, R2); `None` uses AWS
    pub endpoint: Option<String>,
    /// Region
    pub region: String,
    /// Access key id; `None` falls back to the AWS default provider chain
    pub access_key_id: Option<String>,
    /// Secret access key
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    /// Force path-style URLs (required for MinIO)
    pub force_path_style: bool,
    /// Bucket holding experiments
    pub bucket: String,
}

impl S3Config {
    /// Configuration for a bucket using the default AWS credential chain
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            bucket: bucket.into(),
        }
    }

    /// Configuration for a MinIO deployment
    pub fn minio(endpoint: &str, bucket: &str, access_key: &str, secret_key: &str) -> Self {
        Self {
            endpoint: Some(endpoint.to_string()),
            access_key_id: Some(access_key.to_string()),
            secret_access_key: Some(secret_key.to_string()),
            force_path_style: true,
            ..Self::new(bucket)
        }
    }

    /// Load from environment variables; requires `S3_BUCKET`
    pub fn from_env() -> Option<Self> {
        Some(Self {
            endpoint: std::env::var("S3_ENDPOINT").ok(),
            region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
            force_path_style: std::env::var("S3_FORCE_PATH_STYLE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            bucket: std::env::var("S3_BUCKET").ok()?,
        })
    }
}

#[cfg(feature = "s3")]
pub use client::S3ObjectStore;

#[cfg(feature = "s3")]
mod client {
    use super::S3Config;
    use crate::error::{FanoutError, Result};
    use crate::storage::object::ObjectStore;
    use async_trait::async_trait;
    use aws_sdk_s3::primitives::ByteStream;
    use bytes::Bytes;
    use tracing::{debug, info};

    /// Object store backed by an S3 bucket
    pub struct S3ObjectStore {
        client: aws_sdk_s3::Client,
        bucket: String,
    }

    impl S3ObjectStore {
        /// Create a client from configuration
        pub async fn connect(config: &S3Config) -> Result<Self> {
            use aws_config::BehaviorVersion;
            use aws_sdk_s3::config::{Credentials, Region};

            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load()
                .await;
            let mut builder =
                aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.force_path_style);
            if let Some(endpoint) = &config.endpoint {
                builder = builder.endpoint_url(endpoint);
            }
            if let (Some(key), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
                builder = builder.credentials_provider(Credentials::new(
                    key,
                    secret,
                    None,
                    None,
                    "bem-fanout",
                ));
            }

            info!(bucket = %config.bucket, endpoint = ?config.endpoint, "S3 object store configured");
            Ok(Self {
                client: aws_sdk_s3::Client::from_conf(builder.build()),
                bucket: config.bucket.clone(),
            })
        }
    }

    #[async_trait]
    impl ObjectStore for S3ObjectStore {
        async fn write_object(&self, path: &str, bytes: Bytes) -> Result<()> {
            let len = bytes.len();
            let outcome = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(path)
                .if_none_match("*")
                .body(ByteStream::from(bytes))
                .send()
                .await;

            match outcome {
                Ok(_) => {
                    debug!(path, bytes = len, "Object uploaded");
                    Ok(())
                }
                Err(e) => {
                    let status = e.raw_response().map(|r| r.status().as_u16());
                    // 412 on an existing key, 409 on a concurrent conditional write
                    if matches!(status, Some(412) | Some(409)) {
                        Err(FanoutError::VersionCollision {
                            path: path.to_string(),
                        })
                    } else {
                        Err(FanoutError::storage(format!("put {}: {}", path, e)))
                    }
                }
            }
        }

        async fn read_object(&self, path: &str) -> Result<Bytes> {
            let response = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(path)
                .send()
                .await
                .map_err(|e| {
                    if e.as_service_error().map(|s| s.is_no_such_key()).unwrap_or(false) {
                        FanoutError::not_found(format!("object '{}'", path))
                    } else {
                        FanoutError::storage(format!("get {}: {}", path, e))
                    }
                })?;

            let data = response
                .body
                .collect()
                .await
                .map_err(|e| FanoutError::storage(format!("read {}: {}", path, e)))?;
            Ok(data.into_bytes())
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            let mut keys = Vec::new();
            let mut token: Option<String> = None;

            loop {
                let response = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(prefix)
                    .set_continuation_token(token.take())
                    .send()
                    .await
                    .map_err(|e| FanoutError::storage(format!("list {}: {}", prefix, e)))?;

                keys.extend(
                    response
                        .contents()
                        .iter()
                        .filter_map(|obj| obj.key().map(str::to_string)),
                );

                match response.next_continuation_token() {
                    Some(next) if response.is_truncated().unwrap_or(false) => {
                        token = Some(next.to_string());
                    }
                    _ => break,
                }
            }

            keys.sort();
            Ok(keys)
        }

        fn name(&self) -> &str {
            "s3"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minio_config() {
        let config = S3Config::minio("http://localhost:9000", "experiments", "minio", "secret");
        assert!(config.force_path_style);
        assert_eq!(config.bucket, "experiments");
        assert_eq!(config.region, "us-east-1");

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret_access_key"));
    }
}
