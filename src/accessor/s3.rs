//! S3 accessor
//!
//! Wraps the AWS SDK client for one bucket/prefix pair. Works against AWS
//! and S3-compatible services (MinIO and friends take an endpoint
//! override with path-style addressing).

use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::types::{BucketVersioningStatus, ExpirationStatus};
use aws_sdk_s3::Client as AwsS3Client;
use futures::{stream, StreamExt};

use super::{dir_prefix, Accessor, AccessorError, AccessorKind, AccessorResult, FileMeta, ListIter};
use async_trait::async_trait;

/// Connection settings for one S3 vault.
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix all vault data lives under, without trailing slash.
    pub prefix: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// Accessor for one S3 bucket/prefix.
pub struct S3Accessor {
    client: AwsS3Client,
    bucket: String,
    prefix: String,
    uri: String,
}

impl S3Accessor {
    pub async fn new(config: S3Config) -> AccessorResult<Self> {
        if config.bucket.is_empty() {
            return Err(AccessorError::Backend {
                backend: "s3",
                message: "bucket must not be empty".to_string(),
            });
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        let region_provider = if let Some(region) = &config.region {
            RegionProviderChain::first_try(Region::new(region.clone()))
        } else {
            RegionProviderChain::default_provider()
        };
        loader = loader.region(region_provider);

        if let (Some(ak), Some(sk)) = (&config.access_key, &config.secret_key) {
            loader =
                loader.credentials_provider(Credentials::new(ak, sk, None, None, "parallax-vault"));
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            // Path-style addressing is what S3-compatible stores expect.
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = AwsS3Client::from_conf(builder.build());

        let prefix = config.prefix.trim_matches('/').to_string();
        let uri = if prefix.is_empty() {
            format!("s3://{}", config.bucket)
        } else {
            format!("s3://{}/{}", config.bucket, prefix)
        };

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix,
            uri,
        })
    }

    /// Full object key for a vault-root-relative path.
    fn object_key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

}

#[async_trait]
impl Accessor for S3Accessor {
    fn kind(&self) -> AccessorKind {
        AccessorKind::S3
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn list_directory(&self, prefix: &str) -> AccessorResult<ListIter> {
        let key_prefix = dir_prefix(&self.object_key(prefix));
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let vault_prefix = self.prefix.clone();

        // One page per unfold step, flattened into single objects.
        struct PageState {
            client: AwsS3Client,
            bucket: String,
            key_prefix: String,
            token: Option<String>,
            done: bool,
        }

        let state = PageState {
            client,
            bucket,
            key_prefix,
            token: None,
            done: false,
        };

        let pages = stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            let mut request = st
                .client
                .list_objects_v2()
                .bucket(&st.bucket)
                .prefix(&st.key_prefix);
            if let Some(token) = st.token.take() {
                request = request.continuation_token(token);
            }
            match request.send().await {
                Ok(response) => {
                    st.token = response.next_continuation_token().map(|s| s.to_string());
                    if !response.is_truncated().unwrap_or(false) || st.token.is_none() {
                        st.done = true;
                    }
                    let objects = response.contents.unwrap_or_default();
                    Some((Ok(objects), st))
                }
                Err(e) => {
                    st.done = true;
                    Some((
                        Err(AccessorError::Backend {
                            backend: "s3",
                            message: format!("list_objects_v2 failed: {e}"),
                        }),
                        st,
                    ))
                }
            }
        });

        let entries = pages.flat_map(move |page| match page {
            Ok(objects) => {
                let files: Vec<AccessorResult<FileMeta>> = objects
                    .into_iter()
                    .filter_map(|obj| {
                        let key = obj.key?;
                        let size = obj.size.unwrap_or(0).max(0) as u64;
                        Some(Ok(FileMeta {
                            path: relative_path_of(&vault_prefix, &key),
                            size,
                        }))
                    })
                    .collect();
                stream::iter(files)
            }
            Err(e) => stream::iter(vec![Err(e)]),
        });

        Ok(ListIter::new(Box::pin(entries)))
    }

    async fn exists(&self, path: &str) -> AccessorResult<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(path))
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(AccessorError::Backend {
                        backend: "s3",
                        message: format!("head_object failed: {service_err}"),
                    })
                }
            }
        }
    }

    async fn check_versioning(&self) -> AccessorResult<()> {
        let response = self
            .client
            .get_bucket_versioning()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| AccessorError::Backend {
                backend: "s3",
                message: format!("get_bucket_versioning failed: {e}"),
            })?;

        match response.status() {
            Some(status) if *status == BucketVersioningStatus::Enabled => Ok(()),
            other => Err(AccessorError::Backend {
                backend: "s3",
                message: format!("bucket versioning not enabled: {other:?}"),
            }),
        }
    }

    async fn bucket_lifecycle_days(&self) -> AccessorResult<i64> {
        let response = self
            .client
            .get_bucket_lifecycle_configuration()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| AccessorError::Backend {
                backend: "s3",
                message: format!("get_bucket_lifecycle_configuration failed: {e}"),
            })?;

        let mut days: Option<i64> = None;
        for rule in response.rules.unwrap_or_default() {
            if rule.status() != &ExpirationStatus::Enabled {
                continue;
            }
            if let Some(expiration) = rule.expiration() {
                if let Some(d) = expiration.days() {
                    if d > 0 {
                        days = Some(days.map_or(d as i64, |cur| cur.min(d as i64)));
                    }
                }
            }
        }

        days.ok_or_else(|| AccessorError::Backend {
            backend: "s3",
            message: "no enabled lifecycle expiration rule".to_string(),
        })
    }
}

fn relative_path_of(vault_prefix: &str, key: &str) -> String {
    if vault_prefix.is_empty() {
        key.to_string()
    } else {
        key.strip_prefix(&format!("{vault_prefix}/"))
            .unwrap_or(key)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_strips_vault_prefix() {
        assert_eq!(
            relative_path_of("tenant-a", "tenant-a/data/10/r_0.dat"),
            "data/10/r_0.dat"
        );
        assert_eq!(relative_path_of("", "data/10/r_0.dat"), "data/10/r_0.dat");
    }

    #[tokio::test]
    async fn rejects_empty_bucket() {
        let result = S3Accessor::new(S3Config::default()).await;
        assert!(result.is_err());
    }
}
