//! Object-store access for the fetcher.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::errors::{LogtapError, Result};

/// A fetched object: the streaming body plus the metadata the decoder needs.
pub struct FetchedObject {
    pub body: Box<dyn AsyncRead + Send + Unpin>,
    pub content_encoding: Option<String>,
    pub content_length: Option<i64>,
}

/// Read access to the object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<FetchedObject>;
}

/// Production implementation over the S3 SDK.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        S3ObjectStore { client }
    }

    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        S3ObjectStore::new(aws_sdk_s3::Client::new(&config))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<FetchedObject> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                LogtapError::ObjectFetchError(format!("s3://{bucket}/{key}: {err}"))
            })?;

        Ok(FetchedObject {
            content_encoding: response.content_encoding().map(str::to_string),
            content_length: response.content_length(),
            body: Box::new(response.body.into_async_read()),
        })
    }
}
