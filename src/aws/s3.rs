//! S3-backed object store capabilities
//!
//! Wraps a pre-built `aws_sdk_s3::Client` behind the object-store traits the
//! chunked writer, reader and deleter consume. Listing uses ListObjectsV2,
//! whose keys come back in lexical ascending order; the part key scheme
//! relies on that.

use crate::error::{DumpError, Result};
use crate::store::{
    DeleteFailure, ListPage, ObjectBody, ObjectDeleter, ObjectGetLister, ObjectPut, ObjectPuter,
};
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;

/// Object store capabilities over an S3 client.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectPuter for S3Store {
    async fn put_object(&self, bucket: &str, key: &str, put: ObjectPut) -> Result<()> {
        let metadata = if put.metadata.is_empty() {
            None
        } else {
            Some(put.metadata)
        };
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(put.body))
            .content_type(put.content_type)
            .set_content_encoding(put.content_encoding)
            .set_metadata(metadata)
            .send()
            .await
            .map_err(|err| storage_error("put", key, &err))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectGetLister for S3Store {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if matches!(err.as_service_error(), Some(GetObjectError::NoSuchKey(_))) {
                    DumpError::NotFound(format!("{bucket}/{key}"))
                } else {
                    storage_error("get", key, &err)
                }
            })?;

        let metadata = response.metadata().cloned().unwrap_or_default();
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|err| DumpError::Storage(format!("failed to read body of {key:?}: {err}")))?
            .into_bytes();
        Ok(ObjectBody { bytes, metadata })
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<String>,
    ) -> Result<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(token)
            .send()
            .await
            .map_err(|err| storage_error("list", prefix, &err))?;

        let keys = response
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_string))
            .collect();
        let next_token = response.next_continuation_token().map(str::to_string);
        Ok(ListPage { keys, next_token })
    }
}

#[async_trait]
impl ObjectDeleter for S3Store {
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<Vec<DeleteFailure>> {
        let identifiers = keys
            .iter()
            .map(|key| {
                ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .map_err(|err| DumpError::InvalidConfig(err.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let delete = Delete::builder()
            .quiet(true)
            .set_objects(Some(identifiers))
            .build()
            .map_err(|err| DumpError::InvalidConfig(err.to_string()))?;

        let response = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|err| storage_error("delete", bucket, &err))?;

        Ok(response
            .errors()
            .iter()
            .map(|error| DeleteFailure {
                key: error.key().unwrap_or_default().to_string(),
                message: error.message().unwrap_or_default().to_string(),
            })
            .collect())
    }
}

fn storage_error<E, R>(op: &str, target: &str, err: &SdkError<E, R>) -> DumpError
where
    SdkError<E, R>: std::error::Error,
{
    DumpError::Storage(format!("{op} {target:?}: {}", DisplayErrorContext(err)))
}
