use super::{DestinationDescriptor, DestinationWriter, PartDescriptor, SourceReader, UploadSession};
use crate::{Config, FailureClass, StoreError};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_types::region::Region;
use bytes::Bytes;
use std::{collections::HashMap, ops::Range, sync::Arc};
use tracing::{debug, instrument};

/// S3 rejects completing a multipart upload if any part but the last is smaller than this
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Error codes S3 reports for conditions that go away on their own
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "InternalError",
    "ServiceUnavailable",
];

/// Decide whether an error from the AWS SDK is worth retrying
fn classify<E>(err: &SdkError<E>) -> FailureClass
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            FailureClass::Transient
        }
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            let transient_code = err
                .code()
                .map(|code| TRANSIENT_ERROR_CODES.contains(&code))
                .unwrap_or(false);

            if transient_code || status == 429 || status >= 500 {
                FailureClass::Transient
            } else {
                FailureClass::Permanent
            }
        }
        // Construction failures mean the request itself is invalid
        _ => FailureClass::Permanent,
    }
}

fn store_error<E>(operation: &str, err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    StoreError::classified(classify(&err), operation, err)
}

/// Client for one bucket, shared by the source and destination implementations
#[derive(Clone)]
struct S3Bucket {
    inner: Arc<S3BucketInner>,
}

struct S3BucketInner {
    name: String,
    client: aws_sdk_s3::Client,
}

impl S3Bucket {
    async fn new(config: &Config, name: String) -> Self {
        Self {
            inner: Arc::new(S3BucketInner {
                client: make_s3_client(config).await,
                name,
            }),
        }
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn client(&self) -> &aws_sdk_s3::Client {
        &self.inner.client
    }

    async fn head(&self, key: &str, operation: &str) -> Result<DestinationDescriptor, StoreError> {
        let metadata = self
            .client()
            .head_object()
            .bucket(self.name())
            .key(key)
            .send()
            .await
            .map_err(|e| store_error(operation, e))?;

        Ok(DestinationDescriptor {
            key: key.to_string(),
            size: metadata
                .content_length()
                .and_then(|len| u64::try_from(len).ok()),
            e_tag: metadata.e_tag().map(|e_tag| e_tag.to_string()),
        })
    }
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("name", &self.inner.name)
            .field("client", &"<...>")
            .finish()
    }
}

/// [`SourceReader`] for objects in an S3 (or S3-compatible) bucket
#[derive(Clone, Debug)]
pub struct S3Source {
    bucket: S3Bucket,
}

impl S3Source {
    pub async fn new(config: &Config, bucket: impl Into<String>) -> Self {
        Self {
            bucket: S3Bucket::new(config, bucket.into()).await,
        }
    }
}

#[async_trait::async_trait]
impl SourceReader for S3Source {
    #[instrument(skip(self), fields(bucket = %self.bucket.name()))]
    async fn object_size(&self, object: &str) -> Result<u64, StoreError> {
        let operation = "get source object size";
        let descriptor = self.bucket.head(object, operation).await?;

        descriptor.size.ok_or_else(|| {
            StoreError::permanent(operation, format!("S3 reported no size for '{object}'"))
        })
    }

    async fn fetch_range(&self, object: &str, range: Range<u64>) -> Result<Bytes, StoreError> {
        let operation = "fetch source range";

        // S3 ranges are inclusive, so subtract one from the end of the half-open range
        let response = self
            .bucket
            .client()
            .get_object()
            .bucket(self.bucket.name())
            .key(object)
            .range(format!("bytes={}-{}", range.start, range.end - 1))
            .send()
            .await
            .map_err(|e| store_error(operation, e))?;

        // The body is streamed; a failure partway through is a network problem
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::transient(operation, e))?
            .into_bytes();

        debug!(object, ?range, len = bytes.len(), "Fetched range");

        Ok(bytes)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket.name()))]
    async fn delete_object(&self, object: &str) -> Result<(), StoreError> {
        self.bucket
            .client()
            .delete_object()
            .bucket(self.bucket.name())
            .key(object)
            .send()
            .await
            .map_err(|e| store_error("delete source object", e))?;

        Ok(())
    }
}

/// [`DestinationWriter`] which uploads into an S3 (or S3-compatible) bucket with the S3 multipart
/// upload APIs
#[derive(Clone, Debug)]
pub struct S3Destination {
    bucket: S3Bucket,
}

impl S3Destination {
    pub async fn new(config: &Config, bucket: impl Into<String>) -> Self {
        Self {
            bucket: S3Bucket::new(config, bucket.into()).await,
        }
    }
}

#[async_trait::async_trait]
impl DestinationWriter for S3Destination {
    #[instrument(skip(self, metadata), fields(bucket = %self.bucket.name()))]
    async fn initiate_upload(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<UploadSession, StoreError> {
        let operation = "create multipart upload";

        let response = self
            .bucket
            .client()
            .create_multipart_upload()
            .bucket(self.bucket.name())
            .key(key)
            .set_metadata(Some(metadata.clone()))
            .send()
            .await
            .map_err(|e| store_error(operation, e))?;

        let upload_id = response
            .upload_id()
            .ok_or_else(|| StoreError::permanent(operation, "S3 returned no upload ID"))?
            .to_string();

        debug!(%upload_id, "Started multipart upload");

        Ok(UploadSession {
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: usize,
        data: Bytes,
    ) -> Result<String, StoreError> {
        let operation = "upload part";

        let response = self
            .bucket
            .client()
            .upload_part()
            .bucket(self.bucket.name())
            .key(&session.key)
            .upload_id(&session.upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| store_error(operation, e))?;

        let e_tag = response
            .e_tag()
            .ok_or_else(|| StoreError::permanent(operation, "S3 returned no ETag for the part"))?
            .to_string();

        Ok(e_tag)
    }

    #[instrument(skip(self, parts), fields(bucket = %self.bucket.name(), parts = parts.len()))]
    async fn commit(
        &self,
        session: &UploadSession,
        parts: &[PartDescriptor],
    ) -> Result<DestinationDescriptor, StoreError> {
        let completed_parts = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .set_e_tag(part.e_tag.clone())
                    .build()
            })
            .collect::<Vec<_>>();

        let response = self
            .bucket
            .client()
            .complete_multipart_upload()
            .bucket(self.bucket.name())
            .key(&session.key)
            .upload_id(&session.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| store_error("complete multipart upload", e))?;

        Ok(DestinationDescriptor {
            key: session.key.clone(),
            size: None,
            e_tag: response.e_tag().map(|e_tag| e_tag.to_string()),
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket.name()))]
    async fn abort(&self, session: &UploadSession) -> Result<(), StoreError> {
        self.bucket
            .client()
            .abort_multipart_upload()
            .bucket(self.bucket.name())
            .key(&session.key)
            .upload_id(&session.upload_id)
            .send()
            .await
            .map_err(|e| store_error("abort multipart upload", e))?;

        Ok(())
    }

    fn min_part_size(&self) -> u64 {
        S3_MIN_PART_SIZE
    }

    #[instrument(skip(self), fields(bucket = %self.bucket.name()))]
    async fn describe(&self, key: &str) -> Result<DestinationDescriptor, StoreError> {
        self.bucket.head(key, "describe destination object").await
    }
}

/// Create a new AWS SDK S3 client, using the region and credentials deduced from the environment
async fn make_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let region_provider = RegionProviderChain::default_provider().or_else(Region::new("us-east-1"));
    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(region_provider)
        .load()
        .await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // S3-compatible services are generally not set up for virtual-host-style bucket names
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.as_str())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}
