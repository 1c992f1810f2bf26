//! The object stores that objects are transferred between.
//!
//! The transfer pipeline never talks to a store client library directly.  Everything it needs
//! from the source is expressed by [`SourceReader`], and everything it needs from the destination
//! by [`DestinationWriter`], so that other stores (or in-memory fakes in tests) can be plugged in.
use crate::{Config, Result, StoreError};
use bytes::Bytes;
use std::{collections::HashMap, ops::Range};
use url::Url;

mod http;
mod s3;

pub use self::http::HttpRangeSource;
pub use s3::{S3Destination, S3Source, S3_MIN_PART_SIZE};

/// Metadata key under which the source object's content hash is stored on the destination object
pub const SOURCE_HASH_METADATA_KEY: &str = "source-md5";

/// Read access to the store the object is being transferred out of.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait SourceReader: std::fmt::Debug + Sync + Send + 'static {
    /// Query the size in bytes of the object
    async fn object_size(&self, object: &str) -> Result<u64, StoreError>;

    /// Read one range of an object.
    ///
    /// This performs the read as a single network call, so the range should be no larger than a
    /// few tens of MB.  Large objects are read by issuing many of these calls concurrently.
    async fn fetch_range(&self, object: &str, range: Range<u64>) -> Result<Bytes, StoreError>;

    /// Delete the object from the source store
    async fn delete_object(&self, object: &str) -> Result<(), StoreError>;
}

/// Identifies a multipart upload session in progress on the destination
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UploadSession {
    /// The key of the object being uploaded
    pub key: String,

    /// Opaque session identifier issued by the destination when the upload was initiated
    pub upload_id: String,
}

/// One contiguous part of a multipart upload.
///
/// Part numbers start at 1.  The `e_tag` is only known once the part has been uploaded
/// successfully, and every part must have one before the upload can be committed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartDescriptor {
    pub part_number: usize,
    pub start: u64,
    pub end: u64,
    pub e_tag: Option<String>,
}

impl PartDescriptor {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// What the destination reports about an object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DestinationDescriptor {
    pub key: String,

    /// Size of the object in bytes, if the destination reported it
    pub size: Option<u64>,

    /// Tag the destination computed over the stored contents.  For a multipart upload this is
    /// derived from the MD5 of every part (see [`crate::MultipartETag`]).
    pub e_tag: Option<String>,
}

/// Write access to the store the object is being transferred into, using a multipart upload
/// protocol.
#[async_trait::async_trait]
pub trait DestinationWriter: std::fmt::Debug + Sync + Send + 'static {
    /// Start a new multipart upload of `key`.  The object will carry `metadata` once committed.
    async fn initiate_upload(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<UploadSession, StoreError>;

    /// Upload one part, returning the tag the destination assigned to it
    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: usize,
        data: Bytes,
    ) -> Result<String, StoreError>;

    /// Complete the upload.  `parts` is ordered by ascending part number and every part has a tag.
    async fn commit(
        &self,
        session: &UploadSession,
        parts: &[PartDescriptor],
    ) -> Result<DestinationDescriptor, StoreError>;

    /// Abandon the upload, releasing whatever the destination holds for the uploaded parts
    async fn abort(&self, session: &UploadSession) -> Result<(), StoreError>;

    /// The smallest size the destination accepts for every part but the last.  `0` means there is
    /// no minimum.
    fn min_part_size(&self) -> u64 {
        0
    }

    /// Query the size and ETag of a committed object
    async fn describe(&self, key: &str) -> Result<DestinationDescriptor, StoreError>;
}

/// Constructs source and destination implementations from URLs.
#[derive(Debug, Clone)]
pub struct ObjectStorageFactory {
    config: Config,
}

impl ObjectStorageFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Given the URL of a source object, construct the reader which handles that kind of store
    /// and return it along with the object name to pass to it.
    ///
    /// `s3://bucket/key` URLs are read with the S3 APIs.  `http://` and `https://` URLs are read
    /// with plain HTTP range requests, which works for Azure Blob Storage URLs (including a SAS
    /// token in the query string) and any other server that honors `Range`.
    #[allow(clippy::wrong_self_convention)] // For a factory object I think it's obvious what this means
    pub async fn source_from_url(&self, url: &Url) -> Result<(Box<dyn SourceReader>, String)> {
        match url.scheme() {
            "s3" => {
                let (bucket, key) = parse_s3_url(url)?;

                Ok((Box::new(S3Source::new(&self.config, bucket).await), key))
            }
            "http" | "https" => {
                let (source, object) = HttpRangeSource::from_object_url(url)?;

                Ok((Box::new(source), object))
            }
            _ => crate::error::UnsupportedStoreUrlSnafu { url: url.clone() }.fail(),
        }
    }

    /// Given the URL of the destination object, construct the writer for it and return it along
    /// with the key to upload to.  Only `s3://bucket/key` URLs are supported.
    #[allow(clippy::wrong_self_convention)]
    pub async fn destination_from_url(
        &self,
        url: &Url,
    ) -> Result<(Box<dyn DestinationWriter>, String)> {
        if url.scheme() == "s3" {
            let (bucket, key) = parse_s3_url(url)?;

            Ok((Box::new(S3Destination::new(&self.config, bucket).await), key))
        } else {
            crate::error::UnsupportedStoreUrlSnafu { url: url.clone() }.fail()
        }
    }
}

/// Split an S3 URL of the form `s3://bucket/path/to/object` into bucket and object key.
///
/// In URL terms, the `bucket` part is considered the host name.  The leading `/` of the path
/// isn't part of the S3 object key.
fn parse_s3_url(url: &Url) -> Result<(String, String)> {
    let bucket = url
        .host_str()
        .filter(|bucket| !bucket.is_empty())
        .ok_or_else(|| crate::error::MissingBucketSnafu { url: url.clone() }.build())?;

    let key = url.path().strip_prefix('/').unwrap_or(url.path());

    if key.is_empty() || key.ends_with('/') {
        return crate::error::MissingObjectKeySnafu { url: url.clone() }.fail();
    }

    Ok((bucket.to_string(), key.to_string()))
}
