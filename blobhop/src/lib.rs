//! Move a single very large object from a source blob store to S3, within the memory and time
//! limits of a short-lived execution environment.
//!
//! A transfer runs in stages:
//!
//! 1. The object is split into byte ranges ([`plan_chunks`]).
//! 2. Ranges are downloaded concurrently into a local staging area, while an MD5 of the object is
//!    computed over the ranges in order ([`IntegrityHasher`]).
//! 3. The staged object is uploaded with a multipart upload, parts in parallel, and committed in
//!    part number order.  If a part can't be uploaded the upload is aborted.
//! 4. The destination object's size (and, where available, its multipart ETag) is verified.
//!
//! Every range download and part upload goes through the same [`RetryPolicy`], which retries
//! transient failures with exponential backoff.
//!
//! Start with [`TransferJobBuilder`].

mod config;
mod download;
mod error;
mod hash;
mod objstore;
mod plan;
mod progress;
mod reorder;
mod retry;
mod staging;
mod transfer;
pub mod trigger;
mod upload;
mod verify;

pub use config::Config;
pub use error::{error_chain, BlobhopError, BoxedError, ErrorKind, FailureClass, Result, StoreError};
pub use hash::{part_md5, IntegrityHasher, MultipartETag};
pub use objstore::{
    DestinationDescriptor, DestinationWriter, HttpRangeSource, ObjectStorageFactory,
    PartDescriptor, S3Destination, S3Source, SourceReader, UploadSession, S3_MIN_PART_SIZE,
    SOURCE_HASH_METADATA_KEY,
};
pub use plan::{plan_chunks, plan_parts, ChunkRange, MAX_MULTIPART_PARTS};
pub use progress::{percent_complete, NoProgress, Phase, ProgressSink};
pub use retry::{AttemptTimedOut, Attempted, RetryFailure, RetryPolicy};
pub use staging::{StagedObject, StagingBuffer};
pub use transfer::{DestinationState, TransferJob, TransferJobBuilder, TransferResult};
