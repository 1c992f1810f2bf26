use snafu::{prelude::*, IntoError};
use std::time::Duration;
use url::Url;

pub type Result<T, E = BlobhopError> = std::result::Result<T, E>;

/// Boxed form of whatever error a store client library reports
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// How a failed store operation should be treated by the retry policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum FailureClass {
    /// Expected to succeed if tried again (timeouts, throttling, 5xx responses)
    Transient,

    /// Will fail again no matter how many times it's retried (not found, access denied,
    /// malformed request)
    Permanent,
}

/// An error reported by one of the store collaborators ([`crate::SourceReader`] or
/// [`crate::DestinationWriter`]).
///
/// Every store error carries a [`FailureClass`] so that the retry policy can decide whether
/// another attempt is worthwhile without knowing anything about the underlying client library.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    #[snafu(display("Transient failure while trying to {operation}"))]
    Transient {
        operation: String,
        source: BoxedError,
    },

    #[snafu(display("Permanent failure while trying to {operation}"))]
    Permanent {
        operation: String,
        source: BoxedError,
    },

    #[snafu(display("Attempt to {operation} did not complete within {timeout:?}"))]
    TimedOut {
        operation: String,
        timeout: Duration,
    },
}

impl StoreError {
    /// Wrap a client library error that is expected to go away if the operation is retried
    pub fn transient(
        operation: impl Into<String>,
        error: impl Into<BoxedError>,
    ) -> Self {
        TransientSnafu {
            operation: operation.into(),
        }
        .into_error(error.into())
    }

    /// Wrap a client library error that retrying can't fix
    pub fn permanent(
        operation: impl Into<String>,
        error: impl Into<BoxedError>,
    ) -> Self {
        PermanentSnafu {
            operation: operation.into(),
        }
        .into_error(error.into())
    }

    /// Wrap an error in the class that was determined for it by the caller
    pub fn classified(
        class: FailureClass,
        operation: impl Into<String>,
        error: impl Into<BoxedError>,
    ) -> Self {
        match class {
            FailureClass::Transient => Self::transient(operation, error),
            FailureClass::Permanent => Self::permanent(operation, error),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::Transient { .. } | Self::TimedOut { .. } => FailureClass::Transient,
            Self::Permanent { .. } => FailureClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// Errors produced by the transfer pipeline.
///
/// The fieldless [`ErrorKind`] discriminant of this enum is what gets reported across the trigger
/// boundary; the full error (with its source chain) is for logs.
#[derive(Debug, Snafu, strum::EnumDiscriminants)]
#[snafu(visibility(pub))]
#[strum_discriminants(name(ErrorKind), derive(strum::Display, Hash))]
pub enum BlobhopError {
    #[snafu(display(
        "Cannot plan ranges for an object of {total_size} bytes using {chunk_size}-byte chunks; both must be greater than zero"
    ))]
    InvalidSize { total_size: u64, chunk_size: u64 },

    #[snafu(display(
        "Parts of {part_size} bytes are smaller than the destination's minimum part size of {min_part_size} bytes"
    ))]
    PartTooSmall { part_size: u64, min_part_size: u64 },

    #[snafu(display("Invalid configuration: {reason}"))]
    InvalidConfig { reason: String },

    #[snafu(display(
        "BUG: integrity hasher expected bytes at offset {expected} but was given offset {actual}"
    ))]
    OutOfOrder { expected: u64, actual: u64 },

    #[snafu(display(
        "BUG: integrity hasher finalized after consuming {consumed} of {expected} bytes"
    ))]
    Incomplete { consumed: u64, expected: u64 },

    #[snafu(display(
        "BUG: integrity hasher was given bytes up to offset {end}, past the end of the {expected}-byte object"
    ))]
    Overrun { end: u64, expected: u64 },

    #[snafu(display("BUG: integrity hasher was already finalized"))]
    AlreadyFinalized,

    #[snafu(display(
        "BUG: range {index} completed outside of the reorder window starting at {base} with capacity {capacity}"
    ))]
    ReorderOverflow {
        index: usize,
        base: usize,
        capacity: usize,
    },

    #[snafu(display("I/O error on the local staging area"))]
    Staging { source: std::io::Error },

    #[snafu(display("Error getting the size of source object '{object}'"))]
    SourceSize { object: String, source: StoreError },

    #[snafu(display(
        "Download of '{object}' failed on range(s) {failed_ranges:?} after {attempts} attempt(s)"
    ))]
    DownloadFailed {
        object: String,
        failed_ranges: Vec<usize>,
        attempts: usize,
        source: StoreError,
    },

    #[snafu(display("Error initiating multipart upload of '{key}'"))]
    InitiateUpload { key: String, source: StoreError },

    #[snafu(display(
        "Upload of '{key}' failed on part(s) {failed_parts:?} after {attempts} attempt(s){}",
        abort_outcome(*session_released)
    ))]
    UploadFailed {
        key: String,
        failed_parts: Vec<usize>,
        attempts: usize,
        session_released: bool,
        source: StoreError,
    },

    #[snafu(display(
        "All parts of '{key}' uploaded but completing the multipart upload failed{}",
        abort_outcome(*session_released)
    ))]
    Commit {
        key: String,
        session_released: bool,
        source: StoreError,
    },

    #[snafu(display("Error querying the destination object '{key}' for verification"))]
    Describe { key: String, source: StoreError },

    #[snafu(display("Destination object '{key}' failed verification: {mismatch}"))]
    Verification { key: String, mismatch: String },

    #[snafu(display("The URL '{url}' doesn't correspond to any supported store.  Supported URL schemes are: s3, http, https"))]
    UnsupportedStoreUrl { url: Url },

    #[snafu(display("The S3 URL '{url}' is missing the bucket name"))]
    MissingBucket { url: Url },

    #[snafu(display("The URL '{url}' doesn't name an object"))]
    MissingObjectKey { url: Url },

    #[snafu(display("Error building the HTTP client"))]
    HttpClient { source: reqwest::Error },

    #[snafu(display("Error in a blocking worker task"))]
    SpawnBlocking { source: tokio::task::JoinError },
}

impl BlobhopError {
    pub fn kind(&self) -> ErrorKind {
        self.into()
    }
}

fn abort_outcome(session_released: bool) -> &'static str {
    if session_released {
        "; the multipart upload was aborted"
    } else {
        "; aborting the multipart upload ALSO failed, so uploaded parts may still be held by the destination"
    }
}

/// Render an error and all of its sources on one line, outermost first
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();

    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }

    message
}
