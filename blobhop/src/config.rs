use crate::Result;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// The configuration settings that control how a transfer is planned and executed.
///
/// None of these settings persist between invocations; every transfer gets its own copy.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.  If this is set, the AWS region
    /// is ignored.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The size of each byte range that is downloaded from the source as a separate request.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MiB".
    #[cfg_attr(feature = "clap", clap(long, default_value = "10MiB", global = true))]
    pub chunk_size: byte_unit::Byte,

    /// The size of each part uploaded to the destination with the multipart upload APIs.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MiB".
    ///
    /// Note that the maximum number of parts in an upload is 10,000, so for very large objects
    /// this part size will be overridden if it's smaller than 1/10,000th of the size of the
    /// object.  S3 also requires every part but the last to be at least 5MiB, so smaller part
    /// sizes are rejected unless the object fits in a single part.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10MiB", global = true))]
    pub part_size: byte_unit::Byte,

    /// The maximum number of concurrent range requests made to the source.
    #[cfg_attr(feature = "clap", clap(long, default_value = "15", global = true))]
    pub download_concurrency: usize,

    /// The maximum number of concurrent part uploads made to the destination.
    #[cfg_attr(feature = "clap", clap(long, default_value = "15", global = true))]
    pub upload_concurrency: usize,

    /// How many times a failed range download or part upload is retried, if the failure is
    /// transient.
    ///
    /// Each operation is attempted at most `max_retries + 1` times.
    #[cfg_attr(feature = "clap", clap(long, default_value = "5", global = true))]
    pub max_retries: usize,

    /// The delay before the first retry, in milliseconds.  Each subsequent retry doubles the
    /// delay, plus some random jitter.
    #[cfg_attr(feature = "clap", clap(long, default_value = "200", global = true))]
    pub backoff_base_ms: u64,

    /// The maximum delay between two retries, in milliseconds.
    #[cfg_attr(feature = "clap", clap(long, default_value = "20000", global = true))]
    pub backoff_cap_ms: u64,

    /// The time limit for a single range download or part upload attempt, in seconds.
    ///
    /// An attempt that runs longer is abandoned and counts as a transient failure.
    #[cfg_attr(feature = "clap", clap(long, default_value = "300", global = true))]
    pub attempt_timeout_secs: u64,

    /// How many downloaded ranges may be held in memory waiting for an earlier range to finish so
    /// that the content hash can be computed in order.
    ///
    /// No range more than this many places ahead of the next range to be hashed will be
    /// requested.  Values smaller than `download_concurrency` are raised to it.
    #[cfg_attr(feature = "clap", clap(long, default_value = "30", global = true))]
    pub reorder_window: usize,

    /// Directory in which the object is staged between download and upload.
    ///
    /// Defaults to the system temporary directory.  The staging file is deleted when the transfer
    /// finishes, successfully or not.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "DIR"))]
    pub staging_dir: Option<PathBuf>,

    /// Stage the object in memory instead of in a temporary file.
    ///
    /// Only sensible for objects that comfortably fit in RAM.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub stage_in_memory: bool,

    /// Skip comparing the destination object's ETag with the one expected from the uploaded parts.
    ///
    /// Needed for destinations that don't derive ETags from part MD5s, such as S3 buckets with
    /// SSE-KMS encryption.  The destination object's size is always verified.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub skip_checksum_verification: bool,

    /// Delete the source object once the destination object is verified.
    #[cfg_attr(feature = "clap", clap(long, global = true))]
    pub delete_source: bool,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes; there's no
        // better way unless we unconditionally take a clap dependency in the lib crate
        Self {
            s3_endpoint: None,
            chunk_size: byte_unit::Byte::from_bytes(10 * 1024 * 1024),
            part_size: byte_unit::Byte::from_bytes(10 * 1024 * 1024),
            download_concurrency: 15,
            upload_concurrency: 15,
            max_retries: 5,
            backoff_base_ms: 200,
            backoff_cap_ms: 20_000,
            attempt_timeout_secs: 300,
            reorder_window: 30,
            staging_dir: None,
            stage_in_memory: false,
            skip_checksum_verification: false,
            delete_source: false,
        }
    }
}

impl Config {
    /// Reject settings that can't possibly produce a working transfer.
    ///
    /// Chunk and part sizes aren't checked here; planning reports a zero size as
    /// [`crate::BlobhopError::InvalidSize`].
    pub fn validate(&self) -> Result<()> {
        let reason = if self.download_concurrency == 0 {
            "download concurrency must be at least 1"
        } else if self.upload_concurrency == 0 {
            "upload concurrency must be at least 1"
        } else if self.attempt_timeout_secs == 0 {
            "attempt timeout must be greater than zero"
        } else if self.backoff_cap_ms < self.backoff_base_ms {
            "backoff cap must not be smaller than the backoff base"
        } else {
            return Ok(());
        };

        crate::error::InvalidConfigSnafu { reason }.fail()
    }

    pub(crate) fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size.get_bytes() as u64
    }

    pub(crate) fn part_size_bytes(&self) -> u64 {
        self.part_size.get_bytes() as u64
    }

    pub(crate) fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub(crate) fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub(crate) fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// The effective reorder window, which can never be smaller than the download concurrency or
    /// the download pool would be starved
    pub(crate) fn effective_reorder_window(&self) -> usize {
        self.reorder_window.max(self.download_concurrency)
    }
}
