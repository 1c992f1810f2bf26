//! The transfer pipeline driver: plan, download, upload, verify.
use crate::download::DownloadCoordinator;
use crate::objstore::{DestinationWriter, ObjectStorageFactory, SourceReader, SOURCE_HASH_METADATA_KEY};
use crate::plan::{self, ChunkRange};
use crate::progress::{NoProgress, ProgressSink};
use crate::retry::RetryPolicy;
use crate::staging::StagingBuffer;
use crate::upload::UploadCoordinator;
use crate::{BlobhopError, Config, ErrorKind, Result};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use url::Url;

/// What is left on the destination once a transfer has finished
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum DestinationState {
    /// No upload was ever started, so nothing exists on the destination
    NotCreated,

    /// An upload was started but aborted; no object and no parts remain
    Aborted,

    /// An upload was started and then failed, and aborting it failed too, so uploaded parts may
    /// still be held by the destination
    AbortFailed,

    /// The object was committed and verified
    Committed,

    /// The object was committed but failed verification, so its contents can't be trusted
    CommittedUntrusted,
}

/// The outcome of a transfer, successful or not
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferResult {
    pub success: bool,

    /// The number of bytes committed to the destination
    pub bytes_transferred: u64,

    /// Lowercase hex MD5 of the source object, if it was downloaded completely
    pub source_hash: Option<String>,

    /// The size the destination reported for the committed object, if it got that far
    pub destination_size: Option<u64>,

    pub error: Option<ErrorKind>,

    /// The error and all of its causes, rendered as one line
    pub error_message: Option<String>,

    pub destination_state: DestinationState,
}

impl TransferResult {
    /// Result of a transfer which failed before anything was started on the destination, such as
    /// when the job couldn't be built
    pub fn from_error(err: &BlobhopError) -> Self {
        let mut result = Self::not_started();
        result.fail(err);
        result
    }

    fn not_started() -> Self {
        Self {
            success: false,
            bytes_transferred: 0,
            source_hash: None,
            destination_size: None,
            error: None,
            error_message: None,
            destination_state: DestinationState::NotCreated,
        }
    }

    fn fail(&mut self, err: &BlobhopError) {
        self.success = false;
        self.error = Some(err.kind());
        self.error_message = Some(crate::error::error_chain(err));

        match err {
            BlobhopError::UploadFailed {
                session_released, ..
            }
            | BlobhopError::Commit {
                session_released, ..
            } => {
                self.destination_state = if *session_released {
                    DestinationState::Aborted
                } else {
                    DestinationState::AbortFailed
                };
            }
            BlobhopError::Verification { .. } => {
                self.destination_state = DestinationState::CommittedUntrusted;
            }
            _ => {}
        }
    }
}

/// Builder for a [`TransferJob`].
///
/// The source object and the destination key must be set before calling [`Self::build`].  If no
/// destination key is set, the source object name is used.
#[derive(Debug)]
pub struct TransferJobBuilder {
    config: Config,
    source: Arc<dyn SourceReader>,
    destination: Arc<dyn DestinationWriter>,
    object: Option<String>,
    key: Option<String>,
}

impl TransferJobBuilder {
    pub fn new(
        config: Config,
        source: impl SourceReader,
        destination: impl DestinationWriter,
    ) -> Self {
        Self::with_stores(config, Arc::new(source), Arc::new(destination))
    }

    /// Create a builder using already-constructed store implementations
    pub fn with_stores(
        config: Config,
        source: Arc<dyn SourceReader>,
        destination: Arc<dyn DestinationWriter>,
    ) -> Self {
        Self {
            config,
            source,
            destination,
            object: None,
            key: None,
        }
    }

    /// Create a builder from a source object URL and a destination object URL.
    ///
    /// See [`ObjectStorageFactory`] for the supported URL schemes.  The object name and
    /// destination key are taken from the URLs.
    pub async fn from_urls(config: Config, source_url: &Url, destination_url: &Url) -> Result<Self> {
        let factory = ObjectStorageFactory::new(config.clone());

        let (source, object) = factory.source_from_url(source_url).await?;
        let (destination, key) = factory.destination_from_url(destination_url).await?;

        Ok(Self::with_stores(config, source.into(), destination.into())
            .object(object)
            .destination_key(key))
    }

    /// The name of the object to read from the source
    pub fn object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    /// The key to write the object to on the destination
    pub fn destination_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Validate the configuration, query the size of the source object, and plan the transfer
    #[instrument(skip(self), fields(object = ?self.object))]
    pub async fn build(self) -> Result<TransferJob> {
        self.config.validate()?;

        let object = match self.object {
            Some(object) if !object.is_empty() => object,
            _ => {
                return crate::error::InvalidConfigSnafu {
                    reason: "no source object was specified",
                }
                .fail()
            }
        };
        let key = self.key.unwrap_or_else(|| object.clone());

        let total_size = self
            .source
            .object_size(&object)
            .await
            .context(crate::error::SourceSizeSnafu {
                object: object.clone(),
            })?;

        let ranges = plan::plan_chunks(total_size, self.config.chunk_size_bytes())?;
        let parts = plan::plan_parts(total_size, self.config.part_size_bytes())?;

        // The last part may be any size, so a single part upload is always acceptable
        let min_part_size = self.destination.min_part_size();
        if let [first, _, ..] = parts.as_slice() {
            ensure!(
                first.len() >= min_part_size,
                crate::error::PartTooSmallSnafu {
                    part_size: first.len(),
                    min_part_size,
                }
            );
        }

        info!(
            total_size,
            ranges = ranges.len(),
            parts = parts.len(),
            %key,
            "Planned transfer"
        );

        Ok(TransferJob {
            config: self.config,
            source: self.source,
            destination: self.destination,
            object,
            key,
            total_size,
            ranges,
            parts,
        })
    }
}

/// A planned transfer of one object, ready to run
#[derive(Debug)]
pub struct TransferJob {
    config: Config,
    source: Arc<dyn SourceReader>,
    destination: Arc<dyn DestinationWriter>,
    object: String,
    key: String,
    total_size: u64,
    ranges: Vec<ChunkRange>,
    parts: Vec<ChunkRange>,
}

impl TransferJob {
    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn destination_key(&self) -> &str {
        &self.key
    }

    /// The total number of bytes in the object
    pub fn total_bytes(&self) -> u64 {
        self.total_size
    }

    /// The byte ranges the object will be downloaded in
    pub fn ranges(&self) -> &[ChunkRange] {
        &self.ranges
    }

    /// The byte ranges of the upload parts.  Part `n` is `parts()[n - 1]`.
    pub fn parts(&self) -> &[ChunkRange] {
        &self.parts
    }

    /// Alternative to [`Self::run`] for callers that do not care about progress information.
    pub async fn run_without_progress(self) -> TransferResult {
        self.run(NoProgress).await
    }

    /// Run the job to completion.
    ///
    /// This never fails outright; failures are described in the returned [`TransferResult`],
    /// including what was left behind on the destination.
    #[instrument(skip_all, fields(object = %self.object, key = %self.key))]
    pub async fn run<Progress>(self, progress: Progress) -> TransferResult
    where
        Progress: ProgressSink + 'static,
    {
        let mut result = TransferResult::not_started();

        match self.execute(&progress, &mut result).await {
            Ok(()) => {
                result.success = true;

                info!(
                    bytes_transferred = result.bytes_transferred,
                    source_hash = ?result.source_hash,
                    "Transfer complete"
                );
            }
            Err(e) => {
                result.fail(&e);

                error!(
                    err = %result.error_message.as_deref().unwrap_or_default(),
                    destination_state = %result.destination_state,
                    "Transfer failed"
                );
            }
        }

        result
    }

    /// Run every stage in turn, recording progress in `result` as each stage completes
    async fn execute(&self, progress: &dyn ProgressSink, result: &mut TransferResult) -> Result<()> {
        let retry = RetryPolicy::from_config(&self.config);

        let staging = StagingBuffer::new(&self.config, self.total_size).await?;

        let downloaded = DownloadCoordinator {
            source: self.source.as_ref(),
            object: &self.object,
            retry: &retry,
            concurrency: self.config.download_concurrency,
            reorder_window: self.config.effective_reorder_window(),
        }
        .run(&self.ranges, staging, progress)
        .await?;

        result.source_hash = Some(downloaded.source_hash.clone());

        let metadata = HashMap::from([(
            SOURCE_HASH_METADATA_KEY.to_string(),
            downloaded.source_hash.clone(),
        )]);

        let committed = UploadCoordinator {
            destination: self.destination.as_ref(),
            key: &self.key,
            retry: &retry,
            concurrency: self.config.upload_concurrency,
        }
        .run(&downloaded.staged, &self.parts, metadata, progress)
        .await?;

        result.destination_state = DestinationState::Committed;
        result.bytes_transferred = self.total_size;

        // The staged copy isn't needed any more; release it (and its temp file) before the
        // verification round trip
        drop(downloaded.staged);

        let destination_size = crate::verify::verify_destination(
            self.destination.as_ref(),
            &self.key,
            self.total_size,
            &committed,
            !self.config.skip_checksum_verification,
        )
        .await?;

        result.destination_size = Some(destination_size);

        if self.config.delete_source {
            self.delete_source(&retry).await;
        }

        Ok(())
    }

    /// Delete the source object.  Failure is logged but doesn't fail the transfer, since the
    /// object is already safely on the destination.
    async fn delete_source(&self, retry: &RetryPolicy) {
        let source = self.source.as_ref();
        let object = self.object.as_str();

        match retry
            .run_store("delete source object", |_| source.delete_object(object))
            .await
        {
            Ok(_) => info!(object, "Deleted source object"),
            Err(failure) => warn!(
                object,
                attempts = failure.attempts,
                err = %crate::error::error_chain(&failure.error),
                "Failed to delete source object; it must be deleted manually"
            ),
        }
    }
}
