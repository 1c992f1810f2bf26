//! Multipart upload of the staged object to the destination.
use crate::hash::{part_md5, MultipartETag};
use crate::objstore::{DestinationDescriptor, DestinationWriter, PartDescriptor, UploadSession};
use crate::plan::ChunkRange;
use crate::progress::{Phase, ProgressReporter, ProgressSink};
use crate::retry::RetryPolicy;
use crate::staging::StagedObject;
use crate::{Result, StoreError};
use futures::{StreamExt, TryStreamExt};
use snafu::IntoError;
use std::collections::HashMap;
use tracing::{debug, error, info, instrument, Instrument};

/// Runs a bounded pool of part uploads, then commits them in part-number order, or aborts the
/// upload session if any part can't be uploaded.
pub(crate) struct UploadCoordinator<'a> {
    pub destination: &'a dyn DestinationWriter,
    pub key: &'a str,
    pub retry: &'a RetryPolicy,
    pub concurrency: usize,
}

/// A committed multipart upload
pub(crate) struct CommittedUpload {
    /// What the destination reported when the upload was completed
    pub descriptor: DestinationDescriptor,

    /// The ETag the destination should report, computed from the bytes that were sent
    pub expected_e_tag: MultipartETag,
}

/// A part which has been uploaded
struct UploadedPart {
    descriptor: PartDescriptor,
    attempts: usize,
    md5: Vec<u8>,
}

/// A part upload that ran out of attempts or failed permanently
struct PartFailure {
    part_number: usize,
    attempts: usize,
    error: StoreError,
}

impl<'a> UploadCoordinator<'a> {
    /// Upload `staged` as the parts planned in `parts`, with `metadata` attached to the object.
    ///
    /// Part numbers are the plan's range indices plus one.  Every part gets its own retries; the
    /// first part to fail for good stops all other uploads, and the session is aborted exactly
    /// once.  The session is also aborted if the commit fails, since the parts it holds are of
    /// no further use.
    #[instrument(skip_all, fields(key = self.key, parts = parts.len()))]
    pub async fn run(
        &self,
        staged: &StagedObject,
        parts: &[ChunkRange],
        metadata: HashMap<String, String>,
        progress: &dyn ProgressSink,
    ) -> Result<CommittedUpload> {
        let destination = self.destination;
        let key = self.key;

        let session = self
            .retry
            .run_store("create multipart upload", |_| {
                destination.initiate_upload(key, &metadata)
            })
            .await
            .map_err(|failure| {
                crate::error::InitiateUploadSnafu { key }.into_error(failure.error)
            })?
            .value;

        info!(upload_id = %session.upload_id, total_size = staged.len(), "Starting multipart upload");

        let (completed, expected_e_tag) = match self
            .upload_parts(&session, staged, parts, progress)
            .await
        {
            Ok(uploaded) => uploaded,
            Err(PartFailure {
                part_number,
                attempts,
                error,
            }) => {
                error!(part_number, attempts, err = ?error, "Part upload failed; aborting the multipart upload");

                let session_released = self.abort(&session).await;

                return Err(crate::error::UploadFailedSnafu {
                    key,
                    failed_parts: vec![part_number],
                    attempts,
                    session_released,
                }
                .into_error(error));
            }
        };

        debug!(parts = completed.len(), "All parts uploaded; completing multipart upload");

        match destination.commit(&session, &completed).await {
            Ok(descriptor) => {
                info!(e_tag = ?descriptor.e_tag, "Multipart upload complete");

                Ok(CommittedUpload {
                    descriptor,
                    expected_e_tag,
                })
            }
            Err(e) => {
                // Commit is never retried; there's no way to know if a failed commit did in fact
                // take effect
                error!(err = ?e, "Completing the multipart upload failed; aborting it");

                let session_released = self.abort(&session).await;

                Err(crate::error::CommitSnafu {
                    key,
                    session_released,
                }
                .into_error(e))
            }
        }
    }

    /// Upload every part, returning their descriptors sorted by part number along with the ETag
    /// the completed object should have
    async fn upload_parts(
        &self,
        session: &UploadSession,
        staged: &StagedObject,
        parts: &[ChunkRange],
        progress: &dyn ProgressSink,
    ) -> Result<(Vec<PartDescriptor>, MultipartETag), PartFailure> {
        let mut reporter = ProgressReporter::new(progress, Phase::Upload, staged.len());

        let part_futs = parts.iter().map(|part| {
            // Plan indices start at 0 but part numbers start at 1
            let part_number = part.index + 1;
            let span = tracing::debug_span!("upload part", part_number, len = part.len());

            self.upload_part(session, staged, *part, part_number)
                .instrument(span)
        });

        // Use the magic of `buffer_unordered` to poll these part uploading futures up to a
        // maximum concurrency level.  Returning early on the first error drops the stream, which
        // cancels all of the other uploads in progress.
        let mut uploads = futures::stream::iter(part_futs).buffer_unordered(self.concurrency);

        let mut completed = Vec::with_capacity(parts.len());
        let mut e_tag = MultipartETag::new();

        while let Some(UploadedPart {
            descriptor,
            attempts,
            md5,
        }) = uploads.try_next().await?
        {
            reporter.advance(descriptor.len());
            reporter
                .sink()
                .part_uploaded(descriptor.part_number, descriptor.len(), attempts);

            e_tag.add_part(descriptor.part_number, md5);
            completed.push(descriptor);
        }

        // Parts finish in whatever order, but must be committed in part number order
        completed.sort_unstable_by_key(|part| part.part_number);

        Ok((completed, e_tag))
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        staged: &StagedObject,
        part: ChunkRange,
        part_number: usize,
    ) -> Result<UploadedPart, PartFailure> {
        let destination = self.destination;

        // Reading from staging is local I/O; if that fails, nothing about the destination will
        // fix it
        let data = staged
            .read_range(part.byte_range())
            .await
            .map_err(|e| PartFailure {
                part_number,
                attempts: 0,
                error: StoreError::permanent("read staged part", e),
            })?;
        let md5 = part_md5(&data);

        let uploaded = self
            .retry
            .run_store("upload part", |attempt| {
                let data = data.clone();

                async move {
                    debug!(attempt, "Uploading part");

                    destination.upload_part(session, part_number, data).await
                }
            })
            .await
            .map_err(|failure| PartFailure {
                part_number,
                attempts: failure.attempts,
                error: failure.error,
            })?;

        debug!(e_tag = %uploaded.value, attempts = uploaded.attempts, "Uploaded part");

        Ok(UploadedPart {
            descriptor: PartDescriptor {
                part_number,
                start: part.start,
                end: part.end,
                e_tag: Some(uploaded.value),
            },
            attempts: uploaded.attempts,
            md5,
        })
    }

    /// Abort the upload session.  Returns `true` if the destination released it.
    ///
    /// A failed abort can't be handled any further here, but it means the destination may be
    /// holding (and billing for) the parts uploaded so far, so it's logged loudly.
    async fn abort(&self, session: &UploadSession) -> bool {
        match self.destination.abort(session).await {
            Ok(()) => {
                info!(upload_id = %session.upload_id, "Aborted multipart upload");
                true
            }
            Err(e) => {
                error!(
                    upload_id = %session.upload_id,
                    key = %session.key,
                    err = ?e,
                    "Failed to abort multipart upload; the uploaded parts may be leaked until they are cleaned up manually"
                );
                false
            }
        }
    }
}
