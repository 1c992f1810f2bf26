//! Parallel ranged download of the source object into the staging area.
use crate::hash::IntegrityHasher;
use crate::objstore::SourceReader;
use crate::plan::ChunkRange;
use crate::progress::{Phase, ProgressReporter, ProgressSink};
use crate::reorder::ReorderBuffer;
use crate::retry::RetryPolicy;
use crate::staging::{StagedObject, StagingBuffer};
use crate::{Result, StoreError};
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use snafu::IntoError;
use tracing::{debug, error, info, instrument, Instrument};

/// The fully downloaded source object and its content hash
#[derive(Debug)]
pub struct DownloadedObject {
    pub staged: StagedObject,

    /// Lowercase hex MD5 of the object's contents
    pub source_hash: String,
}

/// One range that has been fetched and written to staging, waiting its turn to be hashed
struct FetchedRange {
    range: ChunkRange,
    data: Bytes,
    attempts: usize,
}

/// Runs a bounded pool of range fetches against the source, staging each range at its offset and
/// hashing the ranges strictly in order.
pub(crate) struct DownloadCoordinator<'a> {
    pub source: &'a dyn SourceReader,
    pub object: &'a str,
    pub retry: &'a RetryPolicy,
    pub concurrency: usize,

    /// How far ahead of the next range to hash a fetch may be started
    pub reorder_window: usize,
}

impl<'a> DownloadCoordinator<'a> {
    /// Download every range in `ranges` into `staging`.
    ///
    /// Fetches complete in any order, but no range is started unless it falls within the reorder
    /// window, so at most `reorder_window` fetched ranges are ever held in memory waiting for a
    /// predecessor.  The first range that fails permanently (or exhausts its retries) fails the
    /// whole download; all other in-flight fetches are dropped and the staging area is discarded
    /// along with them.
    #[instrument(skip_all, fields(object = self.object, ranges = ranges.len()))]
    pub async fn run(
        &self,
        ranges: &[ChunkRange],
        staging: StagingBuffer,
        progress: &dyn ProgressSink,
    ) -> Result<DownloadedObject> {
        let total_size = staging.len();
        let mut hasher = IntegrityHasher::<md5::Md5>::new(total_size);
        let mut reorder = ReorderBuffer::<FetchedRange>::new(self.reorder_window);
        let mut reporter = ProgressReporter::new(progress, Phase::Download, total_size);

        let mut in_flight = FuturesUnordered::new();
        let mut pending = ranges.iter().copied().peekable();

        info!(total_size, "Starting download");

        loop {
            // Top up the pool, but never with a range too far ahead of the next one to hash
            while in_flight.len() < self.concurrency {
                match pending.next_if(|range| reorder.accepts(range.index)) {
                    Some(range) => in_flight.push(self.fetch_range(range, &staging)),
                    None => break,
                }
            }

            let Some(result) = in_flight.next().await else {
                break;
            };

            let fetched = match result {
                Ok(fetched) => fetched,
                Err(e) => {
                    error!(err = ?e, in_flight = in_flight.len(), "Range download failed; abandoning the download");

                    return Err(e);
                }
            };

            reporter.advance(fetched.range.len());
            reporter
                .sink()
                .range_fetched(fetched.range.index, fetched.range.len(), fetched.attempts);

            reorder.insert(fetched.range.index, fetched)?;

            while let Some((_, ready)) = reorder.pop_ready() {
                hasher.update(ready.range.start, &ready.data)?;
            }

            debug!(
                next_to_hash = reorder.next_index(),
                buffered = reorder.buffered(),
                "Range hashed or buffered"
            );
        }

        // The finished pool still borrows the staging area
        drop(in_flight);

        let source_hash = hasher.finalize()?;

        info!(%source_hash, "Download complete");

        Ok(DownloadedObject {
            staged: staging.seal(),
            source_hash,
        })
    }

    /// Fetch one range with retries and write it to its place in staging
    async fn fetch_range(&self, range: ChunkRange, staging: &StagingBuffer) -> Result<FetchedRange> {
        let source = self.source;
        let object = self.object;

        let span = tracing::debug_span!("fetch range", index = range.index, start = range.start, len = range.len());

        let fetched = self
            .retry
            .run_store("fetch source range", |attempt| async move {
                debug!(attempt, "Fetching range");

                let data = source.fetch_range(object, range.byte_range()).await?;

                // A short read means the response was cut off, which is worth another try
                if data.len() as u64 != range.len() {
                    return Err(StoreError::transient(
                        "fetch source range",
                        format!(
                            "expected {} bytes but received {}",
                            range.len(),
                            data.len()
                        ),
                    ));
                }

                Ok(data)
            })
            .instrument(span.clone())
            .await
            .map_err(|failure| {
                crate::error::DownloadFailedSnafu {
                    object,
                    failed_ranges: vec![range.index],
                    attempts: failure.attempts,
                }
                .into_error(failure.error)
            })?;

        if fetched.attempts > 1 {
            info!(parent: &span, attempts = fetched.attempts, "Range fetched after retrying");
        }

        staging
            .write_at(range.start, fetched.value.clone())
            .instrument(span)
            .await?;

        Ok(FetchedRange {
            range,
            data: fetched.value,
            attempts: fetched.attempts,
        })
    }
}
