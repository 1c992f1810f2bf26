use tracing::info;

/// The phase of a transfer that a progress report refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum Phase {
    Download,
    Upload,
}

/// A trait which callers can implement to get progress updates as a transfer runs.
///
/// All methods have no-op default implementations, so implementors only need to override the
/// events they care about.  Calls are fire-and-forget; they're made from the task driving the
/// transfer so implementations should return quickly.
#[allow(unused_variables)]
pub trait ProgressSink: Sync + Send {
    /// Cumulative progress of a phase.  `bytes_done` never decreases within a phase.
    fn report(&self, phase: Phase, bytes_done: u64, total_bytes: u64) {}

    /// One range of the source object was downloaded and written to the staging area, taking
    /// `attempts` attempts
    fn range_fetched(&self, range_index: usize, bytes: u64, attempts: usize) {}

    /// One part was uploaded to the destination, taking `attempts` attempts
    fn part_uploaded(&self, part_number: usize, bytes: u64, attempts: usize) {}
}

/// Progress sink that ignores all updates, for callers that don't care about progress
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Integer percentage of `bytes_done` out of `total_bytes`, clamped to 100
pub fn percent_complete(bytes_done: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 100;
    }

    ((bytes_done as u128 * 100) / total_bytes as u128).min(100) as u8
}

/// Tracks cumulative bytes for one phase, forwarding every update to the sink and logging a
/// milestone each time another 10% of the phase completes.
pub(crate) struct ProgressReporter<'a> {
    sink: &'a dyn ProgressSink,
    phase: Phase,
    bytes_done: u64,
    total_bytes: u64,
    last_logged_percent: u8,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(sink: &'a dyn ProgressSink, phase: Phase, total_bytes: u64) -> Self {
        sink.report(phase, 0, total_bytes);

        Self {
            sink,
            phase,
            bytes_done: 0,
            total_bytes,
            last_logged_percent: 0,
        }
    }

    pub fn sink(&self) -> &'a dyn ProgressSink {
        self.sink
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    /// Record that another `bytes` bytes of this phase are done
    pub fn advance(&mut self, bytes: u64) {
        self.bytes_done += bytes;
        self.sink
            .report(self.phase, self.bytes_done, self.total_bytes);

        let percent = percent_complete(self.bytes_done, self.total_bytes);
        if percent / 10 > self.last_logged_percent / 10 {
            self.last_logged_percent = percent;

            info!(
                phase = %self.phase,
                bytes_done = self.bytes_done,
                total_bytes = self.total_bytes,
                "{} {percent}% complete",
                self.phase
            );
        }
    }
}
