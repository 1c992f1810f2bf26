//! Implementation of the progress sink that renders progress bars
use blobhop::{Phase, ProgressSink, TransferJob, TransferResult};
use std::{borrow::Cow, future::Future, time::Duration, time::Instant};

/// Display a spinner while some long-running but unmeasurable task is running, then hide the
/// spinner when it finishes
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = if !hide_progress(globals) {
        indicatif::ProgressBar::new_spinner()
    } else {
        indicatif::ProgressBar::hidden()
    };

    spinner.set_style(
        indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );

    spinner.enable_steady_tick(Duration::from_millis(120));

    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Run the specified transfer job, with progress bars for extra pretty-ness
pub(crate) async fn run_transfer_job(globals: &super::Globals, job: TransferJob) -> TransferResult {
    let progress = TransferProgressReport::new(hide_progress(globals), &job);

    let result = job.run(progress.clone()).await;

    progress.finish(&result);

    result
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the progress bar rendering will be all messed up), or quiet mode (because
/// progress bars are not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

/// Progress reporting for a transfer, which receives progress updates from the lib crate and
/// renders one progress bar per phase
#[derive(Clone)]
struct TransferProgressReport {
    /// Aggregate which groups the bars below together
    multi: indicatif::MultiProgress,

    /// Source bytes downloaded into staging, counted as each range completes regardless of order
    downloaded: indicatif::ProgressBar,

    /// Staged bytes uploaded to the destination as multipart upload parts
    uploaded: indicatif::ProgressBar,

    started: Instant,
}

impl TransferProgressReport {
    fn new(hide_progress: bool, job: &TransferJob) -> Self {
        fn standard_style() -> indicatif::ProgressStyle {
            indicatif::ProgressStyle::with_template("{spinner:.green} {prefix}: {msg:<30!} [{bar:20.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
        .unwrap()
        .progress_chars("#>-")
        }

        let multi = if !hide_progress {
            indicatif::MultiProgress::new()
        } else {
            indicatif::MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden())
        };

        let total_bytes = job.total_bytes();

        let downloaded = multi.add(indicatif::ProgressBar::new(total_bytes));
        downloaded.set_style(standard_style());
        downloaded.set_prefix(format!("{:>8}", "Download"));
        downloaded.set_message(format!("{} ranges", job.ranges().len()));

        let uploaded = multi.add(indicatif::ProgressBar::new(total_bytes));
        uploaded.set_style(standard_style());
        uploaded.set_prefix(format!("{:>8}", "Upload"));
        uploaded.set_message(format!("{} parts", job.parts().len()));

        Self {
            multi,
            downloaded,
            uploaded,
            started: Instant::now(),
        }
    }

    fn bar(&self, phase: Phase) -> &indicatif::ProgressBar {
        match phase {
            Phase::Download => &self.downloaded,
            Phase::Upload => &self.uploaded,
        }
    }

    fn finish(&self, result: &TransferResult) {
        if result.success {
            let duration = self.started.elapsed();
            let bytes_per_second =
                (result.bytes_transferred as f64 / duration.as_secs_f64().max(0.001)) as u64;
            let bytes_per_second = indicatif::BinaryBytes(bytes_per_second);
            let total_bytes = indicatif::BinaryBytes(result.bytes_transferred);
            let duration = indicatif::HumanDuration(duration);

            self.downloaded.finish_with_message("Done");
            self.uploaded.finish_with_message("Done");

            // Nothing to be done if the terminal went away
            let _ = self.multi.println(format!(
                "Transfer completed ({total_bytes} in {duration}, {bytes_per_second}/s)"
            ));
        } else {
            let message = format!("Failed ({})", result.destination_state);

            for bar in [&self.downloaded, &self.uploaded] {
                if !bar.is_finished() {
                    bar.abandon_with_message(message.clone());
                }
            }
        }
    }
}

impl ProgressSink for TransferProgressReport {
    fn report(&self, phase: Phase, bytes_done: u64, total_bytes: u64) {
        let bar = self.bar(phase);

        bar.set_length(total_bytes);
        bar.set_position(bytes_done);
    }

    fn range_fetched(&self, range_index: usize, _bytes: u64, attempts: usize) {
        if attempts > 1 {
            self.downloaded
                .set_message(format!("range {range_index} ({attempts} attempts)"));
        } else {
            self.downloaded.set_message(format!("range {range_index}"));
        }

        finish_if_complete(&self.downloaded);
    }

    fn part_uploaded(&self, part_number: usize, _bytes: u64, attempts: usize) {
        if attempts > 1 {
            self.uploaded
                .set_message(format!("part {part_number} ({attempts} attempts)"));
        } else {
            self.uploaded.set_message(format!("part {part_number}"));
        }

        finish_if_complete(&self.uploaded);
    }
}

/// Byte counts are reported before the per-range and per-part events, so a bar is only marked done
/// once the event for its last piece has been shown
fn finish_if_complete(bar: &indicatif::ProgressBar) {
    if bar.length() == Some(bar.position()) {
        bar.finish_with_message("Done");
    }
}
