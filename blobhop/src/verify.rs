use crate::hash::MultipartETag;
use crate::objstore::{DestinationDescriptor, DestinationWriter};
use crate::upload::CommittedUpload;
use crate::Result;
use snafu::prelude::*;
use tracing::{debug, info, instrument, warn};

/// Compare what the destination reports about a committed object with what was uploaded to it.
///
/// The size must always match.  The ETag, which the destination derives from the MD5 of every
/// part it stored, is compared with `expected_e_tag` if `check_e_tag` is set and the destination
/// reports one.
pub(crate) fn compare(
    descriptor: &DestinationDescriptor,
    total_size: u64,
    expected_e_tag: &MultipartETag,
    check_e_tag: bool,
) -> std::result::Result<u64, String> {
    let size = descriptor
        .size
        .ok_or_else(|| "the destination did not report the object's size".to_string())?;

    if size != total_size {
        return Err(format!(
            "destination size {size} does not match source size {total_size}"
        ));
    }

    match (&descriptor.e_tag, check_e_tag) {
        (Some(e_tag), true) if !expected_e_tag.matches(e_tag) => Err(format!(
            "destination ETag {e_tag} does not match {} computed from the uploaded parts",
            expected_e_tag.e_tag()
        )),
        (None, true) => {
            debug!("Destination reports no ETag; only the size was verified");
            Ok(size)
        }
        _ => Ok(size),
    }
}

/// Query the destination for the committed object and verify it.  Returns the destination size.
///
/// If the destination doesn't report an ETag when described, the one returned when the upload
/// was committed is used instead.
#[instrument(skip(destination, committed))]
pub(crate) async fn verify_destination(
    destination: &dyn DestinationWriter,
    key: &str,
    total_size: u64,
    committed: &CommittedUpload,
    check_e_tag: bool,
) -> Result<u64> {
    let mut descriptor = destination
        .describe(key)
        .await
        .context(crate::error::DescribeSnafu { key })?;

    if descriptor.e_tag.is_none() {
        descriptor.e_tag = committed.descriptor.e_tag.clone();
    }

    match compare(&descriptor, total_size, &committed.expected_e_tag, check_e_tag) {
        Ok(size) => {
            info!(size, e_tag = ?descriptor.e_tag, "Destination object verified");
            Ok(size)
        }
        Err(mismatch) => {
            warn!(%mismatch, "Destination object failed verification and should not be trusted");

            crate::error::VerificationSnafu { key, mismatch }.fail()
        }
    }
}
