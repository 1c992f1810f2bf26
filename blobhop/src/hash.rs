//! Incremental content hash of the object, fed in strict offset order.
use crate::Result;
use digest::Digest;
use snafu::prelude::*;

/// Running digest of the object's contents.
///
/// Bytes must be supplied in order, starting from offset 0, with no gaps and no overlaps.
/// Supplying bytes at any other offset is a logic error in the caller and fails with
/// [`crate::BlobhopError::OutOfOrder`].
///
/// The pipeline uses MD5, but any [`Digest`] implementation works.
pub struct IntegrityHasher<D = md5::Md5> {
    hasher: Option<D>,
    next_offset: u64,
    total_size: u64,
}

impl<D: Digest> IntegrityHasher<D> {
    /// Start hashing an object which is expected to be `total_size` bytes long
    pub fn new(total_size: u64) -> Self {
        Self {
            hasher: Some(D::new()),
            next_offset: 0,
            total_size,
        }
    }

    /// The offset at which the next call to [`Self::update`] must start
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn is_complete(&self) -> bool {
        self.next_offset == self.total_size
    }

    pub fn update(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let hasher = self
            .hasher
            .as_mut()
            .context(crate::error::AlreadyFinalizedSnafu)?;

        ensure!(
            offset == self.next_offset,
            crate::error::OutOfOrderSnafu {
                expected: self.next_offset,
                actual: offset,
            }
        );

        let end = self.next_offset + bytes.len() as u64;
        ensure!(
            end <= self.total_size,
            crate::error::OverrunSnafu {
                end,
                expected: self.total_size,
            }
        );

        hasher.update(bytes);
        self.next_offset = end;

        Ok(())
    }

    /// Finish hashing and return the digest as lowercase hex.
    ///
    /// Only valid once every byte of the object has been consumed, and only once.
    pub fn finalize(&mut self) -> Result<String> {
        ensure!(
            self.hasher.is_some(),
            crate::error::AlreadyFinalizedSnafu
        );
        ensure!(
            self.is_complete(),
            crate::error::IncompleteSnafu {
                consumed: self.next_offset,
                expected: self.total_size,
            }
        );

        let hasher = self
            .hasher
            .take()
            .context(crate::error::AlreadyFinalizedSnafu)?;

        Ok(to_hex(&hasher.finalize()))
    }
}

/// The ETag S3 assigns to an object completed with a multipart upload.
///
/// That is the MD5 of the concatenated binary MD5s of every part, followed by `-` and the part
/// count.  Each part's MD5 is computed by the destination over the bytes it received, so matching
/// this value against what the destination reports shows that the stored bytes are the ones that
/// were sent.
#[derive(Clone, Debug, Default)]
pub struct MultipartETag {
    part_digests: Vec<(usize, Vec<u8>)>,
}

impl MultipartETag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the MD5 of part `part_number`, from [`part_md5`].  Parts may be added in any order.
    pub fn add_part(&mut self, part_number: usize, part_md5: Vec<u8>) {
        self.part_digests.push((part_number, part_md5));
    }

    /// The expected ETag, as lowercase hex without the surrounding quotes S3 puts on it
    pub fn e_tag(&self) -> String {
        let mut part_digests = self.part_digests.iter().collect::<Vec<_>>();
        part_digests.sort_unstable_by_key(|(part_number, _)| *part_number);

        let mut hasher = md5::Md5::new();
        for (_, digest) in &part_digests {
            hasher.update(digest);
        }

        format!("{}-{}", to_hex(&hasher.finalize()), part_digests.len())
    }

    /// Compare with an ETag reported by the destination, which may be quoted and in any case
    pub fn matches(&self, reported: &str) -> bool {
        reported
            .trim_matches('"')
            .eq_ignore_ascii_case(&self.e_tag())
    }
}

/// Binary MD5 of one part's contents
pub fn part_md5(data: &[u8]) -> Vec<u8> {
    md5::Md5::digest(data).to_vec()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

impl<D> std::fmt::Debug for IntegrityHasher<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityHasher")
            .field("next_offset", &self.next_offset)
            .field("total_size", &self.total_size)
            .field("finalized", &self.hasher.is_none())
            .finish()
    }
}
