//! In-memory implementations of [`blobhop::SourceReader`] and [`blobhop::DestinationWriter`] with
//! scripted failures, so that the pipeline's retry, abort, and verification behavior can be tested
//! deterministically without any real object storage.
//!
//! Both fakes are cheaply cloneable; a test keeps one clone to inspect what happened and hands the
//! other to the transfer job.
use blobhop::{
    DestinationDescriptor, DestinationWriter, FailureClass, PartDescriptor, SourceReader,
    StoreError, UploadSession,
};
use bytes::Bytes;
use md5::{Digest, Md5};
use rand::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Error type the fakes wrap in [`StoreError`]
#[derive(Debug)]
struct InjectedFailure(&'static str);

impl std::fmt::Display for InjectedFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "injected failure: {}", self.0)
    }
}

impl std::error::Error for InjectedFailure {}

fn injected(class: FailureClass, operation: &'static str) -> StoreError {
    StoreError::classified(class, operation, InjectedFailure(operation))
}

/// Pop the next scripted failure for `key`, if any are left
fn next_failure<K: std::hash::Hash + Eq>(
    script: &Mutex<HashMap<K, VecDeque<FailureClass>>>,
    key: &K,
) -> Option<FailureClass> {
    script
        .lock()
        .unwrap()
        .get_mut(key)
        .and_then(|failures| failures.pop_front())
}

#[derive(Debug, Default)]
struct SourceInner {
    objects: Mutex<HashMap<String, Bytes>>,

    /// Failures to inject into `fetch_range`, keyed by the start offset of the range
    range_failures: Mutex<HashMap<u64, VecDeque<FailureClass>>>,

    /// Upper bound on a random delay before each range is returned, to shuffle completion order
    max_delay: Mutex<Option<Duration>>,

    /// Fixed delays for specific ranges, keyed by start offset, which override `max_delay`
    range_delays: Mutex<HashMap<u64, Duration>>,

    fetches: AtomicUsize,
    completed_fetches: AtomicUsize,
    deletes: Mutex<Vec<String>>,
    fail_delete: AtomicBool,
}

#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    inner: Arc<SourceInner>,
}

impl MemorySource {
    pub fn with_object(object: &str, data: Bytes) -> Self {
        let source = Self::default();
        source
            .inner
            .objects
            .lock()
            .unwrap()
            .insert(object.to_string(), data);

        source
    }

    /// Make the range starting at `offset` fail once for each entry in `failures`, in order, before
    /// it succeeds
    pub fn fail_range(&self, offset: u64, failures: impl IntoIterator<Item = FailureClass>) {
        self.inner
            .range_failures
            .lock()
            .unwrap()
            .insert(offset, failures.into_iter().collect());
    }

    /// Delay every range by a random amount of up to `max_delay`
    pub fn with_random_delays(self, max_delay: Duration) -> Self {
        *self.inner.max_delay.lock().unwrap() = Some(max_delay);
        self
    }

    /// Delay the range starting at `offset` by `delay` every time it's fetched
    pub fn delay_range(&self, offset: u64, delay: Duration) {
        self.inner.range_delays.lock().unwrap().insert(offset, delay);
    }

    pub fn fail_deletes(&self) {
        self.inner.fail_delete.store(true, Ordering::SeqCst);
    }

    /// Total `fetch_range` calls, including failed ones
    pub fn fetches(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// `fetch_range` calls which ran to completion and returned data
    pub fn completed_fetches(&self) -> usize {
        self.inner.completed_fetches.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.inner.deletes.lock().unwrap().clone()
    }

    pub fn contains(&self, object: &str) -> bool {
        self.inner.objects.lock().unwrap().contains_key(object)
    }

    fn object(&self, object: &str) -> Result<Bytes, StoreError> {
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(object)
            .cloned()
            .ok_or_else(|| injected(FailureClass::Permanent, "find source object"))
    }
}

#[async_trait::async_trait]
impl SourceReader for MemorySource {
    async fn object_size(&self, object: &str) -> Result<u64, StoreError> {
        Ok(self.object(object)?.len() as u64)
    }

    async fn fetch_range(&self, object: &str, range: Range<u64>) -> Result<Bytes, StoreError> {
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);

        let fixed_delay = self.inner.range_delays.lock().unwrap().get(&range.start).copied();
        let max_delay = *self.inner.max_delay.lock().unwrap();
        let delay = match (fixed_delay, max_delay) {
            (Some(delay), _) => Some(delay),
            (None, Some(max_delay)) => Some(Duration::from_millis(
                rand::thread_rng().gen_range(0..=max_delay.as_millis() as u64),
            )),
            (None, None) => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(class) = next_failure(&self.inner.range_failures, &range.start) {
            return Err(injected(class, "fetch range"));
        }

        let data = self.object(object)?;
        self.inner.completed_fetches.fetch_add(1, Ordering::SeqCst);

        Ok(data.slice(range.start as usize..range.end as usize))
    }

    async fn delete_object(&self, object: &str) -> Result<(), StoreError> {
        if self.inner.fail_delete.load(Ordering::SeqCst) {
            return Err(injected(FailureClass::Permanent, "delete source object"));
        }

        self.inner.objects.lock().unwrap().remove(object);
        self.inner.deletes.lock().unwrap().push(object.to_string());

        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoredObject {
    data: Bytes,
    metadata: HashMap<String, String>,
    e_tag: String,
}

#[derive(Debug, Default)]
struct UploadInProgress {
    key: String,
    metadata: HashMap<String, String>,
    parts: HashMap<usize, Bytes>,
}

#[derive(Debug, Default)]
struct DestinationInner {
    objects: Mutex<HashMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, UploadInProgress>>,
    next_upload_id: AtomicUsize,

    /// Failures to inject into `upload_part`, keyed by part number
    part_failures: Mutex<HashMap<usize, VecDeque<FailureClass>>>,
    fail_initiate: Mutex<Option<FailureClass>>,
    fail_commit: Mutex<Option<FailureClass>>,
    fail_abort: AtomicBool,

    /// Parts whose first byte is flipped when stored, as if they were damaged in transit
    corrupt_parts: Mutex<Vec<usize>>,

    min_part_size: AtomicUsize,

    initiates: AtomicUsize,
    part_attempts: AtomicUsize,
    commits: Mutex<Vec<Vec<usize>>>,
    aborts: AtomicUsize,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryDestination {
    inner: Arc<DestinationInner>,
}

impl MemoryDestination {
    /// Make part `part_number` fail once for each entry in `failures`, in order, before it succeeds
    pub fn fail_part(&self, part_number: usize, failures: impl IntoIterator<Item = FailureClass>) {
        self.inner
            .part_failures
            .lock()
            .unwrap()
            .insert(part_number, failures.into_iter().collect());
    }

    pub fn fail_initiate(&self, class: FailureClass) {
        *self.inner.fail_initiate.lock().unwrap() = Some(class);
    }

    pub fn fail_commit(&self, class: FailureClass) {
        *self.inner.fail_commit.lock().unwrap() = Some(class);
    }

    pub fn fail_aborts(&self) {
        self.inner.fail_abort.store(true, Ordering::SeqCst);
    }

    /// Store a damaged copy of part `part_number` instead of the bytes that were sent.  The part's
    /// ETag is computed over what was stored, the way a real store would.
    pub fn corrupt_part(&self, part_number: usize) {
        self.inner.corrupt_parts.lock().unwrap().push(part_number);
    }

    /// Require every part but the last to be at least `min_part_size` bytes
    pub fn with_min_part_size(self, min_part_size: usize) -> Self {
        self.inner
            .min_part_size
            .store(min_part_size, Ordering::SeqCst);
        self
    }

    pub fn initiates(&self) -> usize {
        self.inner.initiates.load(Ordering::SeqCst)
    }

    /// Total `upload_part` calls, including failed ones
    pub fn part_attempts(&self) -> usize {
        self.inner.part_attempts.load(Ordering::SeqCst)
    }

    /// The part numbers passed to each `commit` call, in call order
    pub fn commits(&self) -> Vec<Vec<usize>> {
        self.inner.commits.lock().unwrap().clone()
    }

    pub fn aborts(&self) -> usize {
        self.inner.aborts.load(Ordering::SeqCst)
    }

    /// Uploads that were initiated but neither committed nor aborted
    pub fn uploads_in_progress(&self) -> usize {
        self.inner.uploads.lock().unwrap().len()
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|object| object.data.clone())
    }

    pub fn metadata(&self, key: &str) -> Option<HashMap<String, String>> {
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|object| object.metadata.clone())
    }
}

#[async_trait::async_trait]
impl DestinationWriter for MemoryDestination {
    async fn initiate_upload(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<UploadSession, StoreError> {
        self.inner.initiates.fetch_add(1, Ordering::SeqCst);

        if let Some(class) = *self.inner.fail_initiate.lock().unwrap() {
            return Err(injected(class, "initiate upload"));
        }

        let upload_id = format!(
            "upload-{}",
            self.inner.next_upload_id.fetch_add(1, Ordering::SeqCst)
        );
        self.inner.uploads.lock().unwrap().insert(
            upload_id.clone(),
            UploadInProgress {
                key: key.to_string(),
                metadata: metadata.clone(),
                parts: HashMap::new(),
            },
        );

        Ok(UploadSession {
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: usize,
        data: Bytes,
    ) -> Result<String, StoreError> {
        self.inner.part_attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(class) = next_failure(&self.inner.part_failures, &part_number) {
            return Err(injected(class, "upload part"));
        }

        let data = if self.inner.corrupt_parts.lock().unwrap().contains(&part_number) {
            let mut damaged = data.to_vec();
            if let Some(first) = damaged.first_mut() {
                *first ^= 0xff;
            }
            Bytes::from(damaged)
        } else {
            data
        };

        let e_tag = format!("\"{:x}\"", Md5::digest(&data));

        let mut uploads = self.inner.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(&session.upload_id)
            .ok_or_else(|| injected(FailureClass::Permanent, "find upload"))?;
        upload.parts.insert(part_number, data);

        Ok(e_tag)
    }

    async fn commit(
        &self,
        session: &UploadSession,
        parts: &[PartDescriptor],
    ) -> Result<DestinationDescriptor, StoreError> {
        self.inner
            .commits
            .lock()
            .unwrap()
            .push(parts.iter().map(|part| part.part_number).collect());

        if let Some(class) = *self.inner.fail_commit.lock().unwrap() {
            return Err(injected(class, "commit upload"));
        }

        let mut uploads = self.inner.uploads.lock().unwrap();
        let upload = uploads
            .remove(&session.upload_id)
            .ok_or_else(|| injected(FailureClass::Permanent, "find upload"))?;

        // Multipart ETags are the MD5 of the concatenated part MD5s, plus the part count
        let mut data = Vec::new();
        let mut e_tag = Md5::new();
        for part in parts {
            let part_data = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| injected(FailureClass::Permanent, "find part"))?;
            data.extend_from_slice(part_data);
            e_tag.update(Md5::digest(part_data));
        }
        let data = Bytes::from(data);
        let e_tag = format!("\"{:x}-{}\"", e_tag.finalize(), parts.len());

        let min_part_size = self.inner.min_part_size.load(Ordering::SeqCst);
        if let Some((_, all_but_last)) = parts.split_last() {
            if all_but_last.iter().any(|part| (part.len() as usize) < min_part_size) {
                return Err(injected(FailureClass::Permanent, "part smaller than the minimum"));
            }
        }

        let descriptor = DestinationDescriptor {
            key: upload.key.clone(),
            size: Some(data.len() as u64),
            e_tag: Some(e_tag.clone()),
        };

        self.inner.objects.lock().unwrap().insert(
            upload.key,
            StoredObject {
                data,
                metadata: upload.metadata,
                e_tag,
            },
        );

        Ok(descriptor)
    }

    async fn abort(&self, session: &UploadSession) -> Result<(), StoreError> {
        self.inner.aborts.fetch_add(1, Ordering::SeqCst);

        if self.inner.fail_abort.load(Ordering::SeqCst) {
            return Err(injected(FailureClass::Permanent, "abort upload"));
        }

        self.inner.uploads.lock().unwrap().remove(&session.upload_id);

        Ok(())
    }

    fn min_part_size(&self) -> u64 {
        self.inner.min_part_size.load(Ordering::SeqCst) as u64
    }

    async fn describe(&self, key: &str) -> Result<DestinationDescriptor, StoreError> {
        let objects = self.inner.objects.lock().unwrap();
        let object = objects
            .get(key)
            .ok_or_else(|| injected(FailureClass::Permanent, "describe object"))?;

        Ok(DestinationDescriptor {
            key: key.to_string(),
            size: Some(object.data.len() as u64),
            e_tag: Some(object.e_tag.clone()),
        })
    }
}
