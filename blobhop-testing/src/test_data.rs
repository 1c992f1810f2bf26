//! Generate test objects, either in memory or in S3-compatible object storage
use crate::Result;
use aws_sdk_s3::{primitives::ByteStream, Client};
use bytes::Bytes;
use digest::Digest;
use rand::prelude::*;
use url::Url;

#[derive(Clone, Debug)]
pub struct TestObject {
    pub key: String,
    pub size: usize,
}

impl TestObject {
    /// Make a new test object description with the size specified as a string so we can use
    /// human-friendly units like "10 KB" or "20 MiB"
    pub fn new(key: impl Into<String>, size: impl AsRef<str>) -> Self {
        let key = key.into();

        let size = byte_unit::Byte::from_str(size).unwrap();

        Self {
            key,
            size: size.get_bytes() as usize,
        }
    }

    /// Fill this object with random data
    pub fn with_random_data(self) -> TestObjectWithData {
        let data = random_data(self.size);
        let hash = md5_hex(&data);

        TestObjectWithData {
            key: self.key,
            data,
            hash,
        }
    }
}

/// The same test object as in [`TestObject`], but with the data that is written to the object
/// as well
#[derive(Clone, Debug)]
pub struct TestObjectWithData {
    pub key: String,
    pub data: Bytes,

    /// Lowercase hex MD5 of `data`
    pub hash: String,
}

impl TestObjectWithData {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The `s3://` URL of this object when it's stored in `bucket`
    pub fn s3_url(&self, bucket: &str) -> Url {
        s3_url(bucket, &self.key)
    }
}

/// Make an `s3://` URL for an object
pub fn s3_url(bucket: &str, key: &str) -> Url {
    Url::parse(&format!("s3://{bucket}/{key}")).unwrap()
}

/// Generate `len` bytes of random data
pub fn random_data(len: usize) -> Bytes {
    let mut rng = rand::thread_rng();
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);

    data.into()
}

/// Lowercase hex MD5 of some data, in the form the transfer reports the source hash
pub fn md5_hex(data: &[u8]) -> String {
    md5::Md5::digest(data)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Generate one or more test objects in a bucket.
///
/// Each object has a size specified.  Random data will be generated for each object, and the
/// objects with their data are returned so the test can validate what was transferred.
pub async fn make_test_data(
    client: &Client,
    bucket: &str,
    objects: impl IntoIterator<Item = TestObject>,
) -> Result<Vec<TestObjectWithData>> {
    let mut created = Vec::new();

    for object in objects {
        let object = object.with_random_data();

        client
            .put_object()
            .bucket(bucket)
            .key(&object.key)
            .body(ByteStream::from(object.data.clone()))
            .send()
            .await?;

        created.push(object);
    }

    Ok(created)
}

/// Read the entire contents of an object
pub async fn read_object(client: &Client, bucket: &str, key: &str) -> Result<Bytes> {
    let response = client.get_object().bucket(bucket).key(key).send().await?;

    Ok(response.body.collect().await?.into_bytes())
}

/// Assert that an object in the bucket has exactly the expected contents
pub async fn validate_object(
    client: &Client,
    bucket: &str,
    key: &str,
    expected: &TestObjectWithData,
) -> Result<()> {
    let data = read_object(client, bucket, key).await?;

    assert_eq!(
        expected.len(),
        data.len(),
        "object '{key}' has the wrong size"
    );
    assert_eq!(
        expected.hash,
        md5_hex(&data),
        "object '{key}' has the wrong contents"
    );

    Ok(())
}
