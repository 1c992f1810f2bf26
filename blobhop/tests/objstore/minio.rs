//! Tests that exercise interaction with a live object store, but which can be performed against a
//! local Minio S3-compatible object storage server for greater convenience and lower cost.
//!
//! We're not testing Minio's compatibility with S3 but rather the correct behavior of our code
//! when talking to S3 or any S3-compatible endpoint (minio included).
use crate::{progress::RecordingProgress, Result};
use assert_matches::assert_matches;
use blobhop::{
    BlobhopError, DestinationState, SourceReader, TransferJobBuilder, SOURCE_HASH_METADATA_KEY,
};
use blobhop_testing::{minio, test_data};

/// Set up the blobhop config to use the specified Minio server.
///
/// Parts are kept at the 5 MiB minimum S3 allows for every part but the last.
fn config_for_minio(server: &minio::MinioServer) -> blobhop::Config {
    server.set_aws_env();

    blobhop::Config {
        s3_endpoint: Some(server.endpoint_url()),
        chunk_size: byte_unit::Byte::from_bytes(1024 * 1024),
        part_size: byte_unit::Byte::from_bytes(5 * 1024 * 1024),
        download_concurrency: 4,
        upload_concurrency: 2,
        backoff_base_ms: 10,
        backoff_cap_ms: 100,
        ..Default::default()
    }
}

#[test]
#[ignore = "requires minio"]
fn s3_to_s3() -> Result<()> {
    blobhop_testing::logging::test_with_logging(async move {
        let server = minio::MinioServer::get().await?;
        let client = server.aws_client().await?;
        let source_bucket = server.create_bucket("s3-to-s3-source").await?;
        let destination_bucket = server.create_bucket("s3-to-s3-destination").await?;

        let objects = test_data::make_test_data(
            &client,
            &source_bucket,
            [test_data::TestObject::new("exports/big.bin", "12 MiB")],
        )
        .await?;
        let object = &objects[0];

        let job = TransferJobBuilder::from_urls(
            config_for_minio(&server),
            &object.s3_url(&source_bucket),
            &test_data::s3_url(&destination_bucket, "imports/big.bin"),
        )
        .await?
        .build()
        .await?;

        assert_eq!(object.len() as u64, job.total_bytes());
        assert_eq!(12, job.ranges().len());
        assert_eq!(3, job.parts().len());

        let progress = RecordingProgress::new();
        let result = job.run(progress.clone()).await;
        progress.sanity_check_updates();

        assert!(result.success, "{result:?}");
        assert_eq!(DestinationState::Committed, result.destination_state);
        assert_eq!(Some(object.hash.clone()), result.source_hash);

        test_data::validate_object(&client, &destination_bucket, "imports/big.bin", object).await?;

        let head = client
            .head_object()
            .bucket(&destination_bucket)
            .key("imports/big.bin")
            .send()
            .await?;
        assert_eq!(
            Some(&object.hash),
            head.metadata()
                .and_then(|metadata| metadata.get(SOURCE_HASH_METADATA_KEY))
        );

        assert_eq!(
            0,
            server
                .multipart_uploads_in_progress(&destination_bucket)
                .await?
        );

        Ok(())
    })
}

#[test]
#[ignore = "requires minio"]
fn s3_source_reads_ranges() -> Result<()> {
    blobhop_testing::logging::test_with_logging(async move {
        let server = minio::MinioServer::get().await?;
        let bucket = server.create_bucket("s3-source-ranges").await?;
        let objects = test_data::make_test_data(
            &server.aws_client().await?,
            &bucket,
            [test_data::TestObject::new("data.bin", "100 KiB")],
        )
        .await?;
        let object = &objects[0];

        let source = blobhop::S3Source::new(&config_for_minio(&server), bucket).await;

        assert_eq!(object.len() as u64, source.object_size("data.bin").await?);
        assert_eq!(
            object.data.slice(1000..5000),
            source.fetch_range("data.bin", 1000..5000).await?
        );

        // A missing object is not worth retrying
        let err = source.object_size("missing.bin").await.unwrap_err();
        assert!(!err.is_transient(), "{err:?}");

        source.delete_object("data.bin").await?;
        assert!(source.object_size("data.bin").await.is_err());

        Ok(())
    })
}

#[test]
#[ignore = "requires minio"]
fn missing_source_object() -> Result<()> {
    blobhop_testing::logging::test_with_logging(async move {
        let server = minio::MinioServer::get().await?;
        let bucket = server.create_bucket("missing-source-object").await?;

        let result = TransferJobBuilder::from_urls(
            config_for_minio(&server),
            &test_data::s3_url(&bucket, "does-not-exist.bin"),
            &test_data::s3_url(&bucket, "copy.bin"),
        )
        .await?
        .build()
        .await;

        assert_matches!(result, Err(BlobhopError::SourceSize { .. }));

        Ok(())
    })
}
