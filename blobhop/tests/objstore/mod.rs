//! Integration tests exercising the S3 implementations of [`blobhop::SourceReader`] and
//! [`blobhop::DestinationWriter`] against live object storage.
//!
//! These use [minio](https://min.io), which obviously assumes that minio is installed on the
//! local system.  They are marked `ignore` so that they must be explicitly invoked, with
//! `cargo test -- --ignored`.

mod minio;
