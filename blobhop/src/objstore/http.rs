use super::SourceReader;
use crate::{FailureClass, Result, StoreError};
use bytes::Bytes;
use snafu::prelude::*;
use std::ops::Range;
use tracing::{debug, instrument};
use url::Url;

/// [`SourceReader`] which reads objects with plain HTTP requests, using the `Range` header to read
/// parts of objects.
///
/// Objects are addressed relative to a base URL, which is typically a container URL.  Any query
/// string on the base URL (such as an Azure SAS token) is sent with every request.
#[derive(Clone)]
pub struct HttpRangeSource {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpRangeSource {
    pub fn new(base_url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("blobhop/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(crate::error::HttpClientSnafu)?;

        Ok(Self { client, base_url })
    }

    /// Split the URL of a single object into a source rooted at the object's parent and the name
    /// of the object within it
    pub fn from_object_url(url: &Url) -> Result<(Self, String)> {
        let object = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| crate::error::MissingObjectKeySnafu { url: url.clone() }.build())?
            .to_string();

        let mut base_url = url.clone();
        if let Ok(mut segments) = base_url.path_segments_mut() {
            segments.pop();
        }

        // The object name stays percent-encoded, the way it appeared in the URL
        Ok((Self::new(base_url)?, object))
    }

    /// The full URL of `object`, keeping the base URL's query string
    fn object_url(&self, object: &str) -> Url {
        let mut url = self.base_url.clone();
        let path = format!("{}/{}", url.path().trim_end_matches('/'), object);
        url.set_path(&path);

        url
    }

    fn classify_status(status: reqwest::StatusCode) -> FailureClass {
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            FailureClass::Transient
        } else {
            FailureClass::Permanent
        }
    }

    fn classify_error(err: &reqwest::Error) -> FailureClass {
        if err.is_timeout() || err.is_connect() || err.is_body() || err.is_decode() {
            FailureClass::Transient
        } else if let Some(status) = err.status() {
            Self::classify_status(status)
        } else if err.is_request() {
            // Failures sending the request that aren't connect errors are mostly resets and
            // other I/O failures
            FailureClass::Transient
        } else {
            FailureClass::Permanent
        }
    }

    /// Send a request, turning both transport failures and non-success statuses into classified
    /// [`StoreError`]s
    async fn send(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| StoreError::classified(Self::classify_error(&e), operation, e))
    }
}

#[async_trait::async_trait]
impl SourceReader for HttpRangeSource {
    #[instrument(skip(self))]
    async fn object_size(&self, object: &str) -> Result<u64, StoreError> {
        let operation = "get source object size";
        let response = self
            .send(operation, self.client.head(self.object_url(object)))
            .await?;

        // `Response::content_length` describes the (empty) body of a HEAD response, not the object
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .and_then(|len| len.parse::<u64>().ok())
            .ok_or_else(|| {
            StoreError::permanent(
                operation,
                format!("response for '{object}' has no Content-Length"),
            )
        })
    }

    async fn fetch_range(&self, object: &str, range: Range<u64>) -> Result<Bytes, StoreError> {
        let operation = "fetch source range";
        let expected_len = range.end - range.start;

        // HTTP range ends are inclusive
        let response = self
            .send(
                operation,
                self.client
                    .get(self.object_url(object))
                    .header(
                        reqwest::header::RANGE,
                        format!("bytes={}-{}", range.start, range.end - 1),
                    ),
            )
            .await?;

        // A server that ignores `Range` replies 200 with the whole object, which is only what we
        // want if the range happens to be the whole object
        let status = response.status();
        let ranged = status == reqwest::StatusCode::PARTIAL_CONTENT;
        let range_ignored = || {
            StoreError::permanent(
                operation,
                format!("server replied {status} to a range request; range requests are not supported"),
            )
        };

        if !ranged && range.start != 0 {
            return Err(range_ignored());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StoreError::classified(Self::classify_error(&e), operation, e))?;

        if !ranged && bytes.len() as u64 != expected_len {
            return Err(range_ignored());
        } else if bytes.len() as u64 != expected_len {
            // Most likely the connection was cut short
            return Err(StoreError::transient(
                operation,
                format!(
                    "expected {expected_len} bytes for range {range:?} but received {}",
                    bytes.len()
                ),
            ));
        }

        debug!(object, ?range, "Fetched range");

        Ok(bytes)
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, object: &str) -> Result<(), StoreError> {
        self.send(
            "delete source object",
            self.client.delete(self.object_url(object)),
        )
        .await?;

        Ok(())
    }
}

impl std::fmt::Debug for HttpRangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The query string can hold a credential, so leave it out
        let mut base_url = self.base_url.clone();
        base_url.set_query(None);

        f.debug_struct("HttpRangeSource")
            .field("base_url", &base_url.as_str())
            .finish()
    }
}
