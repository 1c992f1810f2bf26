//! Wrapper around the `minio` server binary to run ephemeral instances of S3-compatible object
//! storage for testing
use crate::Result;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::config::Credentials;
use color_eyre::eyre::eyre;
use duct::Handle;
use once_cell::sync::Lazy;
use rand::prelude::*;
use regex::Regex;
use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::debug;
use which::which;

/// Minio's out-of-the-box root credentials
const ACCESS_KEY: &str = "minioadmin";
const SECRET_KEY: &str = "minioadmin";

pub struct MinioServer {
    #[allow(dead_code)] // Never used, but needs to stay in scope so the temp dir isn't deleted
    data_dir: TempDir,
    handle: Handle,
    endpoint: SocketAddr,
}

impl MinioServer {
    /// Get a running server, sharing one with any other test that is using it at the same time.
    ///
    /// Starting minio takes a while, so sharing the server amortizes that cost across tests.
    pub async fn get() -> Result<Arc<Self>> {
        // The lock is held across the server start, which is an await point
        static SHARED: Lazy<Mutex<Weak<MinioServer>>> = Lazy::new(|| Mutex::new(Weak::new()));

        let mut shared = SHARED.lock().await;

        let server = match shared.upgrade() {
            Some(server) => server,
            None => {
                let server = Arc::new(Self::start().await?);
                *shared = Arc::downgrade(&server);

                server
            }
        };

        debug!(endpoint = %server.endpoint, "Using minio server");

        server.wait_for_service_start().await?;

        Ok(server)
    }

    /// Start a new minio server on a random high port.
    ///
    /// The binary is located with the `MINIO_PATH` env var if set, or in the `PATH` otherwise.
    pub async fn start() -> Result<Self> {
        let path = Self::find_minio()?;
        let endpoint = Self::random_endpoint()?;
        let data_dir = Self::temp_data_dir()?;

        let handle = duct::cmd!(
            path,
            "server",
            data_dir.path(),
            "--address",
            endpoint.to_string(),
            "--quiet"
        )
        .start()?;

        let server = Self {
            data_dir,
            handle,
            endpoint,
        };

        debug!(endpoint = %server.endpoint, "Waiting for minio service to start");
        server.wait_for_service_start().await?;
        debug!(endpoint = %server.endpoint, "Minio started");

        Ok(server)
    }

    /// The S3 API endpoint URL where the server is listening
    pub fn endpoint_url(&self) -> url::Url {
        // A SocketAddr always makes a valid URL
        url::Url::parse(&format!("http://{}/", self.endpoint)).unwrap()
    }

    /// Point the AWS SDK, as used by the code under test, at this server.
    ///
    /// The SDK reads credentials and region from the environment, so this sets them process-wide.
    /// Every test using minio uses the same values so it doesn't matter that tests share them.
    pub fn set_aws_env(&self) {
        std::env::set_var("AWS_ACCESS_KEY_ID", ACCESS_KEY);
        std::env::set_var("AWS_SECRET_ACCESS_KEY", SECRET_KEY);
        std::env::set_var("AWS_REGION", "us-east-1");
    }

    /// Get a client configured to use this server
    pub async fn aws_client(&self) -> Result<aws_sdk_s3::Client> {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(RegionProviderChain::first_try("us-east-1"))
            .credentials_provider(Credentials::from_keys(ACCESS_KEY, SECRET_KEY, None))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .endpoint_url(self.endpoint_url().as_str())
            .force_path_style(true)
            .build();

        Ok(aws_sdk_s3::Client::from_conf(s3_config))
    }

    /// Make a new bucket for a test.
    ///
    /// The actual bucket name gets a random prefix, because many tests share one server and must
    /// not trip over each other's objects.
    pub async fn create_bucket(&self, bucket: impl AsRef<str>) -> Result<String> {
        // Bucket names are at most 63 characters of letters, numbers, `.` and `-`
        static REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r##"[^0-9a-zA-Z\.\-]+"##).unwrap());

        let bucket = REGEX.replace_all(bucket.as_ref(), "-").to_lowercase();
        let bucket = &bucket[..bucket.len().min(63 - 9)];
        let bucket = format!("{:08x}-{bucket}", rand::thread_rng().next_u32());

        debug!(%bucket, "Creating bucket");

        let client = self.aws_client().await?;
        client.create_bucket().bucket(&bucket).send().await?;

        // Bucket creation is sometimes not visible right away
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        if let Err(e) = policy
            .retry(|| client.head_bucket().bucket(&bucket).send())
            .await
        {
            return Err(eyre!(
                "The bucket {bucket} is not accessible even after it was explicitly created.  Last error was: \n{e}"
            ));
        }

        Ok(bucket)
    }

    /// Count the multipart uploads still in progress in a bucket.
    ///
    /// After a transfer finishes, successfully or not, this should always be zero.
    pub async fn multipart_uploads_in_progress(&self, bucket: &str) -> Result<usize> {
        let client = self.aws_client().await?;

        let response = client.list_multipart_uploads().bucket(bucket).send().await?;

        Ok(response.uploads().len())
    }

    /// Block until able to successfully connect to the minio server or a timeout ocurrs
    async fn wait_for_service_start(&self) -> Result<()> {
        // On slow CI boxes startup can be agonizingly long
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        let client = self.aws_client().await?;

        policy
            .retry(|| client.list_buckets().send())
            .await
            .map(|_| ())
            .map_err(|e| eyre!("The minio server didn't come online in the allowed time.  The last error reported by ListBuckets against the server was:\n{e}"))
    }

    fn find_minio() -> Result<PathBuf> {
        std::env::var_os("MINIO_PATH").map(PathBuf::from)
            .or_else(|| which("minio").ok())
            .ok_or_else(|| eyre!("Unable to find `minio`, either set the MINIO_PATH env var or place the Minio executable in your PATH"))
    }

    /// Find a socket address on localhost that is free for minio to listen on
    fn random_endpoint() -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        Ok(addr)
    }

    /// Minio refuses to use a data directory on `tmpfs` (it needs `O_DIRECT`), which rules out
    /// `/tmp` on most Linux distros, so the data lives in a temp directory under `$HOME` instead.
    fn temp_data_dir() -> Result<TempDir> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("Unable to determine home directory"))?;

        Ok(tempfile::tempdir_in(home)?)
    }
}

impl Drop for MinioServer {
    fn drop(&mut self) {
        debug!(pids = ?self.handle.pids(), "Killing minio process(es)");

        if let Err(e) = self.handle.kill() {
            eprintln!("Error killing minio process: {}", e);
        }
    }
}
