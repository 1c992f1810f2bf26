use blobhop::trigger::{self, TriggerResponse};
use blobhop::{TransferJobBuilder, TransferResult};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use url::Url;

mod progress;

/// Move one very large object from a blob store into S3
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[clap(flatten)]
    config: blobhop::Config,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transfer a single object from the source to the destination
    Transfer {
        /// URL of the object to read.
        ///
        /// EXAMPLES:
        ///
        /// s3://foo/bar.bin                                  - The object `bar.bin` in the S3 bucket `foo`
        ///
        /// https://acct.blob.core.windows.net/c/bar.bin?sv=... - An Azure blob, with a SAS token
        ///
        /// https://example.com/files/bar.bin                 - Any HTTP server that honors `Range`
        ///
        /// NOTE: Enclose URLs with query strings in "", otherwise your shell will interpret the `&`
        /// characters.
        #[clap(value_parser, value_name = "SOURCE_URL")]
        source: Url,

        /// S3 URL of the object to write, ie s3://bucket/path/to/object
        #[clap(value_parser, value_name = "DEST_URL")]
        destination: Url,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals)?;

    let response = match &args.command {
        Command::Transfer {
            source,
            destination,
        } => transfer(&args.globals, source, destination).await,
    };

    if response.is_success() {
        if !args.globals.quiet {
            println!("{}", response.body);
        }
    } else {
        eprintln!("{}", response.body);
    }

    Ok(exit_code(&response))
}

fn init_logging(globals: &Globals) -> color_eyre::Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    // Progress bars already show how the transfer is going, so normally only problems are logged
    let default_filter = if globals.verbose {
        "h2=warn,hyper=info,rustls=info,aws=info,blobhop=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "h2=warn,hyper=info,rustls=info,aws=info,warn"
    };

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}

async fn transfer(globals: &Globals, source: &Url, destination: &Url) -> TriggerResponse {
    let object_name = display_name(source);

    let job = progress::with_spinner(globals, "Querying source object...", async {
        TransferJobBuilder::from_urls(globals.config.clone(), source, destination)
            .await?
            .build()
            .await
    })
    .await;

    let result = match job {
        Ok(job) => progress::run_transfer_job(globals, job).await,
        Err(e) => {
            tracing::error!(err = %blobhop::error_chain(&e), "Unable to start transfer");

            TransferResult::from_error(&e)
        }
    };

    trigger::respond(Some(&object_name), Some(&result))
}

/// The source URL as shown to the user, without its query string since that may hold credentials
/// like an Azure SAS token
fn display_name(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);

    url.to_string()
}

/// Client errors (nothing to transfer) exit with 2, everything else that failed with 1
fn exit_code(response: &TriggerResponse) -> ExitCode {
    match response.status {
        200..=299 => ExitCode::SUCCESS,
        400..=499 => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}
