//! Per-test log capture.
//!
//! Transfers log from many tokio worker threads at once, and with several tests running in
//! parallel the output of the default subscriber is an unreadable interleaving.  Each test run
//! through [`test_with_logging`] gets its own subscriber and its own runtime, and its log output
//! is printed in one piece when the test finishes.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Filter used when `RUST_LOG` isn't set.  The HTTP and AWS internals are very chatty at debug.
const DEFAULT_FILTER: &str = "h2=warn,hyper=info,rustls=info,aws=info,reqwest=info,debug";

/// Buffer that receives every formatted log line of one test
#[derive(Clone, Default)]
struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Empty the buffer, returning what was in it.  Invalid UTF-8 is replaced rather than lost.
    fn drain(&self) -> String {
        let buffer = std::mem::take(&mut *self.buffer.lock().unwrap());

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl<'a> Write for &'a CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn make_dispatch(logs: CapturedLogs) -> tracing::Dispatch {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let format = fmt::layer()
        .with_level(true)
        .with_target(true)
        // Several worker threads log at once, so knowing which thread logged what is valuable
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(logs);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .unwrap();

    tracing::Dispatch::new(tracing_subscriber::registry().with(filter).with(format))
}

/// Build a multi-threaded runtime in which every worker thread logs to `dispatch`
fn make_runtime(dispatch: Arc<tracing::Dispatch>) -> std::io::Result<tokio::runtime::Runtime> {
    std::thread_local! {
        static WORKER_DISPATCH: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .on_thread_start(move || {
            let guard = tracing::dispatcher::set_default(&dispatch);
            WORKER_DISPATCH.with(|cell| cell.replace(Some(guard)));
        })
        .on_thread_stop(|| {
            WORKER_DISPATCH.with(|cell| cell.replace(None));
        })
        .build()
}

/// Run a test future with logging captured for this test only.
///
/// This takes the place of `tokio::test`.  The log output is printed when the test ends, whether
/// it passed, failed, or panicked, so it shows up alongside the failure in the test report.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let logs = CapturedLogs::default();
    let dispatch = Arc::new(make_dispatch(logs.clone()));

    tracing::dispatcher::with_default(&dispatch, || {
        let runtime = make_runtime(dispatch.clone())?;

        // Test futures can't reasonably be required to be unwind safe
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Log events from this test: \n{}", logs.drain());

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
