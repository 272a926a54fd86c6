//! worklink-worker: a worker process started by its controller.
//!
//! ```bash
//! worklink-worker --app echo --uuid 7a8c3f1e --endpoint /run/worklink/echo.sock \
//!     --locator 127.0.0.1:10053
//! ```
//!
//! Logs go to stderr, filtered by `RUST_LOG`. The exit status is 0 after the
//! controller terminates the worker, 1 when the session fails, 2 for bad
//! options and 3 when the controller cannot be reached.

use std::process::ExitCode;

use clap::Parser;
use worklink::{Event, Options, Worker, WorkerError, init_tracing};

fn main() -> ExitCode {
    let options = Options::parse();
    init_tracing();

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to create runtime");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(serve(options)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "worker stopped");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn serve(options: Options) -> Result<(), WorkerError> {
    tracing::info!(app = %options.app, uuid = %options.uuid, "starting worker");

    let worker = Worker::connect(options).await?;
    worker.fallback(|event: Event| async move {
        tracing::info!(event = %event.name, bytes = event.payload.len(), "unhandled event");
    });

    worker.run().await
}
