//! # transfer-engine
//!
//! Task orchestration and queue engine for multi-backend transfer jobs.
//!
//! ## Design Philosophy
//!
//! transfer-engine is designed to be:
//! - **Backend-agnostic** - HTTP, torrent, Usenet, media-extractor and cloud
//!   jobs run behind one adapter trait with explicit `Unsupported` operations
//! - **Bounded** - a global and per-backend concurrency limit, a shared
//!   bandwidth cap and a bounded history log
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use transfer_engine::{Config, Source, SubmitRequest, TransferEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = TransferEngine::new(Config::default()).await?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     engine.start();
//!     engine
//!         .submit(SubmitRequest::new(
//!             Source::DirectUrl {
//!                 url: "https://example.com/file.iso".to_string(),
//!                 filename: None,
//!             },
//!             "alice",
//!         ))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Backend adapters (HTTP, torrent, Usenet, extractor, cloud)
pub mod backend;
/// Global bandwidth cap and per-task allotments
pub mod bandwidth;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Orchestration engine (decomposed into focused submodules)
pub mod engine;
/// Error types
pub mod error;
/// Archive extraction
pub mod extraction;
/// Bounded log of finished tasks
pub mod history;
/// Post-processing pipeline
pub mod post_processing;
mod registry;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;
/// Upload dispatch to destination stores
pub mod upload;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use backend::{
    BackendAdapter, BackendCapabilities, BackendHandle, BackendSet, BackendState, BackendStatus,
    TaskSpec,
};
pub use config::{Config, EngineConfig, PreemptionPolicy, RetryConfig};
pub use db::Database;
pub use engine::TransferEngine;
pub use error::{DatabaseError, Error, ErrorKind, Result, TaskError};
pub use post_processing::{MediaProbe, PostProcessor};
pub use types::{
    BackendKind, Destination, Event, HistoryEntry, HistoryFilter, PostProcessStage, Priority,
    Progress, QueueStats, Source, SubmitRequest, TaskId, TaskSnapshot, TaskState,
};
pub use upload::{LocalUploader, UploadDispatcher, UploadReference};

/// Run until SIGTERM/SIGINT (Ctrl+C elsewhere), then shut the engine down
///
/// Unfinished tasks are checkpointed by [`TransferEngine::shutdown`] and
/// re-attached on the next start.
///
/// # Example
///
/// ```no_run
/// use transfer_engine::{Config, TransferEngine, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = TransferEngine::new(Config::default()).await?;
///     engine.start();
///     run_with_shutdown(engine).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(engine: TransferEngine) -> Result<()> {
    let signal = wait_for_signal().await;
    tracing::info!(signal, "termination signal received, stopping engine");
    engine.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use futures::future::{FutureExt, select_all};
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments
    let mut streams: Vec<_> = [
        ("SIGTERM", SignalKind::terminate()),
        ("SIGINT", SignalKind::interrupt()),
    ]
    .into_iter()
    .filter_map(|(name, kind)| match signal(kind) {
        Ok(stream) => Some((name, stream)),
        Err(e) => {
            tracing::warn!(signal = name, error = %e, "could not register signal handler");
            None
        }
    })
    .collect();

    if streams.is_empty() {
        tokio::signal::ctrl_c().await.ok();
        return "ctrl-c";
    }
    let received = streams
        .iter_mut()
        .map(|(name, stream)| stream.recv().map(move |_| *name).boxed());
    select_all(received).await.0
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    }
    "ctrl-c"
}
