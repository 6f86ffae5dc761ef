//! Tasks module - Tracking of background video-generation jobs.
//!
//! ## Architecture
//!
//! - `TaskRegistry` - Authoritative state of in-flight jobs, recovered on start
//! - `PollingScheduler` - Single timer polling every active job
//! - `ProgressSynthesizer` - Smoothed, never-regressing progress per job
//! - `VideoGenerationApi` - Contract of the external generation service

mod api;
mod error;
mod model;
mod polling;
mod progress;
mod registry;

pub use api::VideoGenerationApi;
pub use error::{ApiError, TaskError};
pub use model::{GenerationParams, StatusReport, Task, TaskStatus, status_text};
pub use polling::{PollSummary, PollingScheduler, StartOptions, TaskEventHandler};
pub use progress::{ProgressListener, ProgressSample, ProgressSynthesizer, Subscription};
pub use registry::{DEFAULT_TERMINAL_RETENTION, RemovalHook, TaskRegistry, TaskStore, Transition};
