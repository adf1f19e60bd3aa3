//! Progress reporting callbacks for pipeline runs.
//!
//! Implement [`PipelineProgressCallback`] to receive notifications as stages
//! start and pages complete. All methods have no-op defaults, so an
//! implementation only overrides what it cares about. Callbacks run inline
//! on orchestration tasks; keep them fast and never block.

use crate::config::StageKind;
use crate::error::StageError;
use std::sync::Arc;

/// Observer for pipeline progress events.
pub trait PipelineProgressCallback: Send + Sync {
    /// A stage is about to dispatch `total_pages` pages.
    fn on_stage_start(&self, _stage: StageKind, _total_pages: usize) {}

    /// One page was dispatched to the stage's worker pool.
    fn on_page_start(&self, _stage: StageKind, _page_index: usize) {}

    /// One page finished the stage successfully.
    fn on_page_complete(&self, _stage: StageKind, _page_index: usize) {}

    /// One page exhausted its retries and was recorded as failed.
    fn on_page_error(&self, _stage: StageKind, _page_index: usize, _error: &StageError) {}

    /// The stage finished its batch. `passed` reflects the stage's
    /// success-fraction threshold over all attempted pages.
    fn on_stage_complete(&self, _stage: StageKind, _succeeded: usize, _failed: usize, _passed: bool) {
    }

    /// The whole run reached a terminal status.
    fn on_run_complete(&self, _succeeded: bool) {}
}

/// Callback that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Shared handle to a progress callback.
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
