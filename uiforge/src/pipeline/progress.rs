use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::types::{PipelineStep, StepStatus};

pub type ProgressCallback = Arc<dyn Fn(PipelineStep, StepStatus) + Send + Sync>;

/// Best-effort step reporting. A panicking callback is logged and ignored.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    pub fn new(callback: ProgressCallback) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    pub fn silent() -> Self {
        Self { callback: None }
    }

    pub fn report(&self, step: PipelineStep, status: StepStatus) {
        log::debug!("pipeline step {} -> {:?}", step, status);
        let Some(callback) = &self.callback else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| callback(step, status))).is_err() {
            log::warn!(
                "Progress callback panicked on {} ({:?}); continuing",
                step,
                status
            );
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
