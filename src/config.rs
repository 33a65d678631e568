/// Task queue configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Upper bound on tasks run by a single `run_until_stalled` call.
    /// `None` runs until the queue is empty.
    pub max_turns: Option<usize>,
    /// Log a warning when a rejected promise is dropped unobserved.
    pub report_unhandled_rejections: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_turns: None,
            report_unhandled_rejections: true,
        }
    }
}

impl QueueConfig {
    /// Cap the number of tasks a single run may execute.
    #[must_use]
    pub fn max_turns(mut self, limit: usize) -> Self {
        self.max_turns = Some(limit);
        self
    }

    /// Enable or disable unhandled rejection warnings.
    #[must_use]
    pub fn report_unhandled_rejections(mut self, report: bool) -> Self {
        self.report_unhandled_rejections = report;
        self
    }
}
