//! Scheduler configuration.

/// Hard cap on the number of worker threads a [`crate::scheduler::Scheduler`]
/// will ever spawn.
pub const MAX_CONCURRENCY: usize = 64;

/// Two-level scheduling priority. Queues drain the high band before the low
/// band whenever both are non-empty; there is no strict fairness guarantee
/// beyond that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Builder-driven configuration consumed by [`crate::scheduler::Scheduler::with_config`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub(crate) worker_count: Option<usize>,
    pub(crate) max_concurrency: usize,
    pub(crate) poll_budget: usize,
    pub(crate) default_priority: Priority,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            max_concurrency: MAX_CONCURRENCY,
            poll_budget: 0,
            default_priority: Priority::Normal,
        }
    }
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }
}

/// Builder for [`SchedulerConfig`].
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    /// Overrides the worker count. Defaults to
    /// `min(available_parallelism(), max_concurrency)`.
    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = Some(count);
        self
    }

    /// Overrides the compile-time-ish worker cap (default [`MAX_CONCURRENCY`]).
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.config.max_concurrency = max;
        self
    }

    /// Max events drained per reactor poll call. Zero means "use the
    /// resolved worker count".
    pub fn poll_budget(mut self, budget: usize) -> Self {
        self.config.poll_budget = budget;
        self
    }

    pub fn default_priority(mut self, priority: Priority) -> Self {
        self.config.default_priority = priority;
        self
    }

    pub fn build(self) -> SchedulerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_struct_default() {
        let built = SchedulerConfig::builder().build();
        let default = SchedulerConfig::default();
        assert_eq!(built.worker_count, default.worker_count);
        assert_eq!(built.max_concurrency, default.max_concurrency);
        assert_eq!(built.poll_budget, default.poll_budget);
        assert_eq!(built.default_priority, default.default_priority);
    }

    #[test]
    fn builder_overrides_apply() {
        let config = SchedulerConfig::builder()
            .worker_count(3)
            .max_concurrency(8)
            .poll_budget(16)
            .default_priority(Priority::High)
            .build();
        assert_eq!(config.worker_count, Some(3));
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.poll_budget, 16);
        assert_eq!(config.default_priority, Priority::High);
    }
}
