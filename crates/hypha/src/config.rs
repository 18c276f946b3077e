/// Runtime-level configuration (buffer sizes, etc.)
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Initial capacity handed to newly created outbound buckets.
    ///
    /// A bucket holds messages headed for one destination mailbox until
    /// the next flush, so this is a batching hint, not a limit.
    pub initial_buffer_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            initial_buffer_capacity: 16,
        }
    }
}

impl RuntimeConfig {
    /// Set the initial outbound bucket capacity.
    pub fn with_initial_buffer_capacity(mut self, capacity: usize) -> Self {
        self.initial_buffer_capacity = capacity;
        self
    }
}
