use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared "keep going" signal observed by every blocking wait.
///
/// Clones share the same flag; once stopped it never restarts.
#[derive(Debug, Clone)]
pub struct KeepGoing(Arc<AtomicBool>);

impl Default for KeepGoing {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepGoing {
    pub fn new() -> Self {
        KeepGoing(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}
