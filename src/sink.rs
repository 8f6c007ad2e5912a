//! Fire-and-forget event sink for profiling and operational logs.

use tracing::{debug, error, info, trace};

/// Receives timing and log events from the client and the session lock.
///
/// Implementations must not block and must never fail; sink calls have no influence on
/// control flow.
pub trait EventSink: Send + Sync {
    /// A command tagged `tag` is about to be sent.
    fn timer_start(&self, tag: &str);

    /// The command described by `description` completed.
    fn save_query(&self, description: &str, tag: &str);

    fn log_info(&self, category: &str, message: &str);

    fn log_error(&self, category: &str, message: &str);
}

/// Default sink. Forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn timer_start(&self, tag: &str) {
        trace!(tag, "timer start");
    }

    fn save_query(&self, description: &str, tag: &str) {
        debug!(tag, query = description, "query");
    }

    fn log_info(&self, category: &str, message: &str) {
        info!(category, "{}", message);
    }

    fn log_error(&self, category: &str, message: &str) {
        error!(category, "{}", message);
    }
}
