//! Operator-facing notifications

use tracing::{error, info, warn};

/// Where the supervisor reports things the operator should see.
/// Messages are informational; a notifier never fails.
pub trait Notifier: Send + Sync {
    /// Something needs the operator's attention before recording can resume
    fn error(&self, message: &str);

    /// Recording was interrupted and will be retried
    fn warning(&self, message: &str);

    /// Short status line, e.g. "recording" or "idle"
    fn status(&self, status: &str) {
        let _ = status;
    }
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn error(&self, message: &str) {
        error!("{}", message);
    }

    fn warning(&self, message: &str) {
        warn!("{}", message);
    }

    fn status(&self, status: &str) {
        info!("Status: {}", status);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Notifier;
    use std::sync::Mutex;

    /// Keeps every message for assertions
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        pub errors: Mutex<Vec<String>>,
        pub warnings: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }

        fn warning(&self, message: &str) {
            self.warnings.lock().unwrap().push(message.to_string());
        }
    }
}
